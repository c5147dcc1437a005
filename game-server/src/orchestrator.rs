//! The game orchestrator. Every mutating operation on a game runs here, under
//! the game's single writer lock: validate against the projections, run the rule
//! engine, append the event plus its clock snapshot, then fan the result out.
//! Broadcasts happen inside the lock so the channel order matches the log order.

use crate::clock::TimeUpdate;
use crate::events::{
    ChatRecord, GameEventKind, GameHeader, GameLog, OfferRecord, OutcomeRecord, PlyRecord,
    RollbackRecord, TimeAddedRecord,
};
use crate::state::{AppState, GameHandle};
use chrono::{DateTime, Duration, Utc};
use engine::rules::{is_ply_possible, perform_ply};
use engine::{Color, Finality, Ply, parse_sip, serialize_sip};
use protocol::{
    Channel, GAME_ENDED, GAME_STARTED, NEW_ACTIVE_GAME, NEW_CHAT_MESSAGE, NEW_PLY,
    NEW_RECENT_GAME, OFFER_ACTION_PERFORMED, OfferAction, OfferKind, OutcomeKind, ROLLBACK,
    SERVER_SHUTDOWN, SubscriberTag, TIME_ADDED, TimeRemainders,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use thiserror::Error;
use uuid::Uuid;

/// A domain level rejection of a mutating operation. The game state is
/// unchanged whenever one of these comes back.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("game not found")]
    UnknownGame,
    #[error("it is not your turn")]
    OutOfTurn,
    #[error("the position moved on, current sip is {current_sip}")]
    StaleSip { current_sip: String },
    #[error("the ply is not legal, current sip is {current_sip}")]
    PlyInvalid { current_sip: String },
    #[error("no such offer is active")]
    OfferNotActive,
    #[error("the offer is already active")]
    OfferAlreadyActive,
    #[error("the offer is not allowed at this point of the game")]
    OfferTimingForbidden,
    #[error("the game has already ended")]
    GameAlreadyEnded,
    #[error("the game is driven by an external uploader")]
    GameIsExternal,
    #[error("the game is not driven by an external uploader")]
    GameIsInternal,
    #[error("you are not a player of this game")]
    NotAPlayer,
    #[error("the uploader token does not match the game")]
    UploaderMismatch,
    #[error("the game carries no fischer clock")]
    NoFischerClock,
    #[error("the configured time gift is not positive")]
    TimeAmountNotPositive,
    #[error("chat text must have between 1 and 500 characters")]
    ChatTextRejected,
    #[error("the server is shutting down")]
    ShuttingDown,
    #[error("stored position is corrupt: {0}")]
    CorruptPosition(#[from] engine::SipError),
}

/// The per game event channel.
pub fn game_channel(id: &Uuid) -> Channel {
    Channel::GameMain {
        game_id: id.to_string(),
    }
}

/// Serializes a payload into an envelope body. Our own records always
/// serialize, a failure is a bug worth a log line, not a crash.
pub(crate) fn json_body<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        tracing::error!(?err, "Could not serialize broadcast body.");
        serde_json::Value::Null
    })
}

/// Creates a game, announces it and hands its handle out. Refused while the
/// server drains.
pub async fn create_game(
    state: &Arc<AppState>,
    header: GameHeader,
) -> Result<Arc<GameHandle>, ProcessingError> {
    if state.is_draining() {
        return Err(ProcessingError::ShuttingDown);
    }
    let id = header.id;
    let handle = GameHandle::new(header.clone());
    state.insert_game(id, handle.clone()).await;

    let view = json_body(&handle.log.lock().await.view());
    let channel = game_channel(&id);
    state
        .subscribers
        .broadcast(GAME_STARTED, view.clone(), &channel, None, None)
        .await;
    state
        .subscribers
        .broadcast(NEW_ACTIVE_GAME, view.clone(), &Channel::GameList, None, None)
        .await;
    for player in [&header.white, &header.black] {
        state
            .subscribers
            .broadcast(
                GAME_STARTED,
                view.clone(),
                &Channel::PlayerStartedGames {
                    watched: player.clone(),
                },
                None,
                None,
            )
            .await;
    }
    state.services.game_started(&header).await;
    tracing::info!(game = %id, white = %header.white, black = %header.black, "Game created.");
    Ok(handle)
}

/// Appends one offer event and tells the game channel.
async fn append_offer(
    state: &Arc<AppState>,
    log: &mut GameLog,
    action: OfferAction,
    kind: OfferKind,
    author: Color,
) {
    let record = OfferRecord {
        action,
        offer_kind: kind,
        offer_author: author,
    };
    log.append(GameEventKind::Offer(record.clone()));
    state
        .subscribers
        .broadcast(
            OFFER_ACTION_PERFORMED,
            json_body(&record),
            &game_channel(&log.header.id),
            None,
            None,
        )
        .await;
}

/// Ends the game while its log lock is held: terminal record, final clock
/// snapshot, fan out, external hooks, shutdown drain check.
async fn end_game(
    state: &Arc<AppState>,
    log: &mut GameLog,
    kind: OutcomeKind,
    winner: Option<Color>,
    ended_at: DateTime<Utc>,
) -> OutcomeRecord {
    let id = log.header.id;
    if let Some(last) = log.latest_time_update().copied() {
        log.clock.push(last.ended(ended_at));
    }
    let outcome = OutcomeRecord {
        ended_at,
        kind,
        winner,
    };
    log.outcome = Some(outcome.clone());

    state.timeout_not_earlier_than.lock().await.remove(&id);
    state.retire_game(&id).await;

    let body = json!({
        "game_id": id,
        "outcome": json_body(&outcome),
        "time": log.latest_time_update(),
    });
    state
        .subscribers
        .broadcast(GAME_ENDED, body.clone(), &game_channel(&id), None, None)
        .await;
    state
        .subscribers
        .broadcast(NEW_RECENT_GAME, body, &Channel::GameList, None, None)
        .await;

    state.services.game_finished(&log.header, &outcome).await;
    state.services.remove_game_notifications(id).await;
    tracing::info!(game = %id, outcome = ?kind, ?winner, "Game ended.");

    if state.is_draining() && state.ongoing_fischer_count().await == 0 {
        state.shutdown.exit.notify_one();
    }
    outcome
}

/// Plans the next polled timeout check for the ticking side, or drops the
/// schedule entry when the clock is paused.
async fn reschedule_timeout(state: &Arc<AppState>, id: Uuid, snapshot: &TimeUpdate, grace_ms: i64) {
    let mut schedule = state.timeout_not_earlier_than.lock().await;
    match snapshot.ticking {
        Some(side) => {
            let due =
                snapshot.updated_at + Duration::milliseconds(snapshot.reserve(side) + grace_ms);
            schedule.insert(id, due);
        }
        None => {
            schedule.remove(&id);
        }
    }
}

/// Validates and appends one ply. Returns the outcome when the ply ended the
/// game, by the position, by repetition, by lack of progress or because the
/// clock ran out underneath it.
pub async fn append_ply(
    state: &Arc<AppState>,
    game: &Arc<GameHandle>,
    ply: Ply,
    original_sip: Option<String>,
    remainders: Option<TimeRemainders>,
    assumed_color: Option<Color>,
) -> Result<Option<OutcomeRecord>, ProcessingError> {
    let mut log = game.log.lock().await;
    if log.outcome.is_some() {
        return Err(ProcessingError::GameAlreadyEnded);
    }

    let prev_sip = log.current_sip();
    let new_ply_index = log.ply_cnt();
    let mover = engine::sip::side_to_move(&prev_sip)?;
    if let Some(assumed) = assumed_color
        && assumed != mover
    {
        return Err(ProcessingError::OutOfTurn);
    }
    if let Some(original) = &original_sip
        && *original != prev_sip
    {
        return Err(ProcessingError::StaleSip {
            current_sip: prev_sip,
        });
    }

    let position = parse_sip(&prev_sip)?;
    if !is_ply_possible(&position, &ply) {
        return Err(ProcessingError::PlyInvalid {
            current_sip: prev_sip,
        });
    }
    let effect = perform_ply(&position, &ply).map_err(|_| ProcessingError::PlyInvalid {
        current_sip: prev_sip.clone(),
    })?;
    let new_sip = serialize_sip(&effect.position);

    // A ply sweeps every offer that was still on the table, for live games.
    if !log.header.is_external() {
        for (kind, author) in log.active_offers() {
            append_offer(state, &mut log, OfferAction::Cancel, kind, author).await;
        }
    }

    let now = Utc::now();
    let mut snapshot = None;
    if let Some(fischer) = log.header.fischer {
        let grace_ms = log.header.timeout_grace_ms();
        let previous = log
            .latest_time_update()
            .copied()
            .unwrap_or_else(|| TimeUpdate::init(fischer.start_sec * 1000, now));
        let next = match remainders {
            Some(reported) => {
                TimeUpdate::from_remainders(&reported, new_ply_index, mover, now)
            }
            None => {
                match previous.after_ply(
                    new_ply_index,
                    mover,
                    fischer.increment_sec * 1000,
                    grace_ms,
                    now,
                ) {
                    Ok(next) => next,
                    Err(timeout) => {
                        // The mover was already out of time, the ply is void.
                        let outcome = end_game(
                            state,
                            &mut log,
                            OutcomeKind::Timeout,
                            Some(timeout.winner),
                            timeout.reached_at,
                        )
                        .await;
                        return Ok(Some(outcome));
                    }
                }
            }
        };
        log.clock.push(next);
        reschedule_timeout(state, log.header.id, &next, grace_ms).await;
        snapshot = Some(next);
    }

    let record = PlyRecord {
        ply_index: new_ply_index,
        ply,
        kind: effect.kind,
        moving_color: mover,
        moved_piece: effect.moving_piece,
        target_piece: effect.target_piece,
        sip_after: new_sip.clone(),
        is_cancelled: false,
        clock: snapshot,
    };
    log.append(GameEventKind::Ply(record.clone()));
    state
        .subscribers
        .broadcast(
            NEW_PLY,
            json_body(&record),
            &game_channel(&log.header.id),
            None,
            None,
        )
        .await;

    let outcome = match effect.position.finality() {
        Finality::Fatum { winner } => {
            Some(end_game(state, &mut log, OutcomeKind::Fatum, Some(winner), now).await)
        }
        Finality::Breakthrough { winner } => {
            Some(end_game(state, &mut log, OutcomeKind::Breakthrough, Some(winner), now).await)
        }
        Finality::Invalid => {
            // A legal ply can not produce this, see the rule engine tests.
            tracing::error!(game = %log.header.id, sip = %new_sip, "Ply produced an invalid position.");
            None
        }
        Finality::ValidNonFinal => {
            if log.repetition_count(&new_sip) >= 3 {
                Some(end_game(state, &mut log, OutcomeKind::Repetition, None, now).await)
            } else if log.progressive_ply_gap() >= 60 {
                Some(end_game(state, &mut log, OutcomeKind::NoProgress, None, now).await)
            } else {
                None
            }
        }
    };
    Ok(outcome)
}

/// Appends a chat message and fans it out. Spectator chatter stays away from
/// the playing pair.
pub async fn send_chat(
    state: &Arc<AppState>,
    game: &Arc<GameHandle>,
    author: &str,
    text: String,
) -> Result<(), ProcessingError> {
    let text = text.trim().to_string();
    let length = text.chars().count();
    if length == 0 || length > 500 {
        return Err(ProcessingError::ChatTextRejected);
    }
    let mut log = game.log.lock().await;
    let spectator = log.header.color_of(author).is_none();
    let record = ChatRecord {
        author: author.to_string(),
        text,
        spectator,
    };
    log.append(GameEventKind::Chat(record.clone()));
    let blacklist: Option<&[SubscriberTag]> =
        spectator.then_some(&[SubscriberTag::ParticipatingPlayer][..]);
    state
        .subscribers
        .broadcast(
            NEW_CHAT_MESSAGE,
            json_body(&record),
            &game_channel(&log.header.id),
            None,
            blacklist,
        )
        .await;
    Ok(())
}

/// Applies one offer action for a live game.
pub async fn offer_action(
    state: &Arc<AppState>,
    game: &Arc<GameHandle>,
    author: Color,
    kind: OfferKind,
    action: OfferAction,
) -> Result<(), ProcessingError> {
    let mut log = game.log.lock().await;
    if log.outcome.is_some() {
        return Err(ProcessingError::GameAlreadyEnded);
    }
    if log.header.is_external() {
        return Err(ProcessingError::GameIsExternal);
    }

    match action {
        OfferAction::Create => {
            if log.offer_active(kind, author) {
                return Err(ProcessingError::OfferAlreadyActive);
            }
            let earliest = match (kind, author) {
                (OfferKind::Draw, _) => 2,
                // A takeback needs an own ply to take back.
                (OfferKind::Takeback, Color::White) => 1,
                (OfferKind::Takeback, Color::Black) => 2,
            };
            if log.ply_cnt() < earliest {
                return Err(ProcessingError::OfferTimingForbidden);
            }
            if kind == OfferKind::Draw && log.offer_active(OfferKind::Draw, author.opposite()) {
                // Both sides want the draw, the second CREATE acts as the accept.
                append_offer(state, &mut log, OfferAction::Accept, kind, author.opposite())
                    .await;
                end_game(state, &mut log, OutcomeKind::DrawAgreement, None, Utc::now()).await;
                return Ok(());
            }
            append_offer(state, &mut log, OfferAction::Create, kind, author).await;
        }
        OfferAction::Cancel => {
            if !log.offer_active(kind, author) {
                return Err(ProcessingError::OfferNotActive);
            }
            append_offer(state, &mut log, OfferAction::Cancel, kind, author).await;
        }
        OfferAction::Decline => {
            if !log.offer_active(kind, author.opposite()) {
                return Err(ProcessingError::OfferNotActive);
            }
            append_offer(state, &mut log, OfferAction::Decline, kind, author.opposite()).await;
        }
        OfferAction::Accept => {
            if !log.offer_active(kind, author.opposite()) {
                return Err(ProcessingError::OfferNotActive);
            }
            append_offer(state, &mut log, OfferAction::Accept, kind, author.opposite()).await;
            match kind {
                OfferKind::Draw => {
                    end_game(state, &mut log, OutcomeKind::DrawAgreement, None, Utc::now())
                        .await;
                }
                OfferKind::Takeback => {
                    perform_rollback(state, &mut log, author.opposite()).await?;
                }
            }
        }
    }
    Ok(())
}

/// Rolls trailing plies back on behalf of the takeback author. Cancels every
/// competing offer first. When fewer trailing plies exist than the takeback
/// needs, the rollback is silently dropped.
async fn perform_rollback(
    state: &Arc<AppState>,
    log: &mut GameLog,
    requested_by: Color,
) -> Result<(), ProcessingError> {
    for (kind, author) in log.active_offers() {
        append_offer(state, log, OfferAction::Cancel, kind, author).await;
    }

    let side_to_move = log.side_to_move()?;
    let to_cancel = if requested_by == side_to_move { 1 } else { 2 };
    let Some((ply_cnt_before, ply_cnt_after)) = log.cancel_trailing_plies(to_cancel) else {
        if log.offer_active(OfferKind::Takeback, requested_by) {
            // Quietly neutralize the offer, nothing to announce.
            log.append(GameEventKind::Offer(OfferRecord {
                action: OfferAction::Cancel,
                offer_kind: OfferKind::Takeback,
                offer_author: requested_by,
            }));
        }
        return Ok(());
    };

    let now = Utc::now();
    if log.header.fischer.is_some()
        && let Some(base) = log.rollback_base_snapshot()
    {
        let ticking = if ply_cnt_after >= 2 {
            Some(log.side_to_move()?)
        } else {
            None
        };
        let snapshot = base.rolled_back(ticking, now);
        log.clock.push(snapshot);
        reschedule_timeout(state, log.header.id, &snapshot, log.header.timeout_grace_ms()).await;
    }

    let record = RollbackRecord {
        ply_cnt_before,
        ply_cnt_after,
        requested_by,
    };
    log.append(GameEventKind::Rollback(record.clone()));
    let body = json!({
        "updated_sip": log.current_sip(),
        "ply_cnt_before": ply_cnt_before,
        "ply_cnt_after": ply_cnt_after,
        "requested_by": requested_by,
        "time": log.latest_time_update(),
    });
    state
        .subscribers
        .broadcast(ROLLBACK, body, &game_channel(&log.header.id), None, None)
        .await;
    Ok(())
}

/// The rollback entry point of the external upload surface.
pub async fn external_rollback(
    state: &Arc<AppState>,
    game: &Arc<GameHandle>,
    requested_by: Color,
) -> Result<(), ProcessingError> {
    let mut log = game.log.lock().await;
    if log.outcome.is_some() {
        return Err(ProcessingError::GameAlreadyEnded);
    }
    perform_rollback(state, &mut log, requested_by).await
}

/// Gifts the configured amount of seconds to the opponent of the giver.
pub async fn add_time(
    state: &Arc<AppState>,
    game: &Arc<GameHandle>,
    giver: Color,
) -> Result<(), ProcessingError> {
    let seconds = state.config.read().await.rules.secs_added_manually;
    if seconds <= 0 {
        return Err(ProcessingError::TimeAmountNotPositive);
    }

    let mut log = game.log.lock().await;
    if log.outcome.is_some() {
        return Err(ProcessingError::GameAlreadyEnded);
    }
    let Some(previous) = log.latest_time_update().copied() else {
        return Err(ProcessingError::NoFischerClock);
    };

    let receiver = giver.opposite();
    let now = Utc::now();
    let snapshot = previous.with_time_added(receiver, seconds * 1000, now);
    log.clock.push(snapshot);
    reschedule_timeout(state, log.header.id, &snapshot, log.header.timeout_grace_ms()).await;

    let record = TimeAddedRecord {
        amount_seconds: seconds,
        receiver,
    };
    log.append(GameEventKind::TimeAdded(record.clone()));
    let body = json!({
        "amount_seconds": seconds,
        "receiver": receiver,
        "time": snapshot,
    });
    state
        .subscribers
        .broadcast(TIME_ADDED, body, &game_channel(&log.header.id), None, None)
        .await;
    Ok(())
}

/// A resignation before the second ply merely aborts the game.
pub async fn resign(
    state: &Arc<AppState>,
    game: &Arc<GameHandle>,
    client: Color,
) -> Result<OutcomeRecord, ProcessingError> {
    let mut log = game.log.lock().await;
    if log.outcome.is_some() {
        return Err(ProcessingError::GameAlreadyEnded);
    }
    let outcome = if log.ply_cnt() < 2 {
        end_game(state, &mut log, OutcomeKind::Abort, None, Utc::now()).await
    } else {
        end_game(
            state,
            &mut log,
            OutcomeKind::Resign,
            Some(client.opposite()),
            Utc::now(),
        )
        .await
    };
    Ok(outcome)
}

/// Ends a game with an outcome an external uploader reports.
pub async fn external_end(
    state: &Arc<AppState>,
    game: &Arc<GameHandle>,
    kind: OutcomeKind,
    winner: Option<Color>,
) -> Result<OutcomeRecord, ProcessingError> {
    let mut log = game.log.lock().await;
    if log.outcome.is_some() {
        return Err(ProcessingError::GameAlreadyEnded);
    }
    let winner = if kind.is_drawish() { None } else { winner };
    Ok(end_game(state, &mut log, kind, winner, Utc::now()).await)
}

/// The idempotent polled timeout check. Commits a TIMEOUT outcome when the
/// ticking side's reserve has run out, otherwise does nothing.
pub async fn check_timeout(
    state: &Arc<AppState>,
    game: &Arc<GameHandle>,
) -> Result<Option<OutcomeRecord>, ProcessingError> {
    let mut log = game.log.lock().await;
    if log.outcome.is_some() {
        return Ok(None);
    }
    let Some(latest) = log.latest_time_update().copied() else {
        return Ok(None);
    };
    let grace_ms = log.header.timeout_grace_ms();
    match latest.poll_timeout(grace_ms, Utc::now()) {
        Some(timeout) => {
            let outcome = end_game(
                state,
                &mut log,
                OutcomeKind::Timeout,
                Some(timeout.winner),
                timeout.reached_at,
            )
            .await;
            Ok(Some(outcome))
        }
        None => Ok(None),
    }
}

/// Puts the server into draining mode: announce, cancel the open challenges,
/// and arm the exit for the moment the last clocked game is over.
pub async fn begin_shutdown(state: &Arc<AppState>) {
    state.shutdown.draining.store(true, Ordering::SeqCst);
    tracing::warn!("Server drains, no new games are accepted.");
    state
        .subscribers
        .broadcast(
            SERVER_SHUTDOWN,
            json!({}),
            &Channel::Everyone,
            None,
            None,
        )
        .await;
    state.services.cancel_active_challenges().await;
    if state.ongoing_fischer_count().await == 0 {
        state.shutdown.exit.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FischerTimeControl, TimeControlKind};
    use crate::services::NoopServices;
    use engine::{Coord, Piece, PieceKind, PlyKind, Position};

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(Arc::new(NoopServices)))
    }

    fn blitz_header() -> GameHeader {
        GameHeader {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            white: "alice".into(),
            black: "bob".into(),
            rated: true,
            time_control_kind: TimeControlKind::Blitz,
            custom_starting_sip: None,
            external_uploader: None,
            fischer: Some(FischerTimeControl {
                start_sec: 180,
                increment_sec: 2,
            }),
        }
    }

    fn ply(from: (u8, u8), to: (u8, u8)) -> Ply {
        Ply {
            from: Coord::new(from.0, from.1).unwrap(),
            to: Coord::new(to.0, to.1).unwrap(),
            morph: None,
        }
    }

    /// Liberator jumps that bounce in and out without touching anything.
    const WHITE_OUT: ((u8, u8), (u8, u8)) = ((1, 0), (1, 2));
    const BLACK_OUT: ((u8, u8), (u8, u8)) = ((1, 5), (1, 3));
    const WHITE_BACK: ((u8, u8), (u8, u8)) = ((1, 2), (1, 0));
    const BLACK_BACK: ((u8, u8), (u8, u8)) = ((1, 3), (1, 5));

    async fn play(
        state: &Arc<AppState>,
        game: &Arc<GameHandle>,
        moves: &[((u8, u8), (u8, u8))],
    ) -> Option<OutcomeRecord> {
        let mut last = None;
        for (from, to) in moves {
            last = append_ply(state, game, ply(*from, *to), None, None, None)
                .await
                .unwrap();
        }
        last
    }

    #[tokio::test]
    async fn opening_plies_append_and_start_the_clock() {
        let state = test_state();
        let game = create_game(&state, blitz_header()).await.unwrap();
        play(&state, &game, &[WHITE_OUT, BLACK_OUT]).await;

        let log = game.log.lock().await;
        assert_eq!(log.ply_cnt(), 2);
        let latest = log.latest_time_update().unwrap();
        assert_eq!(latest.ticking, Some(Color::White));
        assert_eq!(latest.white_ms, 180_000);
    }

    #[tokio::test]
    async fn wrong_side_and_stale_sip_are_refused_without_a_trace() {
        let state = test_state();
        let game = create_game(&state, blitz_header()).await.unwrap();

        let refused = append_ply(
            &state,
            &game,
            ply(WHITE_OUT.0, WHITE_OUT.1),
            None,
            None,
            Some(Color::Black),
        )
        .await;
        assert_eq!(refused, Err(ProcessingError::OutOfTurn));

        let refused = append_ply(
            &state,
            &game,
            ply(WHITE_OUT.0, WHITE_OUT.1),
            Some("2!wAn!Bn".into()),
            None,
            None,
        )
        .await;
        assert!(matches!(refused, Err(ProcessingError::StaleSip { .. })));

        // An illegal ply reports the sip to resync against.
        let refused = append_ply(&state, &game, ply((0, 0), (8, 6)), None, None, None).await;
        assert!(matches!(refused, Err(ProcessingError::PlyInvalid { .. })));

        let log = game.log.lock().await;
        assert_eq!(log.events.len(), 0);
        assert_eq!(log.clock.len(), 1);
    }

    #[tokio::test]
    async fn capturing_the_intellector_ends_the_game_by_fatum() {
        let state = test_state();
        let mut position = Position::empty(Color::White);
        position.put(
            Coord::new(4, 0).unwrap(),
            Piece::new(PieceKind::Intellector, Color::White),
        );
        position.put(
            Coord::new(4, 6).unwrap(),
            Piece::new(PieceKind::Intellector, Color::Black),
        );
        position.put(
            Coord::new(4, 5).unwrap(),
            Piece::new(PieceKind::Progressor, Color::White),
        );
        let mut header = blitz_header();
        header.custom_starting_sip = Some(serialize_sip(&position));
        let game = create_game(&state, header).await.unwrap();

        let outcome = append_ply(&state, &game, ply((4, 5), (4, 6)), None, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Fatum);
        assert_eq!(outcome.winner, Some(Color::White));

        let log = game.log.lock().await;
        let record = log.ply_records().next().unwrap();
        assert_eq!(record.kind, PlyKind::Capture);
        assert_eq!(record.ply.morph, None);
        assert_eq!(
            log.latest_time_update().unwrap().reason,
            crate::clock::ClockReason::GameEnded
        );
        assert!(state.games.lock().await.is_empty());
    }

    #[tokio::test]
    async fn threefold_repetition_ends_the_game_without_a_winner() {
        let state = test_state();
        let game = create_game(&state, blitz_header()).await.unwrap();

        let cycle = [WHITE_OUT, BLACK_OUT, WHITE_BACK, BLACK_BACK];
        let mut outcome = None;
        'cycles: for _ in 0..3 {
            for step in cycle {
                outcome = play(&state, &game, &[step]).await;
                if outcome.is_some() {
                    break 'cycles;
                }
            }
        }
        let outcome = outcome.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Repetition);
        assert_eq!(outcome.winner, None);
        // The third visit of the first repeated position falls on ply index 8.
        assert_eq!(game.log.lock().await.ply_cnt(), 9);
    }

    #[tokio::test]
    async fn takeback_across_the_move_boundary_cancels_two_plies() {
        let state = test_state();
        let game = create_game(&state, blitz_header()).await.unwrap();
        play(&state, &game, &[WHITE_OUT, BLACK_OUT, WHITE_BACK]).await;
        let sip_after_first = {
            let log = game.log.lock().await;
            log.ply_records().next().unwrap().sip_after.clone()
        };

        offer_action(
            &state,
            &game,
            Color::White,
            OfferKind::Takeback,
            OfferAction::Create,
        )
        .await
        .unwrap();
        offer_action(
            &state,
            &game,
            Color::Black,
            OfferKind::Takeback,
            OfferAction::Accept,
        )
        .await
        .unwrap();

        let log = game.log.lock().await;
        assert_eq!(log.ply_cnt(), 1);
        assert_eq!(log.current_sip(), sip_after_first);
        let rollback = log
            .events
            .iter()
            .find_map(|event| match &event.kind {
                GameEventKind::Rollback(record) => Some(record),
                _ => None,
            })
            .unwrap();
        assert_eq!(rollback.ply_cnt_before, 3);
        assert_eq!(rollback.ply_cnt_after, 1);
        assert_eq!(rollback.requested_by, Color::White);
        let latest = log.latest_time_update().unwrap();
        assert_eq!(latest.reason, crate::clock::ClockReason::Rollback);
        assert_eq!(latest.ticking, None);
    }

    #[tokio::test]
    async fn second_draw_create_acts_as_the_accept() {
        let state = test_state();
        let game = create_game(&state, blitz_header()).await.unwrap();
        play(&state, &game, &[WHITE_OUT, BLACK_OUT]).await;

        offer_action(
            &state,
            &game,
            Color::White,
            OfferKind::Draw,
            OfferAction::Create,
        )
        .await
        .unwrap();
        offer_action(
            &state,
            &game,
            Color::Black,
            OfferKind::Draw,
            OfferAction::Create,
        )
        .await
        .unwrap();

        let log = game.log.lock().await;
        let outcome = log.outcome.as_ref().unwrap();
        assert_eq!(outcome.kind, OutcomeKind::DrawAgreement);
        assert_eq!(outcome.winner, None);
    }

    #[tokio::test]
    async fn offers_are_timed_and_idempotent() {
        let state = test_state();
        let game = create_game(&state, blitz_header()).await.unwrap();

        // No draw before the second ply, no black takeback before black moved.
        let early = offer_action(
            &state,
            &game,
            Color::White,
            OfferKind::Draw,
            OfferAction::Create,
        )
        .await;
        assert_eq!(early, Err(ProcessingError::OfferTimingForbidden));
        play(&state, &game, &[WHITE_OUT]).await;
        let early = offer_action(
            &state,
            &game,
            Color::Black,
            OfferKind::Takeback,
            OfferAction::Create,
        )
        .await;
        assert_eq!(early, Err(ProcessingError::OfferTimingForbidden));

        // White may ask for a takeback now, but only once.
        offer_action(
            &state,
            &game,
            Color::White,
            OfferKind::Takeback,
            OfferAction::Create,
        )
        .await
        .unwrap();
        let again = offer_action(
            &state,
            &game,
            Color::White,
            OfferKind::Takeback,
            OfferAction::Create,
        )
        .await;
        assert_eq!(again, Err(ProcessingError::OfferAlreadyActive));

        let missing = offer_action(
            &state,
            &game,
            Color::White,
            OfferKind::Draw,
            OfferAction::Cancel,
        )
        .await;
        assert_eq!(missing, Err(ProcessingError::OfferNotActive));
    }

    #[tokio::test]
    async fn a_ply_sweeps_the_open_offers() {
        let state = test_state();
        let game = create_game(&state, blitz_header()).await.unwrap();
        play(&state, &game, &[WHITE_OUT, BLACK_OUT]).await;

        offer_action(
            &state,
            &game,
            Color::White,
            OfferKind::Draw,
            OfferAction::Create,
        )
        .await
        .unwrap();
        assert!(game.log.lock().await.offer_active(OfferKind::Draw, Color::White));

        play(&state, &game, &[WHITE_BACK]).await;
        assert!(!game.log.lock().await.offer_active(OfferKind::Draw, Color::White));
    }

    #[tokio::test]
    async fn early_resignation_aborts_instead() {
        let state = test_state();
        let game = create_game(&state, blitz_header()).await.unwrap();
        play(&state, &game, &[WHITE_OUT]).await;

        let outcome = resign(&state, &game, Color::Black).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Abort);
        assert_eq!(outcome.winner, None);

        let state = test_state();
        let game = create_game(&state, blitz_header()).await.unwrap();
        play(&state, &game, &[WHITE_OUT, BLACK_OUT]).await;
        let outcome = resign(&state, &game, Color::White).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Resign);
        assert_eq!(outcome.winner, Some(Color::Black));
    }

    #[tokio::test]
    async fn nothing_mutates_an_ended_game() {
        let state = test_state();
        let game = create_game(&state, blitz_header()).await.unwrap();
        play(&state, &game, &[WHITE_OUT, BLACK_OUT]).await;
        resign(&state, &game, Color::White).await.unwrap();

        let events_before = game.log.lock().await.events.len();
        assert_eq!(
            append_ply(&state, &game, ply(WHITE_BACK.0, WHITE_BACK.1), None, None, None).await,
            Err(ProcessingError::GameAlreadyEnded)
        );
        assert_eq!(
            offer_action(
                &state,
                &game,
                Color::White,
                OfferKind::Draw,
                OfferAction::Create
            )
            .await,
            Err(ProcessingError::GameAlreadyEnded)
        );
        assert_eq!(
            add_time(&state, &game, Color::White).await,
            Err(ProcessingError::GameAlreadyEnded)
        );
        assert_eq!(
            resign(&state, &game, Color::White).await,
            Err(ProcessingError::GameAlreadyEnded)
        );
        assert_eq!(game.log.lock().await.events.len(), events_before);
    }

    #[tokio::test]
    async fn time_gift_lands_on_the_opponent() {
        let state = test_state();
        let game = create_game(&state, blitz_header()).await.unwrap();
        play(&state, &game, &[WHITE_OUT, BLACK_OUT, WHITE_BACK]).await;

        add_time(&state, &game, Color::White).await.unwrap();
        let log = game.log.lock().await;
        let latest = log.latest_time_update().unwrap();
        assert_eq!(latest.reason, crate::clock::ClockReason::TimeAdded);
        assert_eq!(latest.black_ms, 180_000 + 15_000);
        assert_eq!(latest.ticking, Some(Color::Black));
    }

    #[tokio::test]
    async fn polled_check_commits_the_timeout() {
        let state = test_state();
        let mut header = blitz_header();
        header.fischer = Some(FischerTimeControl {
            start_sec: 30,
            increment_sec: 0,
        });
        let game = create_game(&state, header).await.unwrap();
        play(&state, &game, &[WHITE_OUT, BLACK_OUT, WHITE_BACK]).await;

        // Nothing due yet.
        assert_eq!(check_timeout(&state, &game).await.unwrap(), None);

        // Re-date the latest snapshot as if half a minute had passed.
        {
            let mut log = game.log.lock().await;
            let last = log.clock.last_mut().unwrap();
            last.updated_at -= Duration::seconds(31);
        }
        let outcome = check_timeout(&state, &game).await.unwrap().unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Timeout);
        assert_eq!(outcome.winner, Some(Color::White));

        // The second poll finds the game over and stays silent.
        assert_eq!(check_timeout(&state, &game).await.unwrap(), None);
        assert!(
            state
                .timeout_not_earlier_than
                .lock()
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn external_append_takes_the_reported_reserves() {
        let state = test_state();
        let mut header = blitz_header();
        header.external_uploader = Some("relay-token".into());
        let game = create_game(&state, header).await.unwrap();

        let outcome = append_ply(
            &state,
            &game,
            ply(WHITE_OUT.0, WHITE_OUT.1),
            None,
            Some(TimeRemainders {
                white_ms: 58_000,
                black_ms: 60_000,
            }),
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome, None);

        let log = game.log.lock().await;
        let latest = log.latest_time_update().unwrap();
        assert_eq!(latest.white_ms, 58_000);
        assert_eq!(latest.black_ms, 60_000);
        assert_eq!(latest.ticking, None);
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_last_clocked_game() {
        let state = test_state();
        let game = create_game(&state, blitz_header()).await.unwrap();
        begin_shutdown(&state).await;

        assert!(state.is_draining());
        assert_eq!(
            create_game(&state, blitz_header()).await.err(),
            Some(ProcessingError::ShuttingDown)
        );

        resign(&state, &game, Color::White).await.unwrap();
        // The drain notification must be armed now.
        tokio::time::timeout(
            std::time::Duration::from_millis(50),
            state.shutdown.exit.notified(),
        )
        .await
        .unwrap();
    }
}
