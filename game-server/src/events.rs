//! The event sourced game model. A game is an immutable header plus an append
//! only event list and at most one outcome record. Everything a client sees,
//! current SIP, active offers, repetition counts, is a projection derived by
//! scanning the events, so the events stay the single source of truth.

use crate::clock::TimeUpdate;
use chrono::{DateTime, Utc};
use engine::{Color, Piece, PieceKind, Ply, PlyKind, Position, serialize_sip};
use protocol::{OfferAction, OfferKind, OutcomeKind, TimeRemainders};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The rough speed class a game was created under.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeControlKind {
    Hyperbullet,
    Bullet,
    Blitz,
    Rapid,
    Classic,
    Correspondence,
}

impl TimeControlKind {
    /// The label as it travels on the wire, used by the listing filter.
    pub fn label(&self) -> &'static str {
        match self {
            TimeControlKind::Hyperbullet => "HYPERBULLET",
            TimeControlKind::Bullet => "BULLET",
            TimeControlKind::Blitz => "BLITZ",
            TimeControlKind::Rapid => "RAPID",
            TimeControlKind::Classic => "CLASSIC",
            TimeControlKind::Correspondence => "CORRESPONDENCE",
        }
    }
}

/// Start reserve plus increment per ply, both in seconds.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub struct FischerTimeControl {
    pub start_sec: i64,
    pub increment_sec: i64,
}

/// The immutable part of a game, fixed at creation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GameHeader {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub white: String,
    pub black: String,
    pub rated: bool,
    pub time_control_kind: TimeControlKind,
    /// The SIP the game starts from, when it is not the default arrangement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_starting_sip: Option<String>,
    /// Set for games whose moves an outside system pushes over HTTP. Such games
    /// refuse all live interactive paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_uploader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fischer: Option<FischerTimeControl>,
}

impl GameHeader {
    pub fn is_external(&self) -> bool {
        self.external_uploader.is_some()
    }

    /// The SIP the ply chain starts from.
    pub fn starting_sip(&self) -> String {
        self.custom_starting_sip
            .clone()
            .unwrap_or_else(|| serialize_sip(&Position::initial()))
    }

    /// The color a user plays in this game, if the user plays at all.
    pub fn color_of(&self, user: &str) -> Option<Color> {
        if self.white == user {
            Some(Color::White)
        } else if self.black == user {
            Some(Color::Black)
        } else {
            None
        }
    }

    pub fn player(&self, color: Color) -> &str {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    /// How deep a reserve may dip below zero before a timeout is committed.
    /// External uploads come over variable latency networks and get a minute.
    pub fn timeout_grace_ms(&self) -> i64 {
        if self.is_external() { 60_000 } else { 0 }
    }
}

/// One executed half move.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlyRecord {
    pub ply_index: u32,
    #[serde(flatten)]
    pub ply: Ply,
    pub kind: PlyKind,
    pub moving_color: Color,
    pub moved_piece: Piece,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_piece: Option<Piece>,
    pub sip_after: String,
    /// The only field of any event that is ever touched after append, set by a
    /// rollback.
    pub is_cancelled: bool,
    /// The clock snapshot taken together with this ply, for Fischer games.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<TimeUpdate>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatRecord {
    pub author: String,
    pub text: String,
    pub spectator: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OfferRecord {
    pub action: OfferAction,
    pub offer_kind: OfferKind,
    pub offer_author: Color,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimeAddedRecord {
    pub amount_seconds: i64,
    pub receiver: Color,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RollbackRecord {
    pub ply_cnt_before: u32,
    pub ply_cnt_after: u32,
    pub requested_by: Color,
}

/// The terminal record of a game. Once present, every further mutating
/// operation is refused.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct OutcomeRecord {
    pub ended_at: DateTime<Utc>,
    pub kind: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<Color>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event_kind", rename_all = "snake_case")]
pub enum GameEventKind {
    Ply(PlyRecord),
    Chat(ChatRecord),
    Offer(OfferRecord),
    TimeAdded(TimeAddedRecord),
    Rollback(RollbackRecord),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GameEvent {
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: GameEventKind,
}

impl GameEvent {
    pub fn now(kind: GameEventKind) -> GameEvent {
        GameEvent {
            occurred_at: Utc::now(),
            kind,
        }
    }
}

/// The full in-memory state of one game.
#[derive(Debug, Clone)]
pub struct GameLog {
    pub header: GameHeader,
    pub events: Vec<GameEvent>,
    /// All clock snapshots in append order, starting with INIT for Fischer games.
    pub clock: Vec<TimeUpdate>,
    pub outcome: Option<OutcomeRecord>,
}

impl GameLog {
    pub fn new(header: GameHeader) -> GameLog {
        let clock = header
            .fischer
            .map(|fischer| vec![TimeUpdate::init(fischer.start_sec * 1000, Utc::now())])
            .unwrap_or_default();
        GameLog {
            header,
            events: Vec::new(),
            clock,
            outcome: None,
        }
    }

    /// All non-cancelled ply records in append order.
    pub fn ply_records(&self) -> impl Iterator<Item = &PlyRecord> {
        self.events.iter().filter_map(|event| match &event.kind {
            GameEventKind::Ply(record) if !record.is_cancelled => Some(record),
            _ => None,
        })
    }

    fn last_ply(&self) -> Option<&PlyRecord> {
        self.ply_records().last()
    }

    /// One past the index of the last non-cancelled ply, zero for a fresh game.
    pub fn ply_cnt(&self) -> u32 {
        self.last_ply().map(|record| record.ply_index + 1).unwrap_or(0)
    }

    /// The SIP after the last non-cancelled ply, or the starting SIP.
    pub fn current_sip(&self) -> String {
        self.last_ply()
            .map(|record| record.sip_after.clone())
            .unwrap_or_else(|| self.header.starting_sip())
    }

    /// The side that makes the next ply.
    pub fn side_to_move(&self) -> Result<Color, engine::SipError> {
        engine::sip::side_to_move(&self.current_sip())
    }

    /// An offer of `(kind, author)` is active iff its CREATE actions outnumber
    /// all its other actions over the whole history.
    pub fn offer_active(&self, kind: OfferKind, author: Color) -> bool {
        let mut creates = 0usize;
        let mut others = 0usize;
        for event in &self.events {
            if let GameEventKind::Offer(record) = &event.kind
                && record.offer_kind == kind
                && record.offer_author == author
            {
                if record.action == OfferAction::Create {
                    creates += 1;
                } else {
                    others += 1;
                }
            }
        }
        creates > others
    }

    /// Every `(kind, author)` pair with a currently active offer.
    pub fn active_offers(&self) -> Vec<(OfferKind, Color)> {
        let mut active = Vec::new();
        for kind in [OfferKind::Draw, OfferKind::Takeback] {
            for author in [Color::White, Color::Black] {
                if self.offer_active(kind, author) {
                    active.push((kind, author));
                }
            }
        }
        active
    }

    /// How often the given SIP was reached by a non-cancelled ply. Three times
    /// means the game ends by repetition.
    pub fn repetition_count(&self, sip: &str) -> usize {
        self.ply_records()
            .filter(|record| record.sip_after == sip)
            .count()
    }

    /// The amount of non-cancelled plies since the last progressive one, where
    /// progressive means a real capture or any progressor move. Sixty quiet
    /// plies end the game without progress.
    pub fn progressive_ply_gap(&self) -> u32 {
        let mut gap = 0u32;
        for record in self.ply_records() {
            let progressive = (record.target_piece.is_some() && record.kind != PlyKind::Swap)
                || record.moved_piece.kind == PieceKind::Progressor;
            if progressive {
                gap = 0;
            } else {
                gap += 1;
            }
        }
        gap
    }

    pub fn latest_time_update(&self) -> Option<&TimeUpdate> {
        self.clock.last()
    }

    /// The clock snapshot a rollback falls back onto: the one of the new last
    /// ply, or INIT when the game rolled back to the start.
    pub fn rollback_base_snapshot(&self) -> Option<TimeUpdate> {
        self.last_ply()
            .and_then(|record| record.clock)
            .or_else(|| self.clock.first().copied())
    }

    /// Marks the trailing `count` non-cancelled plies as cancelled. Returns the
    /// ply counts before and after, or `None` when fewer plies exist than asked.
    pub fn cancel_trailing_plies(&mut self, count: usize) -> Option<(u32, u32)> {
        let before = self.ply_cnt();
        let targets: Vec<usize> = self
            .events
            .iter()
            .enumerate()
            .filter(|(_, event)| {
                matches!(&event.kind, GameEventKind::Ply(record) if !record.is_cancelled)
            })
            .map(|(position, _)| position)
            .collect();
        if targets.len() < count {
            return None;
        }
        for position in targets.into_iter().rev().take(count) {
            if let GameEventKind::Ply(record) = &mut self.events[position].kind {
                record.is_cancelled = true;
            }
        }
        Some((before, self.ply_cnt()))
    }

    pub fn append(&mut self, kind: GameEventKind) {
        self.events.push(GameEvent::now(kind));
    }

    /// The public projection of the whole game, served over HTTP and as the
    /// `refresh.game.main` payload.
    pub fn view(&self) -> GameView {
        GameView {
            header: self.header.clone(),
            current_sip: self.current_sip(),
            ply_cnt: self.ply_cnt(),
            events: self.events.clone(),
            active_offers: self
                .active_offers()
                .into_iter()
                .map(|(kind, author)| ActiveOffer { kind, author })
                .collect(),
            time: self.latest_time_update().copied(),
            outcome: self.outcome.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActiveOffer {
    pub kind: OfferKind,
    pub author: Color,
}

/// Everything a client needs to render a game.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GameView {
    #[serde(flatten)]
    pub header: GameHeader,
    pub current_sip: String,
    pub ply_cnt: u32,
    pub events: Vec<GameEvent>,
    pub active_offers: Vec<ActiveOffer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeRecord>,
}

/// The request body an external uploader submits a ply with.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExternalPly {
    #[serde(flatten)]
    pub ply: Ply,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_sip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moving_color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remainders: Option<TimeRemainders>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::Coord;

    pub fn blitz_header() -> GameHeader {
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

    fn quiet_ply(index: u32, sip: &str) -> GameEventKind {
        GameEventKind::Ply(PlyRecord {
            ply_index: index,
            ply: Ply {
                from: Coord::new(0, 1).unwrap(),
                to: Coord::new(0, 2).unwrap(),
                morph: None,
            },
            kind: PlyKind::Normal,
            moving_color: if index % 2 == 0 {
                Color::White
            } else {
                Color::Black
            },
            moved_piece: Piece::new(PieceKind::Dominator, Color::White),
            target_piece: None,
            sip_after: sip.into(),
            is_cancelled: false,
            clock: None,
        })
    }

    #[test]
    fn fresh_log_projects_the_starting_arrangement() {
        let log = GameLog::new(blitz_header());
        assert_eq!(log.ply_cnt(), 0);
        assert_eq!(log.current_sip(), serialize_sip(&Position::initial()));
        assert_eq!(log.side_to_move(), Ok(Color::White));
        assert_eq!(log.clock.len(), 1);
    }

    #[test]
    fn cancelled_plies_vanish_from_the_projections() {
        let mut log = GameLog::new(blitz_header());
        log.append(quiet_ply(0, "2!bA"));
        log.append(quiet_ply(1, "2!wB"));
        log.append(quiet_ply(2, "2!bC"));
        assert_eq!(log.ply_cnt(), 3);

        let (before, after) = log.cancel_trailing_plies(2).unwrap();
        assert_eq!((before, after), (3, 1));
        assert_eq!(log.current_sip(), "2!bA");
        // The event list itself keeps its length.
        assert_eq!(log.events.len(), 3);
    }

    #[test]
    fn cancelling_more_plies_than_exist_is_refused() {
        let mut log = GameLog::new(blitz_header());
        log.append(quiet_ply(0, "2!bA"));
        assert_eq!(log.cancel_trailing_plies(2), None);
        assert_eq!(log.ply_cnt(), 1);
    }

    #[test]
    fn offer_activity_counts_creates_against_the_rest() {
        let mut log = GameLog::new(blitz_header());
        let offer = |action| {
            GameEventKind::Offer(OfferRecord {
                action,
                offer_kind: OfferKind::Draw,
                offer_author: Color::White,
            })
        };
        assert!(!log.offer_active(OfferKind::Draw, Color::White));
        log.append(offer(OfferAction::Create));
        assert!(log.offer_active(OfferKind::Draw, Color::White));
        log.append(offer(OfferAction::Decline));
        assert!(!log.offer_active(OfferKind::Draw, Color::White));
        log.append(offer(OfferAction::Create));
        assert!(log.offer_active(OfferKind::Draw, Color::White));
        assert_eq!(log.active_offers(), vec![(OfferKind::Draw, Color::White)]);
    }

    #[test]
    fn repetition_counts_only_non_cancelled_plies() {
        let mut log = GameLog::new(blitz_header());
        log.append(quiet_ply(0, "2!bA"));
        log.append(quiet_ply(1, "2!bA"));
        log.append(quiet_ply(2, "2!bA"));
        assert_eq!(log.repetition_count("2!bA"), 3);
        log.cancel_trailing_plies(1).unwrap();
        assert_eq!(log.repetition_count("2!bA"), 2);
    }

    #[test]
    fn quiet_plies_grow_the_progressive_gap() {
        let mut log = GameLog::new(blitz_header());
        log.append(quiet_ply(0, "2!bA"));
        log.append(quiet_ply(1, "2!wB"));
        assert_eq!(log.progressive_ply_gap(), 2);

        // A capture resets the gap.
        log.append(GameEventKind::Ply(PlyRecord {
            target_piece: Some(Piece::new(PieceKind::Liberator, Color::Black)),
            kind: PlyKind::Capture,
            ..match quiet_ply(2, "2!bD") {
                GameEventKind::Ply(record) => record,
                _ => unreachable!(),
            }
        }));
        assert_eq!(log.progressive_ply_gap(), 0);
    }
}
