//! The live event surface. Every websocket gets a writer task draining the
//! connection's outbound channel and a reader task interpreting the JSON
//! framed intents. When either task runs to completion, the other is aborted
//! and the subscriptions of the connection are removed.

use crate::connection::Connection;
use crate::events::GameHeader;
use crate::orchestrator::{self, ProcessingError, game_channel, json_body};
use crate::state::{AppState, GameHandle};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::DateTime;
use engine::{Color, Ply};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{
    ADD_TIME, Channel, ChatIntent, ERROR, Envelope, ErrorBody, ErrorKind, GameIntent,
    OfferIntent, PERFORM_OFFER_ACTION, PING, PLY, PingIntent, PlyIntent, RESIGN,
    SEND_CHAT_MESSAGE, SUBSCRIBE, SubscriberTag, UNSUBSCRIBE,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Upgrades the request and resolves the optional token to a user. A token the
/// server does not know is refused, no token means an anonymous spectator.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket(socket, state, query.token))
}

async fn websocket(stream: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let (mut sender, receiver) = stream.split();

    let user = match token {
        Some(token) => match state.tokens.lock().await.user_of(&token).cloned() {
            Some(user) => Some(user),
            None => {
                let refusal = Envelope::event(
                    ERROR,
                    json_body(&ErrorBody {
                        error: ErrorKind::AuthError,
                        details: "unknown token".into(),
                    }),
                );
                if let Ok(text) = serde_json::to_string(&refusal) {
                    let _ = sender.send(Message::Text(text.into())).await;
                }
                return;
            }
        },
        None => None,
    };

    let (connection, outbound) = Connection::new(user);
    let timeout_ms = state.config.read().await.keep_alive.timeout_ms;
    tracing::info!(connection = %connection.uuid, user = ?connection.user, "Connection opened.");

    let mut send_task = tokio::spawn(write_loop(sender, outbound));
    let reader_connection = connection.clone();
    let reader_state = state.clone();
    let mut receive_task = tokio::spawn(async move {
        read_loop(receiver, reader_state, reader_connection, timeout_ms).await
    });

    // If any one of the tasks run to completion, we abort the other.
    let result = tokio::select! {
        res_a = &mut send_task => {receive_task.abort(); res_a},
        res_b = &mut receive_task => {send_task.abort(); res_b},
    };
    let reason = result.unwrap_or_else(|err| {
        tracing::error!(?err, "Internal panic in connection handling.");
        "Internal panic in connection handling."
    });

    state.subscribers.fully_remove(connection.uuid).await;
    tracing::info!(connection = %connection.uuid, reason, "Connection closed.");
}

/// Drains the outbound channel of the connection into the socket.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: Receiver<String>,
) -> &'static str {
    while let Some(text) = outbound.recv().await {
        if sender.send(Message::Text(text.into())).await.is_err() {
            return "Connection lost.";
        }
    }
    "Internal channel closed."
}

/// Interprets inbound frames until the peer goes away or stays silent beyond
/// the keep alive timeout.
async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    state: Arc<AppState>,
    connection: Arc<Connection>,
    timeout_ms: u64,
) -> &'static str {
    loop {
        let frame =
            tokio::time::timeout(Duration::from_millis(timeout_ms), receiver.next()).await;
        match frame {
            Err(_) => return "Keep alive timeout.",
            Ok(None) | Ok(Some(Err(_))) => return "Connection lost.",
            Ok(Some(Ok(Message::Text(text)))) => {
                connection.note_message().await;
                handle_frame(&state, &connection, text.as_str()).await;
            }
            Ok(Some(Ok(Message::Close(_)))) => return "Client closed the connection.",
            Ok(Some(Ok(_))) => {} // Pings and pongs are handled by axum itself.
        }
    }
}

/// What went wrong with one inbound frame.
enum WsError {
    Validation(String),
    Auth(&'static str),
    Processing(ProcessingError),
    /// An invalid ply additionally earns a state dump to resync against.
    InvalidPly { game_id: Uuid, details: String },
}

impl From<ProcessingError> for WsError {
    fn from(err: ProcessingError) -> WsError {
        WsError::Processing(err)
    }
}

async fn handle_frame(state: &Arc<AppState>, connection: &Arc<Connection>, text: &str) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            report(connection, ErrorKind::ValidationError, err.to_string()).await;
            return;
        }
    };

    let result = dispatch(state, connection, envelope).await;
    if let Err(err) = result {
        match err {
            WsError::Validation(details) => {
                report(connection, ErrorKind::ValidationError, details).await;
            }
            WsError::Auth(details) => {
                report(connection, ErrorKind::AuthError, details.to_string()).await;
            }
            WsError::Processing(err) => {
                report(connection, ErrorKind::ProcessingError, err.to_string()).await;
            }
            WsError::InvalidPly { game_id, details } => {
                report(connection, ErrorKind::ProcessingError, details).await;
                if let Some(game) = state.game_anywhere(&game_id).await {
                    let view = json_body(&game.log.lock().await.view());
                    connection
                        .send(&Envelope::refresh(game_channel(&game_id), view))
                        .await;
                }
            }
        }
    }
}

async fn report(connection: &Connection, kind: ErrorKind, details: String) {
    let body = ErrorBody {
        error: kind,
        details,
    };
    connection.send(&Envelope::event(ERROR, json_body(&body))).await;
}

fn parse_body<T: serde::de::DeserializeOwned>(body: serde_json::Value) -> Result<T, WsError> {
    serde_json::from_value(body).map_err(|err| WsError::Validation(err.to_string()))
}

fn parse_game_id(raw: &str) -> Result<Uuid, WsError> {
    Uuid::parse_str(raw).map_err(|err| WsError::Validation(err.to_string()))
}

async fn dispatch(
    state: &Arc<AppState>,
    connection: &Arc<Connection>,
    envelope: Envelope,
) -> Result<(), WsError> {
    match envelope.event.as_str() {
        PING => {
            let intent: PingIntent = parse_body(envelope.body)?;
            let reported = intent
                .last_activity
                .and_then(|seconds| DateTime::from_timestamp(seconds, 0));
            connection.note_ping(reported).await;
            connection.send_raw("pong".into()).await;
            Ok(())
        }
        SUBSCRIBE => {
            let channel = envelope
                .channel
                .ok_or_else(|| WsError::Validation("subscribe needs a channel".into()))?;
            let tags = subscription_tags(state, connection, &channel).await;
            state
                .subscribers
                .subscribe(connection.clone(), channel.clone(), tags)
                .await;
            let body = refresh_body(state, &channel).await;
            connection.send(&Envelope::refresh(channel, body)).await;
            Ok(())
        }
        UNSUBSCRIBE => {
            let channel = envelope
                .channel
                .ok_or_else(|| WsError::Validation("unsubscribe needs a channel".into()))?;
            state.subscribers.unsubscribe(connection.uuid, &channel).await;
            Ok(())
        }
        PLY => {
            let intent: PlyIntent = parse_body(envelope.body)?;
            let (game, color) = live_game_of(state, connection, &intent.game_id).await?;
            connection.note_mutation().await;
            let ply = Ply {
                from: intent.from,
                to: intent.to,
                morph: intent.morph_into,
            };
            let game_id = game.id;
            orchestrator::append_ply(
                state,
                &game,
                ply,
                intent.original_sip,
                None,
                Some(color),
            )
            .await
            .map_err(|err| match err {
                ProcessingError::PlyInvalid { .. } | ProcessingError::StaleSip { .. } => {
                    WsError::InvalidPly {
                        game_id,
                        details: err.to_string(),
                    }
                }
                other => WsError::Processing(other),
            })?;
            Ok(())
        }
        SEND_CHAT_MESSAGE => {
            let intent: ChatIntent = parse_body(envelope.body)?;
            let user = authenticated(connection)?;
            let id = parse_game_id(&intent.game_id)?;
            let game = state
                .game_anywhere(&id)
                .await
                .ok_or(ProcessingError::UnknownGame)?;
            connection.note_mutation().await;
            orchestrator::send_chat(state, &game, &user, intent.text).await?;
            Ok(())
        }
        PERFORM_OFFER_ACTION => {
            let intent: OfferIntent = parse_body(envelope.body)?;
            let (game, color) = live_game_of(state, connection, &intent.game_id).await?;
            connection.note_mutation().await;
            orchestrator::offer_action(state, &game, color, intent.offer_kind, intent.action)
                .await?;
            Ok(())
        }
        ADD_TIME => {
            let intent: GameIntent = parse_body(envelope.body)?;
            let (game, color) = live_game_of(state, connection, &intent.game_id).await?;
            connection.note_mutation().await;
            orchestrator::add_time(state, &game, color).await?;
            Ok(())
        }
        RESIGN => {
            let intent: GameIntent = parse_body(envelope.body)?;
            let (game, color) = live_game_of(state, connection, &intent.game_id).await?;
            connection.note_mutation().await;
            orchestrator::resign(state, &game, color).await?;
            Ok(())
        }
        unknown => {
            tracing::warn!(event = unknown, "Unknown inbound event.");
            report(connection, ErrorKind::UnknownEvent, unknown.to_string()).await;
            Ok(())
        }
    }
}

fn authenticated(connection: &Connection) -> Result<String, WsError> {
    connection
        .user
        .clone()
        .ok_or(WsError::Auth("this intent needs a token"))
}

/// Resolves a live interactive game together with the caller's color in it.
async fn live_game_of(
    state: &Arc<AppState>,
    connection: &Connection,
    raw_id: &str,
) -> Result<(Arc<GameHandle>, Color), WsError> {
    let user = authenticated(connection)?;
    let id = parse_game_id(raw_id)?;
    let game = state
        .game(&id)
        .await
        .ok_or(ProcessingError::UnknownGame)?;
    let (color, external) = {
        let log = game.log.lock().await;
        (log.header.color_of(&user), log.header.is_external())
    };
    if external {
        return Err(ProcessingError::GameIsExternal.into());
    }
    let color = color.ok_or(ProcessingError::NotAPlayer)?;
    Ok((game, color))
}

/// The playing pair of a game channel gets tagged, so spectator chatter can be
/// routed around it.
async fn subscription_tags(
    state: &Arc<AppState>,
    connection: &Connection,
    channel: &Channel,
) -> HashSet<SubscriberTag> {
    let mut tags = HashSet::new();
    if let Channel::GameMain { game_id } = channel
        && let Some(user) = &connection.user
        && let Ok(id) = Uuid::parse_str(game_id)
        && let Some(game) = state.game_anywhere(&id).await
        && game.log.lock().await.header.color_of(user).is_some()
    {
        tags.insert(SubscriberTag::ParticipatingPlayer);
    }
    tags
}

/// The synthetic state dump a fresh subscriber receives.
async fn refresh_body(state: &Arc<AppState>, channel: &Channel) -> serde_json::Value {
    match channel {
        Channel::GameMain { game_id } => {
            let Ok(id) = Uuid::parse_str(game_id) else {
                return serde_json::Value::Null;
            };
            match state.game_anywhere(&id).await {
                Some(game) => json_body(&game.log.lock().await.view()),
                None => serde_json::Value::Null,
            }
        }
        Channel::GameList => {
            // Snapshot the handles before locking any log. The ending path
            // holds a log lock while it takes the map locks.
            let current_handles: Vec<Arc<GameHandle>> =
                state.games.lock().await.values().cloned().collect();
            let recent_handles: Vec<Arc<GameHandle>> =
                state.recent.lock().await.iter().take(50).cloned().collect();
            let mut current = Vec::new();
            for handle in current_handles {
                current.push(header_summary(&handle.log.lock().await.header));
            }
            let mut recent = Vec::new();
            for handle in recent_handles {
                recent.push(header_summary(&handle.log.lock().await.header));
            }
            json!({ "current": current, "recent": recent })
        }
        _ => serde_json::Value::Null,
    }
}

fn header_summary(header: &GameHeader) -> serde_json::Value {
    json!({
        "id": header.id,
        "white": header.white,
        "black": header.black,
        "rated": header.rated,
        "time_control_kind": header.time_control_kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FischerTimeControl, TimeControlKind};
    use crate::services::NoopServices;
    use chrono::Utc;

    fn blitz_header() -> GameHeader {
        GameHeader {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            white: "alice".into(),
            black: "bob".into(),
            rated: false,
            time_control_kind: TimeControlKind::Blitz,
            custom_starting_sip: None,
            external_uploader: None,
            fischer: Some(FischerTimeControl {
                start_sec: 180,
                increment_sec: 2,
            }),
        }
    }

    #[tokio::test]
    async fn game_list_refresh_survives_a_concurrently_ending_game() {
        let state = Arc::new(AppState::new(Arc::new(NoopServices)));
        let game = GameHandle::new(blitz_header());
        let id = game.id;
        state.insert_game(id, game.clone()).await;

        // The ending path retires the game while its log lock is held.
        let retiring_state = state.clone();
        let retiring = tokio::spawn(async move {
            let _log = game.log.lock().await;
            retiring_state.retire_game(&id).await;
        });
        let listing_state = state.clone();
        let listing =
            tokio::spawn(async move { refresh_body(&listing_state, &Channel::GameList).await });

        let body = tokio::time::timeout(Duration::from_secs(2), async {
            retiring.await.unwrap();
            listing.await.unwrap()
        })
        .await
        .unwrap();
        assert!(body.is_object());
    }
}
