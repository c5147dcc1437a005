//! The per connection wrapper. Every websocket gets one of these, holding the
//! outbound channel towards its writer task and the two activity timestamps the
//! presence reduction in the channel registry works on.

use chrono::{DateTime, Utc};
use protocol::{CHANNEL_BUFFER_SIZE, Envelope, UserStatus};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Above one minute of inbound silence the user counts as offline.
const SILENCE_OFFLINE_MS: i64 = 60_000;
/// Above five minutes without front end activity the user counts as away.
const IDLE_AWAY_MS: i64 = 300_000;

/// One live duplex connection.
pub struct Connection {
    pub uuid: Uuid,
    /// The authenticated user, `None` for anonymous spectators.
    pub user: Option<String>,
    outbound: mpsc::Sender<String>,
    /// Advanced by ping beats only, mirrors front end cursor and keyboard activity.
    last_activity: Mutex<DateTime<Utc>>,
    /// Advanced by any inbound traffic.
    last_message: Mutex<DateTime<Utc>>,
}

impl Connection {
    /// Builds a connection plus the receiving end its writer task drains.
    pub fn new(user: Option<String>) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (outbound, receiver) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let now = Utc::now();
        let connection = Arc::new(Connection {
            uuid: Uuid::new_v4(),
            user,
            outbound,
            last_activity: Mutex::new(now),
            last_message: Mutex::new(now),
        });
        (connection, receiver)
    }

    /// Queues an envelope for delivery. A full or closed channel only yields a
    /// log line, a dying peer must never stall a broadcast.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(?err, "Could not serialize outbound envelope.");
                return false;
            }
        };
        self.send_raw(text).await
    }

    /// Queues an already framed text message.
    pub async fn send_raw(&self, text: String) -> bool {
        if let Err(err) = self.outbound.try_send(text) {
            tracing::debug!(connection = %self.uuid, ?err, "Dropping message for gone connection.");
            return false;
        }
        true
    }

    /// Checks if the writer side of this connection is gone.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Any inbound frame counts against the silence threshold.
    pub async fn note_message(&self) {
        *self.last_message.lock().await = Utc::now();
    }

    /// A ping beat advances the activity cursor monotonically, clamped into
    /// `[previous, now]` so a client can neither rewind nor post date itself.
    pub async fn note_ping(&self, reported: Option<DateTime<Utc>>) {
        let now = Utc::now();
        let mut last_activity = self.last_activity.lock().await;
        let candidate = reported.unwrap_or(now);
        *last_activity = candidate.max(*last_activity).min(now);
    }

    /// Mutating intents prove the user is really there.
    pub async fn note_mutation(&self) {
        let now = Utc::now();
        *self.last_activity.lock().await = now;
        *self.last_message.lock().await = now;
    }

    /// Reduces the two timestamps to a presence status at the given wall time.
    pub async fn status_at(&self, now: DateTime<Utc>) -> UserStatus {
        let last_message = *self.last_message.lock().await;
        let last_activity = *self.last_activity.lock().await;
        if (now - last_message).num_milliseconds() > SILENCE_OFFLINE_MS {
            UserStatus::Offline
        } else if (now - last_activity).num_milliseconds() > IDLE_AWAY_MS {
            UserStatus::Away
        } else {
            UserStatus::Online
        }
    }

    pub async fn status(&self) -> UserStatus {
        self.status_at(Utc::now()).await
    }
}
