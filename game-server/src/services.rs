//! The seam towards the outer platform: persistence, rating math, challenge
//! handling and chat application notifications all live behind this trait. The
//! live game runtime only tells the outside what happened.

use crate::events::{GameHeader, OutcomeRecord};
use async_trait::async_trait;
use uuid::Uuid;

/// The normalized outward facing interface of the runtime.
#[async_trait]
pub trait ExternalServices: Send + Sync {
    /// A game was created and is live now.
    async fn game_started(&self, header: &GameHeader);

    /// A game reached its outcome. Persist, rate, announce.
    async fn game_finished(&self, header: &GameHeader, outcome: &OutcomeRecord);

    /// Auxiliary notifications (chat application messages etc.) about the game
    /// should disappear.
    async fn remove_game_notifications(&self, game_id: Uuid);

    /// Shutdown drain: every active challenge gets cancelled on its channels.
    async fn cancel_active_challenges(&self);
}

/// The do-nothing adapter, used stand alone and in tests.
pub struct NoopServices;

#[async_trait]
impl ExternalServices for NoopServices {
    async fn game_started(&self, header: &GameHeader) {
        tracing::debug!(game = %header.id, "No external service takes game starts.");
    }

    async fn game_finished(&self, header: &GameHeader, outcome: &OutcomeRecord) {
        tracing::debug!(game = %header.id, kind = ?outcome.kind, "No external service takes game ends.");
    }

    async fn remove_game_notifications(&self, game_id: Uuid) {
        tracing::debug!(game = %game_id, "No external service holds notifications.");
    }

    async fn cancel_active_challenges(&self) {
        tracing::debug!("No external service holds challenges.");
    }
}
