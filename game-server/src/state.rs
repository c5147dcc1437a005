//! The application state: the ongoing and recently finished games, the
//! subscriber storage, the token table and the shutdown latch.

use crate::channels::SubscriberStorage;
use crate::config::ServerConfig;
use crate::events::{GameHeader, GameLog};
use crate::services::ExternalServices;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

/// One hosted game. The mutex makes every mutating operation on the game a
/// single writer transaction, broadcasts happen inside it so the channel order
/// matches the event order.
pub struct GameHandle {
    /// Mirrored from the header so map lookups never need the log lock. The
    /// ending path holds a log lock while it takes the map locks, so nothing
    /// may lock a log while holding a map lock.
    pub id: Uuid,
    /// Whether the game runs under a Fischer clock.
    pub clocked: bool,
    pub log: Mutex<GameLog>,
}

impl GameHandle {
    pub fn new(header: GameHeader) -> Arc<GameHandle> {
        Arc::new(GameHandle {
            id: header.id,
            clocked: header.fischer.is_some(),
            log: Mutex::new(GameLog::new(header)),
        })
    }
}

/// The bijective token table. A token names exactly one user and a user holds
/// at most one token.
#[derive(Default)]
pub struct TokenMap {
    token_to_user: HashMap<String, String>,
    user_to_token: HashMap<String, String>,
}

impl TokenMap {
    /// Inserts a pair, refusing when either side is already taken.
    pub fn insert(&mut self, token: String, user: String) -> bool {
        if self.token_to_user.contains_key(&token) || self.user_to_token.contains_key(&user) {
            return false;
        }
        self.token_to_user.insert(token.clone(), user.clone());
        self.user_to_token.insert(user, token);
        true
    }

    pub fn user_of(&self, token: &str) -> Option<&String> {
        self.token_to_user.get(token)
    }

    pub fn token_of(&self, user: &str) -> Option<&String> {
        self.user_to_token.get(user)
    }
}

/// The shutdown latch: once draining, no new games start, and when the last
/// ongoing Fischer game ends the exit gets notified.
#[derive(Default)]
pub struct Shutdown {
    pub draining: AtomicBool,
    pub exit: Notify,
}

/// The shared application state.
pub struct AppState {
    pub config: RwLock<ServerConfig>,
    /// The games currently in progress.
    pub games: Mutex<HashMap<Uuid, Arc<GameHandle>>>,
    /// Finished games, newest first.
    pub recent: Mutex<Vec<Arc<GameHandle>>>,
    pub subscribers: SubscriberStorage,
    pub tokens: Mutex<TokenMap>,
    /// Optimistic schedule for the polled timeout check per game, cleared when a
    /// game ends.
    pub timeout_not_earlier_than: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    pub shutdown: Shutdown,
    pub services: Arc<dyn ExternalServices>,
}

impl AppState {
    pub fn new(services: Arc<dyn ExternalServices>) -> AppState {
        AppState {
            config: RwLock::new(ServerConfig::default()),
            games: Mutex::new(HashMap::new()),
            recent: Mutex::new(Vec::new()),
            subscribers: SubscriberStorage::default(),
            tokens: Mutex::new(TokenMap::default()),
            timeout_not_earlier_than: Mutex::new(HashMap::new()),
            shutdown: Shutdown::default(),
            services,
        }
    }

    pub async fn game(&self, id: &Uuid) -> Option<Arc<GameHandle>> {
        self.games.lock().await.get(id).cloned()
    }

    /// An ended game is also looked up, most recently finished first.
    pub async fn game_anywhere(&self, id: &Uuid) -> Option<Arc<GameHandle>> {
        if let Some(handle) = self.game(id).await {
            return Some(handle);
        }
        self.recent
            .lock()
            .await
            .iter()
            .find(|handle| handle.id == *id)
            .cloned()
    }

    pub async fn insert_game(&self, id: Uuid, handle: Arc<GameHandle>) {
        self.games.lock().await.insert(id, handle);
    }

    /// Moves a game from the ongoing map to the front of the recent list.
    pub async fn retire_game(&self, id: &Uuid) {
        let removed = self.games.lock().await.remove(id);
        if let Some(handle) = removed {
            self.recent.lock().await.insert(0, handle);
        }
    }

    /// The amount of ongoing games with a running Fischer clock. Correspondence
    /// games carry no clock and never block a shutdown.
    pub async fn ongoing_fischer_count(&self) -> usize {
        self.games
            .lock()
            .await
            .values()
            .filter(|handle| handle.clocked)
            .count()
    }

    pub fn is_draining(&self) -> bool {
        self.shutdown.draining.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FischerTimeControl, TimeControlKind};
    use crate::services::NoopServices;
    use std::time::Duration;

    fn clocked_header() -> GameHeader {
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
    async fn lookups_never_wait_on_a_held_game_log() {
        let state = AppState::new(Arc::new(NoopServices));
        let game = GameHandle::new(clocked_header());
        let id = game.id;
        state.insert_game(id, game.clone()).await;

        // The ending path holds a log lock while it touches the maps, so the
        // map side must get along without log locks.
        let _held = game.log.lock().await;
        let result = tokio::time::timeout(Duration::from_secs(2), async {
            (
                state.game_anywhere(&id).await.is_some(),
                state.ongoing_fischer_count().await,
            )
        })
        .await
        .unwrap();
        assert_eq!(result, (true, 1));
    }

    #[tokio::test]
    async fn retiring_keeps_the_game_reachable() {
        let state = AppState::new(Arc::new(NoopServices));
        let game = GameHandle::new(clocked_header());
        let id = game.id;
        state.insert_game(id, game.clone()).await;
        state.retire_game(&id).await;

        assert_eq!(state.ongoing_fischer_count().await, 0);
        assert!(state.game(&id).await.is_none());
        assert!(state.game_anywhere(&id).await.is_some());
    }

    #[test]
    fn token_table_is_bijective() {
        let mut tokens = TokenMap::default();
        assert!(tokens.insert("t1".into(), "alice".into()));
        // Same token for another user and another token for the same user both fail.
        assert!(!tokens.insert("t1".into(), "bob".into()));
        assert!(!tokens.insert("t2".into(), "alice".into()));
        assert_eq!(tokens.user_of("t1"), Some(&"alice".to_string()));
        assert_eq!(tokens.token_of("alice"), Some(&"t1".to_string()));
        assert_eq!(tokens.user_of("t2"), None);
    }
}
