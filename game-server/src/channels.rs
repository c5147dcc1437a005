//! The pub/sub registry. Topics are value typed [`Channel`] addresses, each one
//! mapping connection uuids to subscriber records. One lock guards the whole
//! topic map; the fan out itself happens outside the lock so a slow peer never
//! blocks a mutation.

use crate::connection::Connection;
use futures_util::future::join_all;
use protocol::{Channel, Envelope, SUBSCRIBER_UPDATE, SubscriberTag, UserStatus};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One subscription of one connection to one channel.
pub struct Subscriber {
    pub connection: Arc<Connection>,
    /// Annotations the broadcast filters work on.
    pub tags: HashSet<SubscriberTag>,
}

impl Subscriber {
    fn passes(
        &self,
        whitelist: Option<&[SubscriberTag]>,
        blacklist: Option<&[SubscriberTag]>,
    ) -> bool {
        if let Some(required) = whitelist
            && !required.iter().any(|tag| self.tags.contains(tag))
        {
            return false;
        }
        if let Some(excluded) = blacklist
            && excluded.iter().any(|tag| self.tags.contains(tag))
        {
            return false;
        }
        true
    }
}

/// The shared subscriber storage.
#[derive(Default)]
pub struct SubscriberStorage {
    topics: Mutex<HashMap<Channel, HashMap<Uuid, Subscriber>>>,
}

impl SubscriberStorage {
    /// Adds a subscription, replacing an earlier one of the same connection.
    /// Watchers of the matching `subscriber_list` channel get informed.
    pub async fn subscribe(
        &self,
        connection: Arc<Connection>,
        channel: Channel,
        tags: HashSet<SubscriberTag>,
    ) {
        let user = connection.user.clone();
        {
            let mut topics = self.topics.lock().await;
            topics
                .entry(channel.clone())
                .or_default()
                .insert(connection.uuid, Subscriber { connection, tags });
        }
        self.notify_presence(&channel, user, true).await;
    }

    /// Drops one subscription of one connection.
    pub async fn unsubscribe(&self, uuid: Uuid, channel: &Channel) {
        let user = {
            let mut topics = self.topics.lock().await;
            let Some(subscribers) = topics.get_mut(channel) else {
                return;
            };
            let removed = subscribers.remove(&uuid);
            if subscribers.is_empty() {
                topics.remove(channel);
            }
            match removed {
                Some(subscriber) => subscriber.connection.user.clone(),
                None => return,
            }
        };
        self.notify_presence(channel, user, false).await;
    }

    /// Drops every subscription of a connection, called on disconnect.
    pub async fn fully_remove(&self, uuid: Uuid) {
        let mut affected: Vec<(Channel, Option<String>)> = Vec::new();
        {
            let mut topics = self.topics.lock().await;
            topics.retain(|channel, subscribers| {
                if let Some(subscriber) = subscribers.remove(&uuid) {
                    affected.push((channel.clone(), subscriber.connection.user.clone()));
                }
                !subscribers.is_empty()
            });
        }
        for (channel, user) in affected {
            self.notify_presence(&channel, user, false).await;
        }
    }

    /// Removes every subscription whose connection lost its writer task. This is
    /// a fallback sweep, disconnects should be handled by [`Self::fully_remove`].
    pub async fn sweep_closed(&self) {
        let mut dropped = 0usize;
        {
            let mut topics = self.topics.lock().await;
            topics.retain(|_, subscribers| {
                subscribers.retain(|_, subscriber| {
                    let alive = !subscriber.connection.is_closed();
                    if !alive {
                        dropped += 1;
                    }
                    alive
                });
                !subscribers.is_empty()
            });
        }
        if dropped > 0 {
            tracing::info!(dropped, "Swept subscriptions of closed connections.");
        }
    }

    /// Fans an event out to every eligible subscriber of the channel in
    /// parallel. Eligibility: at least one whitelist tag when a whitelist is
    /// given, and no blacklist tag.
    pub async fn broadcast(
        &self,
        event: &str,
        body: serde_json::Value,
        channel: &Channel,
        whitelist: Option<&[SubscriberTag]>,
        blacklist: Option<&[SubscriberTag]>,
    ) {
        let envelope = Envelope::on_channel(event, channel.clone(), body);
        let recipients: Vec<Arc<Connection>> = {
            let topics = self.topics.lock().await;
            let Some(subscribers) = topics.get(channel) else {
                return;
            };
            subscribers
                .values()
                .filter(|subscriber| subscriber.passes(whitelist, blacklist))
                .map(|subscriber| subscriber.connection.clone())
                .collect()
        };
        join_all(
            recipients
                .iter()
                .map(|connection| connection.send(&envelope)),
        )
        .await;
    }

    /// Checks if any connection of the user subscribes to the channel. Drives
    /// the callee-online decision for direct challenges.
    pub async fn has_user_subscriber(&self, user: &str, channel: &Channel) -> bool {
        let topics = self.topics.lock().await;
        topics.get(channel).is_some_and(|subscribers| {
            subscribers
                .values()
                .any(|subscriber| subscriber.connection.user.as_deref() == Some(user))
        })
    }

    /// The presence of a user inside a channel: across multiple connections the
    /// most active one wins, no connection at all means offline.
    pub async fn user_status(&self, user: &str, channel: &Channel) -> UserStatus {
        let connections: Vec<Arc<Connection>> = {
            let topics = self.topics.lock().await;
            match topics.get(channel) {
                Some(subscribers) => subscribers
                    .values()
                    .filter(|subscriber| subscriber.connection.user.as_deref() == Some(user))
                    .map(|subscriber| subscriber.connection.clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        let mut best = UserStatus::Offline;
        for connection in connections {
            best = best.max(connection.status().await);
        }
        best
    }

    /// Tells the watchers of `subscriber_list(channel)` that somebody came or went.
    async fn notify_presence(&self, channel: &Channel, user: Option<String>, present: bool) {
        let watcher_channel = Channel::SubscriberList {
            channel: Box::new(channel.clone()),
        };
        self.broadcast(
            SUBSCRIBER_UPDATE,
            json!({ "user": user, "present": present }),
            &watcher_channel,
            None,
            None,
        )
        .await;
    }
}
