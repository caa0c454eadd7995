//! # Subscription Registry
//!
//! Maps topic patterns to the subscriptions registered under them. Lookups
//! take shard read locks only, so concurrent publishes never block each other;
//! subscribe/unsubscribe lock the one shard holding the affected pattern.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::handler::EventHandler;
use super::mailbox::Mailbox;
use super::topic::TopicPattern;

/// Handle returned by `subscribe`, used to `unsubscribe`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle {
    id: Uuid,
    subscriber_id: String,
    pattern: String,
}

impl SubscriptionHandle {
    /// Unique subscription id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Owner of the subscription
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Pattern the subscription was registered with
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Identifies the receiving end of one delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberRef {
    pub subscription_id: Uuid,
    pub subscriber_id: String,
}

/// A registered interest, with its delivery queue
pub(crate) struct Subscription {
    pub(crate) id: Uuid,
    /// Registration order, used to keep resolution deterministic
    pub(crate) seq: u64,
    pub(crate) pattern: TopicPattern,
    pub(crate) subscriber_id: String,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) mailbox: Mailbox,
}

impl Subscription {
    pub(crate) fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            id: self.id,
            subscriber_id: self.subscriber_id.clone(),
            pattern: self.pattern.as_str().to_string(),
        }
    }

    pub(crate) fn subscriber(&self) -> SubscriberRef {
        SubscriberRef {
            subscription_id: self.id,
            subscriber_id: self.subscriber_id.clone(),
        }
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    by_pattern: DashMap<String, Vec<Arc<Subscription>>>,
    /// subscription id -> pattern key
    index: DashMap<Uuid, String>,
    next_seq: AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Make a subscription visible to lookups
    ///
    /// Duplicates of the same (pattern, subscriber) pair are kept side by side.
    /// The index entry is written last: once `remove` can find an id, the
    /// subscription is already in its pattern list.
    pub(crate) fn insert(&self, subscription: Arc<Subscription>) {
        let key = subscription.pattern.as_str().to_string();
        let id = subscription.id;
        self.by_pattern.entry(key.clone()).or_default().push(subscription);
        self.index.insert(id, key);
    }

    /// Remove a subscription; `None` if it was already gone
    pub(crate) fn remove(&self, id: &Uuid) -> Option<Arc<Subscription>> {
        let (_, key) = self.index.remove(id)?;

        let removed = {
            let mut entry = self.by_pattern.get_mut(&key)?;
            let position = entry.iter().position(|s| s.id == *id)?;
            entry.remove(position)
        };
        self.by_pattern.remove_if(&key, |_, subs| subs.is_empty());
        Some(removed)
    }

    /// Subscriptions whose pattern matches the split topic, in registration order
    pub(crate) fn resolve(&self, topic: &[&str]) -> Vec<Arc<Subscription>> {
        let mut matched: Vec<Arc<Subscription>> = Vec::new();
        for entry in self.by_pattern.iter() {
            let subs = entry.value();
            let Some(first) = subs.first() else { continue };
            if first.pattern.matches_segments(topic) {
                matched.extend(subs.iter().cloned());
            }
        }
        matched.sort_by_key(|s| s.seq);
        matched
    }

    /// Remove every subscription (used at shutdown)
    pub(crate) fn drain(&self) -> Vec<Arc<Subscription>> {
        let ids: Vec<Uuid> = self.index.iter().map(|e| *e.key()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }
}
