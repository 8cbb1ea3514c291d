//! Topic matching and the two topic indices
//!
//! One trie maps wildcard filters to subscriber entries, a second maps
//! concrete topics to retained messages. Both are guarded by a read/write
//! lock: the publish hot path takes read locks, SUBSCRIBE/UNSUBSCRIBE take
//! write locks, so a publish observes a consistent snapshot of every
//! matching subscriber list.

mod pipes;
mod trie;
pub mod validation;

pub use pipes::PipeIndex;
pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::broker::PipeId;
use crate::protocol::{Properties, QoS};

/// A subscriber entry stored in the subscription trie
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Live pipe handle, or None while a persistent session is offline.
    /// Detached entries keep matching so publishes can be queued for the
    /// session; no entry ever names a dead pipe.
    pub pipe: Option<PipeId>,
    pub client_id: Arc<str>,
    /// Granted qos for this filter
    pub qos: QoS,
}

/// Live subscription index
#[derive(Debug, Default)]
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<Vec<Subscription>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Add a subscription. A duplicate entry for the same client replaces
    /// the previous one, so a re-subscribe updates the granted qos in
    /// place and a session resume swaps the detached entry for its new
    /// pipe.
    pub fn subscribe(&self, filter: &str, subscription: Subscription) {
        let mut trie = self.trie.write();
        match trie.get_mut(filter) {
            Some(subs) => {
                subs.retain(|s| s.client_id != subscription.client_id);
                subs.push(subscription);
            }
            None => {
                trie.insert(filter, vec![subscription]);
            }
        }
    }

    /// Remove one (pipe, filter) entry, pruning the path when it was the
    /// last user. Returns the removed entry.
    pub fn unsubscribe(&self, filter: &str, pipe: PipeId) -> Option<Subscription> {
        let mut trie = self.trie.write();
        let subs = trie.get_mut(filter)?;
        let position = subs.iter().position(|s| s.pipe == Some(pipe))?;
        let removed = subs.remove(position);
        if subs.is_empty() {
            trie.remove(filter);
        }
        Some(removed)
    }

    /// Detach a (pipe, filter) entry: the subscriber went offline but its
    /// session survives, so the entry keeps matching without a pipe.
    pub fn detach(&self, filter: &str, pipe: PipeId) -> bool {
        let mut trie = self.trie.write();
        let Some(subs) = trie.get_mut(filter) else {
            return false;
        };
        match subs.iter_mut().find(|s| s.pipe == Some(pipe)) {
            Some(sub) => {
                sub.pipe = None;
                true
            }
            None => false,
        }
    }

    /// Remove a client's entry regardless of pipe state; used when a
    /// cached session is discarded or expires.
    pub fn unsubscribe_client(&self, filter: &str, client_id: &str) -> Option<Subscription> {
        let mut trie = self.trie.write();
        let subs = trie.get_mut(filter)?;
        let position = subs.iter().position(|s| s.client_id.as_ref() == client_id)?;
        let removed = subs.remove(position);
        if subs.is_empty() {
            trie.remove(filter);
        }
        Some(removed)
    }

    /// All subscribers matching a concrete topic, one entry per matching
    /// (pipe, filter) pair, in deterministic trie-walk order.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let trie = self.trie.read();
        let mut result: SmallVec<[Subscription; 16]> = SmallVec::new();
        trie.matches(topic, |subs| {
            result.extend(subs.iter().cloned());
        });
        result
    }

    /// True when no subscriber is registered anywhere
    pub fn is_empty(&self) -> bool {
        self.trie.read().is_empty()
    }

    /// True when some trie node still holds an entry for `pipe`
    pub fn contains_pipe(&self, pipe: PipeId) -> bool {
        let trie = self.trie.read();
        let mut found = false;
        trie.for_each(|subs| {
            found |= subs.iter().any(|s| s.pipe == Some(pipe));
        });
        found
    }
}

/// A retained message: the last PUBLISH on a topic with the retain flag set
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub properties: Properties,
    pub timestamp: Instant,
}

/// Retained-message store, one entry per exact topic
#[derive(Debug, Default)]
pub struct RetainStore {
    trie: RwLock<TopicTrie<RetainedMessage>>,
}

impl RetainStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Store the retained message for `topic`, replacing any previous one
    pub fn insert(&self, topic: &str, message: RetainedMessage) {
        self.trie.write().insert(topic, message);
    }

    /// Tombstone: drop the retained message for `topic`
    pub fn remove(&self, topic: &str) -> Option<RetainedMessage> {
        self.trie.write().remove(topic)
    }

    /// All retained messages whose topic matches the wildcard `filter`,
    /// enumerated for a new subscriber.
    pub fn matches(&self, filter: &str) -> Vec<RetainedMessage> {
        let trie = self.trie.read();
        let mut result = Vec::new();
        trie.matches_filter(filter, |m| result.push(m.clone()));
        result
    }

    pub fn is_empty(&self) -> bool {
        self.trie.read().is_empty()
    }
}
