//! Pipe index
//!
//! Reverse index from pipe id to the topic filters that pipe currently
//! holds, so teardown on disconnect is one lookup instead of a walk over
//! the whole topic index. Invariant: the filters listed here for a pipe are
//! exactly the trie nodes containing that pipe's subscriber entries.

use dashmap::DashMap;

use crate::broker::PipeId;

#[derive(Debug, Default)]
pub struct PipeIndex {
    filters: DashMap<PipeId, Vec<String>>,
}

impl PipeIndex {
    pub fn new() -> Self {
        Self {
            filters: DashMap::new(),
        }
    }

    /// Record that `pipe` holds `filter`; idempotent per (pipe, filter)
    pub fn insert(&self, pipe: PipeId, filter: &str) {
        let mut entry = self.filters.entry(pipe).or_default();
        if !entry.iter().any(|f| f == filter) {
            entry.push(filter.to_string());
        }
    }

    /// Forget one filter; returns false when the pair was not recorded
    pub fn remove(&self, pipe: PipeId, filter: &str) -> bool {
        let removed = match self.filters.get_mut(&pipe) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|f| f != filter);
                entry.len() != before
            }
            None => false,
        };
        self.filters.remove_if(&pipe, |_, v| v.is_empty());
        removed
    }

    /// All filters currently held by `pipe`
    pub fn filters(&self, pipe: PipeId) -> Vec<String> {
        self.filters
            .get(&pipe)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Remove every record for `pipe`, returning the filters it held
    pub fn drop_pipe(&self, pipe: PipeId) -> Vec<String> {
        self.filters.remove(&pipe).map(|(_, v)| v).unwrap_or_default()
    }

    pub fn contains(&self, pipe: PipeId) -> bool {
        self.filters.contains_key(&pipe)
    }
}
