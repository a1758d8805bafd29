//! Volatile per-command caches.
//!
//! Plain concurrent maps keyed by command id. No TTL and no size bound:
//! entries leave only when the manager removes them.

use dashmap::DashMap;

use crate::model::CommandId;

/// Thread-safe map from command id to `V`.
#[derive(Debug)]
pub struct Cache<V> {
    entries: DashMap<CommandId, V>,
}

impl<V: Clone> Default for Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> Cache<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert or overwrite.
    pub fn set(&self, id: CommandId, value: V) {
        self.entries.insert(id, value);
    }

    pub fn find(&self, id: CommandId) -> Option<V> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: CommandId) -> Option<V> {
        self.entries.remove(&id).map(|(_, value)| value)
    }

    /// Snapshot of every cached value. Shard locks are released on return.
    pub fn values(&self) -> Vec<V> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
