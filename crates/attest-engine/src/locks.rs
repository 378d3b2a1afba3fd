//! Per-key async mutual exclusion.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A table of async mutexes, one per key, created on demand.
///
/// Holding the guard returned by [`KeyedLocks::lock`] excludes every other
/// holder of the same key; different keys never contend.
pub struct KeyedLocks<K: Eq + Hash + Clone> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop table entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
        before - self.locks.len()
    }

    /// Number of keys currently in the table.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
