use indexmap::IndexMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// FIFO work queue holding at most one pending entry per key.
///
/// Enqueuing a key that is already pending replaces its payload but keeps its place
/// in line, so a burst of requests for the same key collapses into one entry carrying
/// the latest payload. Safe for many producers and one consumer.
#[derive(Debug)]
pub struct DedupQueue<K, V> {
    entries: Mutex<IndexMap<K, V>>,
}

impl<K: Hash + Eq, V> DedupQueue<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// Insert or replace.
    ///
    /// # Returns
    /// true if a pending entry for `key` was replaced
    pub fn enqueue(&self, key: K, value: V) -> bool {
        self.entries.lock().insert(key, value).is_some()
    }

    /// Remove and return the oldest entry, if any.
    pub fn try_dequeue(&self) -> Option<(K, V)> {
        self.entries.lock().shift_remove_index(0)
    }

    /// Remove and return the oldest entry, waiting for one to arrive.
    ///
    /// Polls every `poll_interval` while the queue is empty. Returns `None` once
    /// `cancel` fires.
    pub async fn dequeue(&self, poll_interval: Duration, cancel: &CancellationToken) -> Option<(K, V)> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(entry) = self.try_dequeue() {
                return Some(entry);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Look at the oldest entry without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&K, &V) -> R) -> Option<R> {
        let entries = self.entries.lock();
        entries.get_index(0).map(|(k, v)| f(k, v))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drop every pending entry, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let discarded = entries.len();
        entries.clear();
        discarded
    }
}

impl<K: Hash + Eq, V> Default for DedupQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
