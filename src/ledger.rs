//! Per-key running counts and FIFO wait queues.

use std::collections::{HashMap, VecDeque};

/// Tracks, per concurrency key, how many tasks hold a slot and which task
/// IDs are waiting for one. Entries are pruned as soon as both the count
/// and the queue reach zero.
///
/// The ledger does no capacity checking itself: `acquire` increments
/// unconditionally and callers must have verified `running_count` against
/// the key's limit first, under the same lock.
#[derive(Debug, Default)]
pub struct ConcurrencyLedger {
    running: HashMap<String, usize>,
    queues: HashMap<String, VecDeque<String>>,
}

impl ConcurrencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots currently held for `key`.
    pub fn running_count(&self, key: &str) -> usize {
        self.running.get(key).copied().unwrap_or(0)
    }

    /// Append a task ID to the tail of `key`'s wait queue.
    pub fn enqueue(&mut self, key: &str, id: impl Into<String>) {
        self.queues.entry(key.to_string()).or_default().push_back(id.into());
    }

    /// Pop the head of `key`'s wait queue, if any.
    pub fn dequeue_next(&mut self, key: &str) -> Option<String> {
        let queue = self.queues.get_mut(key)?;
        let id = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(key);
        }
        id
    }

    /// Remove a specific queued ID (cancel before start). Returns whether
    /// the ID was present.
    pub fn remove(&mut self, key: &str, id: &str) -> bool {
        let Some(queue) = self.queues.get_mut(key) else {
            return false;
        };
        let Some(index) = queue.iter().position(|queued| queued == id) else {
            return false;
        };
        queue.remove(index);
        if queue.is_empty() {
            self.queues.remove(key);
        }
        true
    }

    /// Take a slot for `key`. Callers must have checked capacity already.
    pub fn acquire(&mut self, key: &str) {
        *self.running.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Return a slot for `key`, with a floor of zero. The entry is dropped
    /// once the count reaches zero.
    pub fn release(&mut self, key: &str) {
        let Some(count) = self.running.get_mut(key) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.running.remove(key);
        }
    }

    /// Number of task IDs waiting for a slot on `key`.
    pub fn queued_count(&self, key: &str) -> usize {
        self.queues.get(key).map(VecDeque::len).unwrap_or(0)
    }

    /// Every key with either a held slot or a non-empty queue.
    pub fn all_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .running
            .keys()
            .chain(self.queues.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let mut ledger = ConcurrencyLedger::new();
        assert_eq!(ledger.running_count("researcher"), 0);

        ledger.acquire("researcher");
        ledger.acquire("researcher");
        assert_eq!(ledger.running_count("researcher"), 2);

        ledger.release("researcher");
        assert_eq!(ledger.running_count("researcher"), 1);
        ledger.release("researcher");
        assert_eq!(ledger.running_count("researcher"), 0);
        assert!(ledger.all_keys().is_empty());
    }

    #[test]
    fn release_unacquired_is_noop() {
        let mut ledger = ConcurrencyLedger::new();
        ledger.release("ghost");
        assert_eq!(ledger.running_count("ghost"), 0);
        assert!(ledger.all_keys().is_empty());
    }

    #[test]
    fn queue_is_fifo() {
        let mut ledger = ConcurrencyLedger::new();
        ledger.enqueue("k", "a");
        ledger.enqueue("k", "b");
        ledger.enqueue("k", "c");
        assert_eq!(ledger.queued_count("k"), 3);

        assert_eq!(ledger.dequeue_next("k").as_deref(), Some("a"));
        assert_eq!(ledger.dequeue_next("k").as_deref(), Some("b"));
        assert_eq!(ledger.dequeue_next("k").as_deref(), Some("c"));
        assert_eq!(ledger.dequeue_next("k"), None);
        assert!(ledger.all_keys().is_empty());
    }

    #[test]
    fn remove_pulls_specific_id() {
        let mut ledger = ConcurrencyLedger::new();
        ledger.enqueue("k", "a");
        ledger.enqueue("k", "b");
        ledger.enqueue("k", "c");

        assert!(ledger.remove("k", "b"));
        assert!(!ledger.remove("k", "b"));
        assert_eq!(ledger.dequeue_next("k").as_deref(), Some("a"));
        assert_eq!(ledger.dequeue_next("k").as_deref(), Some("c"));
    }

    #[test]
    fn remove_last_id_prunes_entry() {
        let mut ledger = ConcurrencyLedger::new();
        ledger.enqueue("k", "only");
        assert!(ledger.remove("k", "only"));
        assert!(ledger.all_keys().is_empty());
    }

    #[test]
    fn all_keys_spans_running_and_queued() {
        let mut ledger = ConcurrencyLedger::new();
        ledger.acquire("running-key");
        ledger.enqueue("queued-key", "x");
        let keys = ledger.all_keys();
        assert_eq!(keys, vec!["queued-key".to_string(), "running-key".to_string()]);
    }
}
