//! Outbound replication queue.
//!
//! Local writes enqueue a [`Mutation`] here for the push-replication path.
//! The queue is a bounded FIFO: when a peer outage lets it fill up, the
//! oldest entries are dropped and counted — anti-entropy will repair
//! whatever push replication missed.

use crate::clock::Timestamp;
use crate::ops::observability::{metrics, MetricsHandle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default queue capacity.
pub const DEFAULT_QUEUE_DEPTH: usize = 10_000;

/// A single replicable change to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Timestamp of the writing event.
    pub ts: Timestamp,
    /// The user key.
    pub key: Vec<u8>,
    /// Full value bytes after the write; empty for deletions.
    pub value: Vec<u8>,
    /// Whether this change is a deletion.
    pub is_delete: bool,
}

impl Mutation {
    /// A value write.
    pub fn put(ts: Timestamp, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            ts,
            key,
            value,
            is_delete: false,
        }
    }

    /// A deletion.
    pub fn delete(ts: Timestamp, key: Vec<u8>) -> Self {
        Self {
            ts,
            key,
            value: Vec::new(),
            is_delete: true,
        }
    }
}

/// Bounded FIFO of pending outbound mutations. Thread-safe.
pub struct ReplicationLog {
    queue: Mutex<VecDeque<Mutation>>,
    max_size: usize,
    metrics: MetricsHandle,
}

impl ReplicationLog {
    /// Create a queue with the given capacity.
    pub fn new(max_size: usize, metrics: MetricsHandle) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            max_size: max_size.max(1),
            metrics,
        }
    }

    /// Enqueue a mutation, dropping the oldest entry when full.
    pub fn append(&self, mutation: Mutation) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.max_size {
            queue.pop_front();
            self.metrics.counter_inc(metrics::REPLICATION_DROPPED);
        }
        queue.push_back(mutation);
    }

    /// Dequeue up to `limit` mutations in FIFO order.
    pub fn pop_batch(&self, limit: usize) -> Vec<Mutation> {
        let mut queue = self.queue.lock();
        let take = limit.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Pending mutation count.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::observability::MetricsRegistry;
    use std::sync::Arc;

    fn log(max: usize) -> (ReplicationLog, MetricsHandle) {
        let registry = Arc::new(MetricsRegistry::new());
        (ReplicationLog::new(max, Arc::clone(&registry)), registry)
    }

    fn mutation(n: i64) -> Mutation {
        Mutation::put(
            Timestamp::new(n, 0, 1),
            format!("k{}", n).into_bytes(),
            b"v".to_vec(),
        )
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (log, _) = log(100);
        for i in 0..5 {
            log.append(mutation(i));
        }
        let batch = log.pop_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].ts.wall, 0);
        assert_eq!(batch[2].ts.wall, 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let (log, registry) = log(3);
        for i in 0..5 {
            log.append(mutation(i));
        }
        assert_eq!(log.len(), 3);
        let batch = log.pop_batch(10);
        assert_eq!(batch[0].ts.wall, 2);
        assert_eq!(registry.counter_get(metrics::REPLICATION_DROPPED), 2);
    }

    #[test]
    fn pop_batch_on_empty_queue() {
        let (log, _) = log(10);
        assert!(log.is_empty());
        assert!(log.pop_batch(4).is_empty());
    }
}
