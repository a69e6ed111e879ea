//! Metrics registry.
//!
//! Components receive an [`MetricsHandle`] at construction time and record
//! through it; nothing in the core reads ambient globals. The registry is
//! deliberately small — named counters and gauges over atomics — and the
//! boundary surfaces (admin endpoints, logs) export it as a snapshot.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metric names recorded by the core components.
pub mod metrics {
    /// Remote mutations dropped because a newer local write won.
    pub const ENGINE_STALE_MUTATIONS_DROPPED: &str = "meridian.engine.stale_mutations_dropped";
    /// Records replayed during startup recovery.
    pub const ENGINE_RECOVERED_RECORDS: &str = "meridian.engine.recovered_records";
    /// Mutations evicted from the replication queue by overflow.
    pub const REPLICATION_DROPPED: &str = "meridian.replication.dropped";
    /// Anti-entropy sessions initiated by the local node.
    pub const SYNC_SESSIONS_STARTED: &str = "meridian.sync.sessions_started";
    /// Divergent leaf buckets discovered while drilling.
    pub const SYNC_DIVERGENT_BUCKETS: &str = "meridian.sync.divergent_buckets";
    /// Keys repaired by applying a peer's value.
    pub const SYNC_KEYS_REPAIRED: &str = "meridian.sync.keys_repaired";
    /// Sync messages that failed to decode and were dropped.
    pub const SYNC_DECODE_ERRORS: &str = "meridian.sync.decode_errors";

    /// Per-lane outbound byte counter name.
    pub fn mesh_bytes_sent(lane: &str) -> String {
        format!("meridian.mesh.bytes_sent.{}", lane)
    }

    /// Per-lane inbound byte counter name.
    pub fn mesh_bytes_received(lane: &str) -> String {
        format!("meridian.mesh.bytes_received.{}", lane)
    }
}

/// Shared handle components record through.
pub type MetricsHandle = Arc<MetricsRegistry>;

/// Named counters and gauges.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, AtomicU64>>,
    gauges: RwLock<HashMap<String, AtomicU64>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    /// Add to a counter.
    pub fn counter_add(&self, name: &str, value: u64) {
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(name) {
                counter.fetch_add(value, Ordering::Relaxed);
                return;
            }
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Read a counter; missing counters read as zero.
    pub fn counter_get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Set a gauge.
    pub fn gauge_set(&self, name: &str, value: u64) {
        {
            let gauges = self.gauges.read();
            if let Some(gauge) = gauges.get(name) {
                gauge.store(value, Ordering::Relaxed);
                return;
            }
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Read a gauge; missing gauges read as zero.
    pub fn gauge_get(&self, name: &str) -> u64 {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Point-in-time export of every metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        MetricsSnapshot { counters, gauges }
    }
}

/// Exported metric values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let registry = MetricsRegistry::new();
        registry.counter_inc(metrics::SYNC_KEYS_REPAIRED);
        registry.counter_add(metrics::SYNC_KEYS_REPAIRED, 4);
        assert_eq!(registry.counter_get(metrics::SYNC_KEYS_REPAIRED), 5);
        assert_eq!(registry.counter_get("meridian.never.recorded"), 0);
    }

    #[test]
    fn gauges_overwrite() {
        let registry = MetricsRegistry::new();
        registry.gauge_set("meridian.replication.depth", 10);
        registry.gauge_set("meridian.replication.depth", 3);
        assert_eq!(registry.gauge_get("meridian.replication.depth"), 3);
    }

    #[test]
    fn snapshot_contains_everything() {
        let registry = MetricsRegistry::new();
        registry.counter_inc("a");
        registry.gauge_set("b", 2);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counters.get("a"), Some(&1));
        assert_eq!(snapshot.gauges.get("b"), Some(&2));
    }
}
