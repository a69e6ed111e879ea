//! Periodic telemetry collection.
//!
//! A small background task that samples the engine and replication queue
//! on an interval, publishes gauges through the metrics registry, and
//! emits one summary log line. Everything it reads is also available to
//! boundary surfaces through [`MetricsRegistry::snapshot`].
//!
//! [`MetricsRegistry::snapshot`]: crate::ops::observability::MetricsRegistry::snapshot

use crate::engine::{Engine, ReplicationLog};
use crate::ops::observability::MetricsHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Gauge names published by the telemetry task.
pub mod gauges {
    /// Pending mutations in the replication queue.
    pub const REPLICATION_QUEUE_DEPTH: &str = "meridian.replication.queue_depth";
    /// Live (non-tombstone) user keys.
    pub const ENGINE_LIVE_KEYS: &str = "meridian.engine.live_keys";
    /// WAL records appended since open.
    pub const WAL_RECORDS_APPENDED: &str = "meridian.wal.records_appended";
    /// WAL bytes appended since open.
    pub const WAL_BYTES_APPENDED: &str = "meridian.wal.bytes_appended";
}

/// Default sampling interval.
pub const DEFAULT_TELEMETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Periodic sampler over the engine and replication queue.
pub struct Telemetry {
    engine: Arc<Engine>,
    replication: Arc<ReplicationLog>,
    metrics: MetricsHandle,
    interval: Duration,
    running: AtomicBool,
}

impl Telemetry {
    /// Create a sampler.
    pub fn new(
        engine: Arc<Engine>,
        replication: Arc<ReplicationLog>,
        metrics: MetricsHandle,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            replication,
            metrics,
            interval,
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the sampling loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::Release);
        let telemetry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(telemetry.interval).await;
                if !telemetry.running.load(Ordering::Acquire) {
                    break;
                }
                telemetry.sample();
            }
        })
    }

    /// Request the sampling loop to exit after its current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Take one sample now.
    pub fn sample(&self) {
        let wal = self.engine.wal_stats();
        let queue_depth = self.replication.len() as u64;
        let live_keys = self.engine.live_key_count() as u64;

        self.metrics
            .gauge_set(gauges::REPLICATION_QUEUE_DEPTH, queue_depth);
        self.metrics.gauge_set(gauges::ENGINE_LIVE_KEYS, live_keys);
        self.metrics
            .gauge_set(gauges::WAL_RECORDS_APPENDED, wal.records_appended);
        self.metrics
            .gauge_set(gauges::WAL_BYTES_APPENDED, wal.bytes_appended);

        info!(
            live_keys,
            queue_depth,
            wal_records = wal.records_appended,
            wal_bytes = wal.bytes_appended,
            wal_flushes = wal.flushes,
            "telemetry sample"
        );
    }
}
