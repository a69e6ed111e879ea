//! Common test utilities.
//!
//! Shared helpers for integration tests. Import with `mod common;`.

#![allow(dead_code)]

use meridian::engine::replication::ReplicationLog;
use meridian::engine::Engine;
use meridian::ops::observability::{MetricsHandle, MetricsRegistry};
use std::sync::Arc;
use tempfile::TempDir;

/// An engine over a temp-dir WAL, plus the handles it was built with.
pub struct TestNode {
    pub dir: TempDir,
    pub engine: Arc<Engine>,
    pub replication: Arc<ReplicationLog>,
    pub metrics: MetricsHandle,
}

/// Open an engine with a fresh WAL under a temp dir.
pub fn test_node(node_id: u32) -> TestNode {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    reopen_node(dir, node_id)
}

/// Open an engine over an existing temp dir, recovering its WAL. Used to
/// simulate restarts.
pub fn reopen_node(dir: TempDir, node_id: u32) -> TestNode {
    let metrics: MetricsHandle = Arc::new(MetricsRegistry::new());
    let replication = Arc::new(ReplicationLog::new(10_000, Arc::clone(&metrics)));
    let engine = Arc::new(
        Engine::open(
            dir.path().join("node.wal"),
            node_id,
            64,
            Arc::clone(&replication),
            Arc::clone(&metrics),
        )
        .expect("failed to open engine"),
    );
    TestNode {
        dir,
        engine,
        replication,
        metrics,
    }
}

/// Minimal valid configuration text.
pub fn minimal_config() -> &'static str {
    "[node]\nid = 1\n"
}
