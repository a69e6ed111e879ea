//! Runtime orchestration.
//!
//! Component lifecycle:
//! - Start order: engine (WAL recovery) → mesh listener → peer dialing →
//!   gossip timer.
//! - Shutdown order: gossip timer → mesh → final WAL flush.
//!
//! Startup failures that matter (WAL open, port bind) propagate out of
//! [`Runtime::start`] and become a nonzero exit; a peer that cannot be
//! dialed is only a warning, because anti-entropy re-reaches it once the
//! peer comes back.

use crate::core::config::Config;
use crate::engine::{Engine, ReplicationLog};
use crate::mesh::Mesh;
use crate::ops::observability::{MetricsHandle, MetricsRegistry};
use crate::ops::telemetry::{Telemetry, DEFAULT_TELEMETRY_INTERVAL};
use crate::sync::SyncManager;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Meridian runtime holding every component handle.
pub struct Runtime {
    config: Arc<Config>,
    metrics: MetricsHandle,
    engine: Arc<Engine>,
    replication: Arc<ReplicationLog>,
    mesh: Arc<Mesh>,
    sync: Arc<SyncManager<Mesh>>,
    telemetry: Arc<Telemetry>,
    sync_task: Option<JoinHandle<()>>,
    telemetry_task: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Build every component from the configuration. Opens and recovers
    /// the WAL; fails if it cannot.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let metrics: MetricsHandle = Arc::new(MetricsRegistry::new());
        let replication = Arc::new(ReplicationLog::new(
            config.replication.queue_depth,
            Arc::clone(&metrics),
        ));

        let engine = Arc::new(
            Engine::open(
                &config.storage.wal_path,
                config.node.id,
                config.storage.shards as usize,
                Arc::clone(&replication),
                Arc::clone(&metrics),
            )
            .with_context(|| {
                format!(
                    "failed to open write-ahead log at {}",
                    config.storage.wal_path.display()
                )
            })?,
        );

        let bind_addr = config.mesh_bind_addr()?;
        let mesh = Arc::new(Mesh::new(config.node.id, bind_addr, Arc::clone(&metrics)));
        if config.mesh.simulated_latency_ms > 0 {
            mesh.set_simulated_latency(Duration::from_millis(config.mesh.simulated_latency_ms));
        }

        let sync = Arc::new(SyncManager::new(
            Arc::clone(&mesh),
            Arc::clone(&engine),
            Duration::from_millis(config.sync.interval_ms),
            Arc::clone(&metrics),
        ));

        let telemetry = Arc::new(Telemetry::new(
            Arc::clone(&engine),
            Arc::clone(&replication),
            Arc::clone(&metrics),
            DEFAULT_TELEMETRY_INTERVAL,
        ));

        Ok(Self {
            config: Arc::new(config),
            metrics,
            engine,
            replication,
            mesh,
            sync,
            telemetry,
            sync_task: None,
            telemetry_task: None,
        })
    }

    /// Start serving: bind the mesh, dial configured peers, start the
    /// gossip timer. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let sync = Arc::clone(&self.sync);
        self.mesh.set_on_message(Arc::new(move |from, lane, payload| {
            sync.handle_message(from, lane, &payload);
        }));

        let addr = self
            .mesh
            .listen()
            .await
            .context("failed to bind mesh listener")?;

        for peer in &self.config.mesh.peers {
            if let Err(e) = self.mesh.connect(peer.id, &peer.host, peer.port).await {
                warn!(peer_id = peer.id, error = %e, "could not dial peer; gossip will retry when it dials us");
            }
        }

        self.sync_task = Some(self.sync.start());
        self.telemetry_task = Some(self.telemetry.start());
        info!(node_id = self.config.node.id, %addr, "meridian started");
        Ok(addr)
    }

    /// Stop the timers, drop connections, flush the WAL, and dump final
    /// metrics.
    pub fn shutdown(&mut self) {
        self.sync.stop();
        self.telemetry.stop();
        if let Some(task) = self.sync_task.take() {
            task.abort();
        }
        if let Some(task) = self.telemetry_task.take() {
            task.abort();
        }
        self.mesh.shutdown();
        if let Err(e) = self.engine.flush() {
            warn!(error = %e, "final flush failed");
        }

        let snapshot = self.metrics.snapshot();
        info!(
            metrics = %serde_json::to_string(&snapshot).unwrap_or_default(),
            node_id = self.config.node.id,
            "meridian stopped"
        );
    }

    /// Start, then serve until interrupted.
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutdown signal received");
        self.shutdown();
        Ok(())
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The storage engine.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The peer mesh.
    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// The anti-entropy manager.
    pub fn sync(&self) -> &Arc<SyncManager<Mesh>> {
        &self.sync
    }

    /// The outbound replication queue.
    pub fn replication(&self) -> &Arc<ReplicationLog> {
        &self.replication
    }

    /// The metrics registry.
    pub fn metrics(&self) -> &MetricsHandle {
        &self.metrics
    }
}
