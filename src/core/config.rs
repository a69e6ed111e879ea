//! Configuration parsing and validation.
//!
//! Meridian is configured from a TOML file with one section per
//! component. Only the node id is mandatory — it must be unique per
//! process in the cluster — everything else has a default.
//!
//! ```toml
//! [node]
//! id = 1
//!
//! [storage]
//! wal_path = "data/meridian.wal"
//!
//! [mesh]
//! port = 7400
//!
//! [[mesh.peers]]
//! id = 2
//! host = "10.0.0.2"
//! port = 7400
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity.
    pub node: NodeConfig,

    /// Durability settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Peer transport settings.
    #[serde(default)]
    pub mesh: MeshConfig,

    /// Anti-entropy settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Outbound replication queue settings.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Node identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node id. Required; zero is reserved for "no writer".
    pub id: u32,
}

/// Durability settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Write-ahead log path.
    #[serde(default = "default_wal_path")]
    pub wal_path: PathBuf,

    /// Engine shard count.
    #[serde(default = "default_shards")]
    pub shards: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            wal_path: default_wal_path(),
            shards: default_shards(),
        }
    }
}

/// Peer transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Listen address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Listen port. Zero picks an ephemeral port.
    #[serde(default = "default_mesh_port")]
    pub port: u16,

    /// Artificial outbound delay in milliseconds. Zero disables.
    #[serde(default)]
    pub simulated_latency_ms: u64,

    /// Peers to dial at startup.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_mesh_port(),
            simulated_latency_ms: 0,
            peers: Vec::new(),
        }
    }
}

/// One configured peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: u32,
    pub host: String,
    pub port: u16,
}

/// Anti-entropy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Gossip tick interval in milliseconds.
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sync_interval_ms(),
        }
    }
}

/// Replication queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Maximum queued mutations before the oldest are dropped.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default log filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_wal_path() -> PathBuf {
    PathBuf::from("data/meridian.wal")
}

fn default_shards() -> u32 {
    64
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_mesh_port() -> u16 {
    7400
}

fn default_sync_interval_ms() -> u64 {
    2000
}

fn default_queue_depth() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse and validate configuration text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            bail!("node.id must be nonzero (zero is the reserved null writer id)");
        }
        if self.storage.shards == 0 {
            bail!("storage.shards must be at least 1");
        }
        if self.sync.interval_ms == 0 {
            bail!("sync.interval_ms must be at least 1");
        }
        if self.replication.queue_depth == 0 {
            bail!("replication.queue_depth must be at least 1");
        }
        for peer in &self.mesh.peers {
            if peer.id == self.node.id {
                bail!("mesh.peers must not contain this node's own id {}", peer.id);
            }
            if peer.id == 0 {
                bail!("peer ids must be nonzero");
            }
            if peer.host.is_empty() {
                bail!("peer {} has an empty host", peer.id);
            }
        }
        let mut ids: Vec<u32> = self.mesh.peers.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.mesh.peers.len() {
            bail!("mesh.peers contains duplicate ids");
        }
        Ok(())
    }

    /// The address the mesh should bind.
    pub fn mesh_bind_addr(&self) -> Result<std::net::SocketAddr> {
        format!("{}:{}", self.mesh.bind, self.mesh.port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid mesh bind address {}:{}",
                    self.mesh.bind, self.mesh.port
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_str("[node]\nid = 1\n").unwrap();
        assert_eq!(config.node.id, 1);
        assert_eq!(config.storage.shards, 64);
        assert_eq!(config.sync.interval_ms, 2000);
        assert_eq!(config.replication.queue_depth, 10_000);
        assert_eq!(config.mesh.port, 7400);
        assert!(config.mesh.peers.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let config = Config::from_str(
            r#"
[node]
id = 3

[storage]
wal_path = "/var/lib/meridian/node3.wal"
shards = 32

[mesh]
bind = "127.0.0.1"
port = 7403
simulated_latency_ms = 5

[[mesh.peers]]
id = 1
host = "10.0.0.1"
port = 7401

[[mesh.peers]]
id = 2
host = "10.0.0.2"
port = 7402

[sync]
interval_ms = 500

[telemetry]
log_level = "debug"
"#,
        )
        .unwrap();
        assert_eq!(config.mesh.peers.len(), 2);
        assert_eq!(config.sync.interval_ms, 500);
        assert_eq!(config.telemetry.log_level, "debug");
        assert!(config.mesh_bind_addr().is_ok());
    }

    #[test]
    fn zero_node_id_is_rejected() {
        let result = Config::from_str("[node]\nid = 0\n");
        assert!(result.unwrap_err().to_string().contains("node.id"));
    }

    #[test]
    fn own_id_in_peers_is_rejected() {
        let result = Config::from_str(
            r#"
[node]
id = 1

[[mesh.peers]]
id = 1
host = "localhost"
port = 7400
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_peer_ids_are_rejected() {
        let result = Config::from_str(
            r#"
[node]
id = 1

[[mesh.peers]]
id = 2
host = "a"
port = 1

[[mesh.peers]]
id = 2
host = "b"
port = 2
"#,
        );
        assert!(result.unwrap_err().to_string().contains("duplicate"));
    }
}
