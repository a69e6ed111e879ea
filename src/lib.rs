//! Meridian - distributed, sharded, eventually-consistent key-value store.
//!
//! Client writes are durably logged, applied to a sharded in-memory map,
//! timestamped by a hybrid logical clock, and continuously reconciled
//! between peers by a Merkle-tree anti-entropy protocol over a multi-lane
//! peer transport.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Consumer Surface                         │
//! │        put / patch / del / get  │  CLI  │  metrics export       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Engine                               │
//! │   Sharded map │ HLC timestamps │ LWW merge │ Merkle index       │
//! └─────────────────────────────────────────────────────────────────┘
//!                     │                          │
//! ┌──────────────────────────────┐ ┌──────────────────────────────┐
//! │       Write-Ahead Log        │ │       Sync Manager           │
//! │  framed records │ batches │  │ │  root exchange │ drill-down  │
//! │  crash recovery              │ │  bucket repair │ LWW apply   │
//! └──────────────────────────────┘ └──────────────────────────────┘
//!                                               │
//!                                  ┌──────────────────────────────┐
//!                                  │         Peer Mesh            │
//!                                  │  lanes │ ordered send queues │
//!                                  └──────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Component lifecycle orchestration
//! - [`core::error`] - Error types
//!
//! ## Data path
//! - [`clock`] - Hybrid logical clock and the per-thread batcher
//! - [`storage::wal`] - Write-ahead log: framing, batches, recovery
//! - [`storage::blob`] - Schemaless value container
//! - [`engine::store`] - The sharded engine and its write paths
//! - [`engine::merkle`] - Incremental Merkle index
//! - [`engine::meta`] - Per-key writer records
//! - [`engine::replication`] - Outbound replication queue
//!
//! ## Networking
//! - [`mesh`] - Multi-lane peer transport
//! - [`sync`] - Anti-entropy reconciliation
//!
//! ## Operations
//! - [`ops::observability`] - Metrics registry
//! - [`ops::telemetry`] - Periodic stats sampling
//! - [`cli`] - Command-line interface
//!
//! # Key Invariants
//!
//! - **WAL-FIRST**: every commit observable by a read was framed into the
//!   WAL before it was applied.
//! - **META-PAIRED**: if a user key exists in the map, its `<key>:meta`
//!   record exists and names the writer of the current value.
//! - **CLOCK-MONOTONE**: successive local timestamps strictly increase,
//!   and a received timestamp is dominated by the next local one.
//! - **LWW**: a mutation not strictly newer than the local meta is
//!   dropped.
//! - **MERKLE-PURE**: the root hash is a pure function of live values and
//!   tombstones, independent of write order.

// Core infrastructure
pub mod core;

// Timestamps
pub mod clock;

// Storage layer
pub mod storage;

// The engine
pub mod engine;

// Networking
pub mod mesh;

// Anti-entropy
pub mod sync;

// Operations and observability
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, Config, MeridianError, MeridianResult, Runtime};
pub use clock::{HybridLogicalClock, ThreadLocalClock, Timestamp};
pub use engine::{Engine, MerkleTree, MetaRecord, Mutation, ReplicationLog};
pub use mesh::{Lane, Mesh, NodeId, PeerTransport};
pub use ops::observability::{MetricsHandle, MetricsRegistry};
pub use storage::{Blob, WalOp, WalStats, WriteAheadLog};
pub use sync::SyncManager;
