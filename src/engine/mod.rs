//! The storage engine and its supporting indexes.

pub mod merkle;
pub mod meta;
pub mod replication;
pub mod store;

pub use merkle::{fnv1a_64, leaf_index, MerkleTree};
pub use meta::{is_meta_key, meta_key_for, MetaRecord};
pub use replication::{Mutation, ReplicationLog};
pub use store::Engine;
