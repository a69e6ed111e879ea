//! Storage layer: value representation and the write-ahead log.

pub mod blob;
pub mod wal;

pub use blob::Blob;
pub use wal::{BatchOp, WalOp, WalStats, WriteAheadLog};
