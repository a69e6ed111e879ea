//! The storage engine.
//!
//! Authoritative in-memory store plus the orchestration of clock, WAL,
//! Merkle index, and replication queue. Every write path converges here:
//!
//! 1. acquire a timestamp,
//! 2. frame the value and its meta record as one atomic WAL batch,
//! 3. apply to the owning shard under its write lock,
//! 4. fold the hash change into the Merkle index,
//! 5. enqueue the mutation for push replication (local writes only).
//!
//! The keyspace is partitioned into shards selected by a stable hash; a
//! single shard lock serializes all mutations to one key. Deletions keep
//! the slot as an empty blob (the tombstone) so they participate in
//! anti-entropy, and the `<key>:meta` sidecar always travels in the same
//! batch as its primary — if a key is present, its meta is present.
//!
//! Remote mutations go through last-writer-wins: anything not strictly
//! newer than the local meta timestamp is dropped and counted.

use crate::clock::{HybridLogicalClock, Timestamp};
use crate::core::error::{MeridianError, MeridianResult};
use crate::engine::merkle::{fnv1a_64, leaf_index, MerkleTree};
use crate::engine::meta::{is_meta_key, meta_key_for, MetaRecord};
use crate::engine::replication::{Mutation, ReplicationLog};
use crate::ops::observability::{metrics, MetricsHandle};
use crate::storage::blob::Blob;
use crate::storage::wal::{BatchOp, WalOp, WalStats, WriteAheadLog};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hasher;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

/// Default shard count.
pub const DEFAULT_SHARD_COUNT: usize = 64;

/// Seed for the shard-selection hash. Fixed so placement is stable across
/// restarts; shard placement is never exchanged between nodes.
const SHARD_HASH_SEED: u64 = 0;

type Shard = RwLock<HashMap<Vec<u8>, Blob>>;

/// Sharded key-value engine.
pub struct Engine {
    shards: Vec<Shard>,
    wal: WriteAheadLog,
    clock: Arc<HybridLogicalClock>,
    merkle: MerkleTree,
    replication: Arc<ReplicationLog>,
    metrics: MetricsHandle,
}

impl Engine {
    /// Open the engine: create shards, open the WAL, and replay it into
    /// memory. Fatal if the WAL cannot be opened.
    pub fn open(
        wal_path: impl AsRef<Path>,
        node_id: u32,
        shard_count: usize,
        replication: Arc<ReplicationLog>,
        metrics: MetricsHandle,
    ) -> MeridianResult<Self> {
        let wal = WriteAheadLog::open(wal_path.as_ref().to_path_buf())?;
        let engine = Self {
            shards: (0..shard_count.max(1))
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            wal,
            clock: Arc::new(HybridLogicalClock::new(node_id)),
            merkle: MerkleTree::new(),
            replication,
            metrics,
        };

        let replayed = engine
            .wal
            .recover(|op, key, payload| engine.replay(op, key, payload))?;
        engine
            .metrics
            .counter_add(metrics::ENGINE_RECOVERED_RECORDS, replayed);
        info!(node_id, replayed, "engine recovered");
        Ok(engine)
    }

    /// The clock this engine stamps writes with.
    pub fn clock(&self) -> &Arc<HybridLogicalClock> {
        &self.clock
    }

    /// The node id of this engine.
    pub fn node_id(&self) -> u32 {
        self.clock.node_id()
    }

    // ------------------------------------------------------------------
    // Consumer API
    // ------------------------------------------------------------------

    /// Write a whole value.
    pub fn put(&self, key: &[u8], body: &[u8]) -> MeridianResult<()> {
        let ts = self.clock.now();
        let meta = MetaRecord::live(ts);
        let meta_key = meta_key_for(key);
        let meta_bytes = meta.to_bytes();

        self.wal
            .append_batch(&[BatchOp::put(key, body), BatchOp::put(&*meta_key, &*meta_bytes)])?;

        self.apply_put(key, body);
        self.apply_put(&meta_key, &meta_bytes);
        self.replication
            .append(Mutation::put(ts, key.to_vec(), body.to_vec()));
        Ok(())
    }

    /// Set an integer field of a document value in place.
    pub fn patch_int(&self, key: &[u8], field: &str, value: i64) -> MeridianResult<()> {
        let ts = self.clock.now();
        let meta = MetaRecord::live(ts);
        let meta_key = meta_key_for(key);
        let meta_bytes = meta.to_bytes();

        self.wal.append_batch(&[
            BatchOp::patch(WalOp::PatchI64, key, field, &value.to_string()),
            BatchOp::put(&*meta_key, &*meta_bytes),
        ])?;

        self.apply_patch_int(key, field, value)?;
        self.apply_put(&meta_key, &meta_bytes);
        self.replication
            .append(Mutation::put(ts, key.to_vec(), self.get(key)));
        Ok(())
    }

    /// Set a string field of a document value in place.
    pub fn patch_str(&self, key: &[u8], field: &str, value: &str) -> MeridianResult<()> {
        let ts = self.clock.now();
        let meta = MetaRecord::live(ts);
        let meta_key = meta_key_for(key);
        let meta_bytes = meta.to_bytes();

        self.wal.append_batch(&[
            BatchOp::patch(WalOp::PatchStr, key, field, value),
            BatchOp::put(&*meta_key, &*meta_bytes),
        ])?;

        self.apply_patch_str(key, field, value)?;
        self.apply_put(&meta_key, &meta_bytes);
        self.replication
            .append(Mutation::put(ts, key.to_vec(), self.get(key)));
        Ok(())
    }

    /// Delete a key. The slot remains as a tombstone; returns whether a
    /// live value existed beforehand.
    pub fn del(&self, key: &[u8]) -> MeridianResult<bool> {
        let ts = self.clock.now();
        let meta = MetaRecord::tombstone(ts);
        let meta_key = meta_key_for(key);
        let meta_bytes = meta.to_bytes();

        self.wal.append_batch(&[
            BatchOp::delete(key),
            BatchOp::put(&*meta_key, &*meta_bytes),
        ])?;

        let existed = self.apply_del(key);
        self.apply_put(&meta_key, &meta_bytes);
        self.replication
            .append(Mutation::delete(ts, key.to_vec()));
        Ok(existed)
    }

    /// Read a value. Empty means absent or tombstoned.
    pub fn get(&self, key: &[u8]) -> Vec<u8> {
        let shard = self.shard_for(key).read();
        shard.get(key).map(|blob| blob.bytes()).unwrap_or_default()
    }

    /// The stored content hash of a key: the hash of its byte image, or
    /// zero when the key is absent. A tombstone hashes as the empty image,
    /// which is not zero — absence and deletion are distinguishable.
    pub fn content_hash(&self, key: &[u8]) -> u64 {
        let shard = self.shard_for(key).read();
        shard
            .get(key)
            .map(|blob| fnv1a_64(&blob.bytes()))
            .unwrap_or(0)
    }

    /// Apply a mutation received from a peer under last-writer-wins.
    /// Returns whether it was applied; stale mutations are dropped and
    /// counted, not errors.
    pub fn apply_mutation(&self, mutation: &Mutation) -> MeridianResult<bool> {
        let local = self.local_meta(&mutation.key);
        if mutation.ts <= local.timestamp() {
            debug!(
                key = %String::from_utf8_lossy(&mutation.key),
                incoming = %mutation.ts,
                local = %local.timestamp(),
                "dropping stale mutation"
            );
            self.metrics
                .counter_inc(metrics::ENGINE_STALE_MUTATIONS_DROPPED);
            return Ok(false);
        }

        let meta = if mutation.is_delete {
            MetaRecord::tombstone(mutation.ts)
        } else {
            MetaRecord::live(mutation.ts)
        };
        let meta_key = meta_key_for(&mutation.key);
        let meta_bytes = meta.to_bytes();

        let value_op = if mutation.is_delete {
            BatchOp::delete(&*mutation.key)
        } else {
            BatchOp::put(&*mutation.key, &*mutation.value)
        };
        self.wal
            .append_batch(&[value_op, BatchOp::put(&*meta_key, &*meta_bytes)])?;

        if mutation.is_delete {
            self.apply_del(&mutation.key);
        } else {
            self.apply_put(&mutation.key, &mutation.value);
        }
        self.apply_put(&meta_key, &meta_bytes);
        Ok(true)
    }

    /// All user keys in a Merkle leaf bucket, with their content hashes.
    /// Internal meta keys are suppressed — they replicate with their
    /// primary. Shards are scanned in index order.
    pub fn get_bucket_keys(&self, bucket_idx: u32) -> Vec<(Vec<u8>, u64)> {
        let mut result = Vec::new();
        for shard in &self.shards {
            let map = shard.read();
            for (key, blob) in map.iter() {
                if is_meta_key(key) || leaf_index(key) != bucket_idx {
                    continue;
                }
                result.push((key.clone(), fnv1a_64(&blob.bytes())));
            }
        }
        result
    }

    /// Count user keys holding a live (non-tombstone) value.
    pub fn live_key_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .iter()
                    .filter(|(key, blob)| !is_meta_key(key) && !blob.is_empty())
                    .count()
            })
            .sum()
    }

    /// Fsync the WAL.
    pub fn flush(&self) -> MeridianResult<()> {
        self.wal.flush()
    }

    /// WAL activity counters.
    pub fn wal_stats(&self) -> WalStats {
        self.wal.stats()
    }

    /// The current Merkle root, recomputing dirty paths.
    pub fn merkle_root_hash(&self) -> u64 {
        self.merkle.root_hash()
    }

    /// A Merkle node hash. Call [`merkle_root_hash`](Self::merkle_root_hash)
    /// first so dirty paths have been propagated.
    pub fn merkle_node(&self, level: u8, index: usize) -> u64 {
        self.merkle.node_hash(level, index)
    }

    // ------------------------------------------------------------------
    // In-memory apply paths (shared by live writes and recovery)
    // ------------------------------------------------------------------

    fn shard_for(&self, key: &[u8]) -> &Shard {
        let mut hasher = XxHash64::with_seed(SHARD_HASH_SEED);
        hasher.write(key);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    fn apply_put(&self, key: &[u8], body: &[u8]) {
        let shard = self.shard_for(key);
        let mut map = shard.write();
        let old_hash = map.get(key).map(|b| fnv1a_64(&b.bytes())).unwrap_or(0);
        let blob = map.entry(key.to_vec()).or_insert_with(Blob::new);
        blob.overwrite(body);
        let new_hash = fnv1a_64(&blob.bytes());
        drop(map);
        self.merkle.apply_delta(key, old_hash ^ new_hash);
    }

    fn apply_patch_int(&self, key: &[u8], field: &str, value: i64) -> MeridianResult<()> {
        self.apply_patch(key, |blob| blob.set_int(field, value))
    }

    fn apply_patch_str(&self, key: &[u8], field: &str, value: &str) -> MeridianResult<()> {
        self.apply_patch(key, |blob| blob.set_str(field, value))
    }

    /// Shared field-patch path. The entry is only created once the
    /// mutation succeeds, so a failed patch leaves no half-tracked slot.
    fn apply_patch<F>(&self, key: &[u8], mutate: F) -> MeridianResult<()>
    where
        F: FnOnce(&mut Blob) -> MeridianResult<()>,
    {
        let shard = self.shard_for(key);
        let mut map = shard.write();
        let delta = match map.get_mut(key) {
            Some(blob) => {
                let old_hash = fnv1a_64(&blob.bytes());
                mutate(blob)?;
                old_hash ^ fnv1a_64(&blob.bytes())
            }
            None => {
                let mut blob = Blob::new_document();
                mutate(&mut blob)?;
                let new_hash = fnv1a_64(&blob.bytes());
                map.insert(key.to_vec(), blob);
                new_hash
            }
        };
        drop(map);
        self.merkle.apply_delta(key, delta);
        Ok(())
    }

    fn apply_del(&self, key: &[u8]) -> bool {
        let shard = self.shard_for(key);
        let mut map = shard.write();
        let (old_hash, existed_live) = match map.get(key) {
            Some(blob) => (fnv1a_64(&blob.bytes()), !blob.is_empty()),
            None => (0, false),
        };
        let blob = map.entry(key.to_vec()).or_insert_with(Blob::new);
        blob.overwrite(b"");
        let new_hash = fnv1a_64(&blob.bytes());
        drop(map);
        self.merkle.apply_delta(key, old_hash ^ new_hash);
        existed_live
    }

    /// The local meta record for a key, or the zero record.
    fn local_meta(&self, key: &[u8]) -> MetaRecord {
        let bytes = self.get(&meta_key_for(key));
        MetaRecord::parse(&bytes).unwrap_or_else(MetaRecord::zero)
    }

    /// Recovery callback: re-drive the in-memory apply paths without
    /// re-appending to the WAL or enqueueing replication.
    fn replay(&self, op: WalOp, key: &[u8], payload: &[u8]) -> MeridianResult<()> {
        match op {
            WalOp::Put => {
                self.apply_put(key, payload);
                Ok(())
            }
            WalOp::PatchI64 => {
                let (field, value) = split_patch_payload(payload)?;
                let value: i64 = value.parse().map_err(|_| {
                    MeridianError::decode(format!("non-integer patch value {:?}", value))
                })?;
                self.apply_patch_int(key, &field, value)
            }
            WalOp::PatchStr => {
                let (field, value) = split_patch_payload(payload)?;
                self.apply_patch_str(key, &field, &value)
            }
            WalOp::Delete => {
                self.apply_del(key);
                Ok(())
            }
            WalOp::Batch => {
                // The WAL expands batches before the callback.
                warn!("batch record reached the replay callback");
                Err(MeridianError::internal("unexpanded batch record"))
            }
        }
    }
}

/// Split a `field:value` patch payload at the first colon.
fn split_patch_payload(payload: &[u8]) -> MeridianResult<(String, String)> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| MeridianError::decode("patch payload is not UTF-8"))?;
    let (field, value) = text
        .split_once(':')
        .ok_or_else(|| MeridianError::decode("patch payload missing ':' separator"))?;
    Ok((field.to_string(), value.to_string()))
}
