//! Incremental Merkle index over the keyspace.
//!
//! Five levels of 64-bit hashes with fan-out 16: 65 536 leaves at the
//! bottom, a single root at the top. A key maps to the leaf named by the
//! top 16 bits of its FNV-1a hash; the leaf holds the XOR of the combined
//! hash of every live entry that lands there. XOR makes leaf updates
//! homomorphic — replacing an entry applies `old_hash ^ new_hash` without
//! touching its neighbors. Upper levels hash their 16 children as a
//! 128-byte little-endian buffer.
//!
//! Writers only mark dirt; the tree is recomputed lazily when the root is
//! read. Leaves are partitioned into 256 lock shards of 256 leaves each so
//! concurrent writers rarely contend. Lock order is always the global
//! upper-level mutex first, then a leaf shard.

use parking_lot::Mutex;

/// Total leaves (level 4).
pub const LEAF_COUNT: usize = 65_536;
/// Tree fan-out.
pub const FAN_OUT: usize = 16;
/// Leaf lock shards.
const SHARD_COUNT: usize = 256;
/// Leaves per lock shard.
const LEAVES_PER_SHARD: usize = LEAF_COUNT / SHARD_COUNT;
/// Level-3 nodes per lock shard.
const L3_PER_SHARD: usize = LEAVES_PER_SHARD / FAN_OUT;

/// FNV-1a 64-bit hash. Stable across platforms and processes; the leaf
/// mapping and bucket hashes exchanged between peers are defined over it.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// The leaf (bucket) index a key maps to: top 16 bits of its hash.
pub fn leaf_index(key: &[u8]) -> u32 {
    ((fnv1a_64(key) >> 48) & 0xFFFF) as u32
}

/// Hash 16 child values as a 128-byte little-endian buffer.
fn hash_children(children: &[u64; FAN_OUT]) -> u64 {
    let mut buf = [0u8; FAN_OUT * 8];
    for (i, child) in children.iter().enumerate() {
        buf[i * 8..(i + 1) * 8].copy_from_slice(&child.to_le_bytes());
    }
    fnv1a_64(&buf)
}

struct LeafShard {
    /// This shard's 256 leaves.
    leaves: [u64; LEAVES_PER_SHARD],
    /// Dirty flags for the 16 level-3 nodes covering those leaves.
    l3_dirty: [bool; L3_PER_SHARD],
}

impl LeafShard {
    fn new() -> Self {
        Self {
            leaves: [0; LEAVES_PER_SHARD],
            l3_dirty: [false; L3_PER_SHARD],
        }
    }
}

struct UpperLevels {
    l3: Vec<u64>,  // 4096
    l2: [u64; 256],
    l1: [u64; FAN_OUT],
    l0: u64,
    l2_dirty: [bool; 256],
    l1_dirty: [bool; FAN_OUT],
    l0_dirty: bool,
}

/// The lazily-recomputed Merkle tree.
pub struct MerkleTree {
    shards: Vec<Mutex<LeafShard>>,
    upper: Mutex<UpperLevels>,
}

impl MerkleTree {
    /// An empty tree. The root of an empty tree is not zero — it is the
    /// hash of all-zero children, which lets peers distinguish "empty"
    /// from "unknown".
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(LeafShard::new())).collect(),
            upper: Mutex::new(UpperLevels {
                l3: vec![0; LEAF_COUNT / FAN_OUT],
                l2: [0; 256],
                l1: [0; FAN_OUT],
                l0: 0,
                l2_dirty: [true; 256],
                l1_dirty: [true; FAN_OUT],
                l0_dirty: true,
            }),
        }
    }

    /// XOR `hash_delta` into the leaf for `key` and mark its ancestors
    /// dirty. Takes only the leaf's shard lock.
    pub fn apply_delta(&self, key: &[u8], hash_delta: u64) {
        let bucket = leaf_index(key) as usize;
        let shard_idx = bucket / LEAVES_PER_SHARD;
        let mut shard = self.shards[shard_idx].lock();
        shard.leaves[bucket % LEAVES_PER_SHARD] ^= hash_delta;
        shard.l3_dirty[(bucket % LEAVES_PER_SHARD) / FAN_OUT] = true;
    }

    /// Recompute every dirty path and return the root hash.
    pub fn root_hash(&self) -> u64 {
        let mut upper = self.upper.lock();
        self.recompute_dirty(&mut upper);
        upper.l0
    }

    /// Read one node hash.
    ///
    /// Callers must have driven a [`root_hash`](Self::root_hash) since the
    /// last write they care about; this read does not recompute. The
    /// anti-entropy drill reads the root once per session and then walks
    /// nodes, which keeps recomputation off the per-message path.
    pub fn node_hash(&self, level: u8, index: usize) -> u64 {
        match level {
            0 => self.upper.lock().l0,
            1 => self.upper.lock().l1.get(index).copied().unwrap_or(0),
            2 => self.upper.lock().l2.get(index).copied().unwrap_or(0),
            3 => self.upper.lock().l3.get(index).copied().unwrap_or(0),
            4 => {
                if index >= LEAF_COUNT {
                    return 0;
                }
                let shard = self.shards[index / LEAVES_PER_SHARD].lock();
                shard.leaves[index % LEAVES_PER_SHARD]
            }
            _ => 0,
        }
    }

    fn recompute_dirty(&self, upper: &mut UpperLevels) {
        // Phase 1: level 3 from the leaves, one shard lock at a time.
        for (s, shard_mutex) in self.shards.iter().enumerate() {
            let mut shard = shard_mutex.lock();
            for i in 0..L3_PER_SHARD {
                if !shard.l3_dirty[i] {
                    continue;
                }
                let mut children = [0u64; FAN_OUT];
                children.copy_from_slice(&shard.leaves[i * FAN_OUT..(i + 1) * FAN_OUT]);
                let l3_idx = s * L3_PER_SHARD + i;
                upper.l3[l3_idx] = hash_children(&children);
                shard.l3_dirty[i] = false;
                upper.l2_dirty[l3_idx / FAN_OUT] = true;
            }
        }

        // Phases 2-4: upper levels, already under the global lock.
        for i in 0..256 {
            if upper.l2_dirty[i] {
                let mut children = [0u64; FAN_OUT];
                children.copy_from_slice(&upper.l3[i * FAN_OUT..(i + 1) * FAN_OUT]);
                upper.l2[i] = hash_children(&children);
                upper.l2_dirty[i] = false;
                upper.l1_dirty[i / FAN_OUT] = true;
            }
        }

        for i in 0..FAN_OUT {
            if upper.l1_dirty[i] {
                let mut children = [0u64; FAN_OUT];
                children.copy_from_slice(&upper.l2[i * FAN_OUT..(i + 1) * FAN_OUT]);
                upper.l1[i] = hash_children(&children);
                upper.l1_dirty[i] = false;
                upper.l0_dirty = true;
            }
        }

        if upper.l0_dirty {
            upper.l0 = hash_children(&upper.l1);
            upper.l0_dirty = false;
        }
    }
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_matches_reference_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn xor_delta_cancels() {
        let tree = MerkleTree::new();
        let empty_root = tree.root_hash();

        tree.apply_delta(b"k1", 0xAA);
        let dirty_root = tree.root_hash();
        assert_ne!(dirty_root, empty_root);

        tree.apply_delta(b"k1", 0xAA);
        assert_eq!(tree.root_hash(), empty_root);
    }

    #[test]
    fn root_is_a_pure_function_of_leaves() {
        let a = MerkleTree::new();
        let b = MerkleTree::new();

        a.apply_delta(b"x", 1);
        a.apply_delta(b"y", 2);
        b.apply_delta(b"y", 2);
        b.apply_delta(b"x", 1);

        assert_eq!(a.root_hash(), b.root_hash());
    }

    #[test]
    fn node_hashes_chain_to_the_root() {
        let tree = MerkleTree::new();
        tree.apply_delta(b"some-key", 0xDEAD_BEEF);
        let root = tree.root_hash();

        // Recompute the root by hand from the level-1 nodes.
        let mut l1 = [0u64; FAN_OUT];
        for (i, slot) in l1.iter_mut().enumerate() {
            *slot = tree.node_hash(1, i);
        }
        assert_eq!(hash_children(&l1), root);
    }

    #[test]
    fn divergent_leaf_is_reachable_by_drilling() {
        let a = MerkleTree::new();
        let b = MerkleTree::new();
        a.apply_delta(b"only-on-a", 42);
        assert_ne!(a.root_hash(), b.root_hash());

        // Walk down the one divergent path.
        let mut parent = 0usize;
        for level in 1..=4u8 {
            let mut divergent = None;
            for i in 0..FAN_OUT {
                let idx = parent * FAN_OUT + i;
                if a.node_hash(level, idx) != b.node_hash(level, idx) {
                    assert!(divergent.is_none(), "only one child should diverge");
                    divergent = Some(idx);
                }
            }
            parent = divergent.expect("a divergent child at every level");
        }
        assert_eq!(parent as u32, leaf_index(b"only-on-a"));
    }
}
