//! Anti-entropy reconciliation.
//!
//! A timer picks one random active peer every interval and opens a session
//! by sending the local Merkle root. When roots differ, the initiator
//! drills down the peer's tree — sixteen child hashes at a time — until it
//! reaches the divergent leaf buckets, lists the peer's keys there, and
//! pulls the `(meta, value)` pair for every key whose content hash
//! disagrees. The receiver applies each transfer under last-writer-wins,
//! so duplicated or crossed exchanges are harmless and a session needs no
//! explicit termination: it simply stops producing messages once the
//! divergent paths are repaired.
//!
//! Sessions pull in one direction. A key present only locally is not
//! pushed; the peer discovers it when its own timer drills this node. For
//! `d` divergent leaves a session costs `O(d + 64)` messages.

pub mod message;

use crate::engine::meta::{meta_key_for, MetaRecord};
use crate::engine::replication::Mutation;
use crate::engine::Engine;
use crate::mesh::{Lane, NodeId, PeerTransport};
use crate::ops::observability::{metrics, MetricsHandle};
use message::{BucketEntry, SyncMessage, NODE_FAN_OUT};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default gossip interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(2000);

/// Tree depth at which children are leaf buckets.
const LEAF_LEVEL: u8 = 4;

/// The anti-entropy state machine over a peer transport.
pub struct SyncManager<T: PeerTransport> {
    transport: Arc<T>,
    engine: Arc<Engine>,
    node_id: NodeId,
    interval: Duration,
    running: AtomicBool,
    metrics: MetricsHandle,
}

impl<T: PeerTransport + 'static> SyncManager<T> {
    /// Create a manager gossiping through `transport` on behalf of
    /// `engine`.
    pub fn new(
        transport: Arc<T>,
        engine: Arc<Engine>,
        interval: Duration,
        metrics: MetricsHandle,
    ) -> Self {
        let node_id = engine.node_id();
        Self {
            transport,
            engine,
            node_id,
            interval,
            running: AtomicBool::new(false),
            metrics,
        }
    }

    /// Spawn the gossip timer. Stops when [`stop`](Self::stop) is called.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::Release);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            debug!(node_id = manager.node_id, "gossip loop started");
            loop {
                tokio::time::sleep(manager.interval).await;
                if !manager.running.load(Ordering::Acquire) {
                    break;
                }
                manager.trigger();
            }
            debug!(node_id = manager.node_id, "gossip loop stopped");
        })
    }

    /// Request the timer loop to exit after its current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Run one gossip round now: pick a random active peer and open a
    /// session with it.
    pub fn trigger(&self) {
        let peers = self.transport.active_peers();
        let Some(&target) = peers.choose(&mut rand::thread_rng()) else {
            trace!("no active peers to gossip with");
            return;
        };
        let root = self.engine.merkle_root_hash();
        self.metrics.counter_inc(metrics::SYNC_SESSIONS_STARTED);
        trace!(target, root, "opening sync session");
        self.send(
            target,
            SyncMessage::Init {
                sender: self.node_id,
                root,
            },
        );
    }

    /// Dispatch one inbound sync payload. Wired into the transport's
    /// on-message callback; undecodable payloads are dropped and counted.
    pub fn handle_message(&self, from: NodeId, _lane: Lane, payload: &[u8]) {
        let msg = match SyncMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(from, error = %e, "dropping undecodable sync message");
                self.metrics.counter_inc(metrics::SYNC_DECODE_ERRORS);
                return;
            }
        };
        // Replies route to the id embedded in the message; the connection's
        // peer id and the embedded id agree on a healthy mesh.
        let sender = msg.sender();
        trace!(from, sender, msg = msg.type_name(), "sync message");

        match msg {
            SyncMessage::Init { root, .. } => self.on_init(sender, root),
            SyncMessage::ReqNode { level, parent, .. } => self.on_req_node(sender, level, parent),
            SyncMessage::RepNode {
                level,
                parent,
                hashes,
                ..
            } => self.on_rep_node(sender, level, parent, &hashes),
            SyncMessage::ReqBucket { bucket, .. } => self.on_req_bucket(sender, bucket),
            SyncMessage::RepBucket {
                bucket, entries, ..
            } => self.on_rep_bucket(sender, bucket, entries),
            SyncMessage::GetVal { key, .. } => self.on_get_val(sender, &key),
            SyncMessage::PutVal {
                key, meta, value, ..
            } => self.on_put_val(sender, key, meta, value),
        }
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    /// Peer opened a session. Equal roots need no reply; otherwise start
    /// drilling into the peer's tree from level 1.
    fn on_init(&self, from: NodeId, their_root: u64) {
        let my_root = self.engine.merkle_root_hash();
        if my_root == their_root {
            return;
        }
        debug!(from, my_root, their_root, "root mismatch; drilling");
        self.send(
            from,
            SyncMessage::ReqNode {
                sender: self.node_id,
                level: 1,
                parent: 0,
            },
        );
    }

    /// Peer asked for the 16 child hashes at `level` under `parent`.
    fn on_req_node(&self, from: NodeId, level: u8, parent: u32) {
        if level == 0 || level > LEAF_LEVEL {
            warn!(from, level, "ignoring node request outside the tree");
            return;
        }
        // One recompute covers the whole reply.
        self.engine.merkle_root_hash();
        let mut hashes = [0u64; NODE_FAN_OUT];
        for (i, slot) in hashes.iter_mut().enumerate() {
            *slot = self
                .engine
                .merkle_node(level, parent as usize * NODE_FAN_OUT + i);
        }
        self.send(
            from,
            SyncMessage::RepNode {
                sender: self.node_id,
                level,
                parent,
                hashes,
            },
        );
    }

    /// Compare the peer's child hashes with ours; recurse into mismatched
    /// interior nodes, and list mismatched leaves.
    fn on_rep_node(&self, from: NodeId, level: u8, parent: u32, their_hashes: &[u64; NODE_FAN_OUT]) {
        if level == 0 || level > LEAF_LEVEL {
            return;
        }
        self.engine.merkle_root_hash();
        for (i, &their_hash) in their_hashes.iter().enumerate() {
            let child = parent as usize * NODE_FAN_OUT + i;
            let my_hash = self.engine.merkle_node(level, child);
            if my_hash == their_hash {
                continue;
            }
            if level == LEAF_LEVEL {
                self.metrics.counter_inc(metrics::SYNC_DIVERGENT_BUCKETS);
                self.send(
                    from,
                    SyncMessage::ReqBucket {
                        sender: self.node_id,
                        bucket: child as u32,
                    },
                );
            } else {
                self.send(
                    from,
                    SyncMessage::ReqNode {
                        sender: self.node_id,
                        level: level + 1,
                        parent: child as u32,
                    },
                );
            }
        }
    }

    /// Peer asked for a bucket listing.
    fn on_req_bucket(&self, from: NodeId, bucket: u32) {
        let entries = self
            .engine
            .get_bucket_keys(bucket)
            .into_iter()
            .map(|(key, value_hash)| BucketEntry { key, value_hash })
            .collect();
        self.send(
            from,
            SyncMessage::RepBucket {
                sender: self.node_id,
                bucket,
                entries,
            },
        );
    }

    /// Compare the peer's bucket listing with local content and fetch
    /// every key whose hash disagrees. Absent keys hash as zero, so they
    /// always disagree with a peer that has them.
    fn on_rep_bucket(&self, from: NodeId, bucket: u32, entries: Vec<BucketEntry>) {
        trace!(from, bucket, count = entries.len(), "bucket listing");
        for entry in entries {
            let my_hash = self.engine.content_hash(&entry.key);
            if my_hash != entry.value_hash {
                self.send(
                    from,
                    SyncMessage::GetVal {
                        sender: self.node_id,
                        key: entry.key,
                    },
                );
            }
        }
    }

    /// Peer asked for one key. Reply with meta and value; when there is no
    /// local record of the key, the reply carries empty meta and value,
    /// which the peer's last-writer-wins check discards as "no newer
    /// information".
    fn on_get_val(&self, from: NodeId, key: &[u8]) {
        if key.len() > u16::MAX as usize {
            warn!(from, key_len = key.len(), "ignoring oversized key request");
            return;
        }
        let meta = self.engine.get(&meta_key_for(key));
        let value = if meta.is_empty() {
            Vec::new()
        } else {
            self.engine.get(key)
        };
        self.send(
            from,
            SyncMessage::PutVal {
                sender: self.node_id,
                key: key.to_vec(),
                meta,
                value,
            },
        );
    }

    /// Peer delivered a key's meta and value. Apply under
    /// last-writer-wins.
    fn on_put_val(&self, from: NodeId, key: Vec<u8>, meta: Vec<u8>, value: Vec<u8>) {
        let Some(meta) = MetaRecord::parse(&meta) else {
            // Empty or unparseable meta carries no usable writer record.
            trace!(from, "put_val without usable meta; ignoring");
            return;
        };

        let mutation = if meta.tombstone {
            Mutation::delete(meta.timestamp(), key)
        } else {
            Mutation::put(meta.timestamp(), key, value)
        };

        match self.engine.apply_mutation(&mutation) {
            Ok(true) => {
                self.metrics.counter_inc(metrics::SYNC_KEYS_REPAIRED);
            }
            Ok(false) => {}
            Err(e) => warn!(from, error = %e, "failed to apply repaired key"),
        }
    }

    fn send(&self, to: NodeId, msg: SyncMessage) {
        let lane = msg.lane();
        if !self.transport.send(to, lane, msg.encode()) {
            debug!(to, msg = msg.type_name(), "send failed; peer lost");
        }
    }
}
