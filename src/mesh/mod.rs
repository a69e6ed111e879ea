//! Multi-lane peer transport.
//!
//! The mesh keeps one TCP connection per peer and multiplexes four
//! priority lanes over it. Frames are `[lane: u32 LE][size: u32 LE][body]`;
//! the first four bytes of a new connection are the initiator's node id,
//! read by the acceptor before any frame, so both sides know who they are
//! talking to.
//!
//! Each connection gets a reader task and a writer task. The writer drains
//! an unbounded per-connection queue, which preserves send order; the
//! reader deframes and invokes the registered callback serially, so the
//! callback is never re-entered for the same connection. `send` is a
//! non-blocking enqueue — a `true` result means queued, not delivered.
//!
//! Errors close the connection and deregister the peer. There is no
//! automatic reconnect: the anti-entropy layer tolerates loss and the
//! operator (or an outer loop) re-dials.

use crate::core::error::{MeridianError, MeridianResult};
use crate::ops::observability::{metrics, MetricsHandle};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Node identifier exchanged in the connection handshake.
pub type NodeId = u32;

/// Largest accepted frame body. A frame claiming more than this closes
/// the connection as corrupt.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Frame header: lane(4) + size(4).
const FRAME_HEADER_LEN: usize = 8;

/// Priority lanes. A lane is a scheduling hint; the delivery contract is
/// per-connection FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Lane {
    /// Gossip and cluster management.
    Control = 0,
    /// Metadata and heartbeats.
    Express = 1,
    /// Regular traffic.
    Standard = 2,
    /// Bulk transfer: key listings and value payloads.
    Heavy = 3,
}

impl Lane {
    /// Wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decode a wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Control),
            1 => Some(Self::Express),
            2 => Some(Self::Standard),
            3 => Some(Self::Heavy),
            _ => None,
        }
    }

    /// Lane name for metrics and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Express => "express",
            Self::Standard => "standard",
            Self::Heavy => "heavy",
        }
    }
}

/// Inbound message callback: `(peer_id, lane, body)`.
pub type MessageCallback = Arc<dyn Fn(NodeId, Lane, Vec<u8>) + Send + Sync>;

/// The sending surface the anti-entropy layer needs. Implemented by
/// [`Mesh`]; test harnesses can supply an in-memory implementation.
pub trait PeerTransport: Send + Sync {
    /// Enqueue a payload for ordered delivery. `false` when the peer is
    /// unknown or its connection has closed.
    fn send(&self, peer_id: NodeId, lane: Lane, payload: Vec<u8>) -> bool;

    /// Peers with a live connection.
    fn active_peers(&self) -> Vec<NodeId>;
}

/// One registered peer connection.
struct Peer {
    id: NodeId,
    outbox: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
}

/// The peer mesh.
pub struct Mesh {
    node_id: NodeId,
    bind_addr: SocketAddr,
    peers: RwLock<HashMap<NodeId, Arc<Peer>>>,
    on_message: RwLock<Option<MessageCallback>>,
    latency_ms: AtomicU64,
    metrics: MetricsHandle,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl Mesh {
    /// Create a mesh for `node_id` that will listen on `bind_addr`.
    pub fn new(node_id: NodeId, bind_addr: SocketAddr, metrics: MetricsHandle) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            node_id,
            bind_addr,
            peers: RwLock::new(HashMap::new()),
            on_message: RwLock::new(None),
            latency_ms: AtomicU64::new(0),
            metrics,
            shutdown_tx,
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Register the inbound message callback.
    pub fn set_on_message(&self, cb: MessageCallback) {
        *self.on_message.write() = Some(cb);
    }

    /// Delay outbound frames by the given duration. Zero disables.
    /// Intended for latency experiments and tests.
    pub fn set_simulated_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Bind and start accepting. Returns the bound address (useful when
    /// configured with port 0).
    pub async fn listen(self: &Arc<Self>) -> MeridianResult<SocketAddr> {
        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            MeridianError::transport(format!("failed to bind {}: {}", self.bind_addr, e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MeridianError::transport(format!("no local address: {}", e)))?;
        info!(node_id = self.node_id, addr = %local_addr, "mesh listening");

        let mesh = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let mesh = Arc::clone(&mesh);
                            tokio::spawn(async move {
                                mesh.handle_inbound(stream, remote).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                }
            }
            debug!("accept loop stopped");
        });

        Ok(local_addr)
    }

    /// Establish one outbound connection to a peer.
    pub async fn connect(self: &Arc<Self>, peer_id: NodeId, host: &str, port: u16) -> MeridianResult<()> {
        let mut stream = TcpStream::connect((host, port)).await.map_err(|e| {
            MeridianError::transport(format!("connect to {}:{} failed: {}", host, port, e))
        })?;
        let _ = stream.set_nodelay(true);

        stream
            .write_all(&self.node_id.to_le_bytes())
            .await
            .map_err(|e| MeridianError::transport(format!("handshake write failed: {}", e)))?;

        info!(peer_id, host, port, "connected to peer");
        self.register_connection(peer_id, stream);
        Ok(())
    }

    /// Stop accepting and drop every connection. Queued frames are
    /// discarded.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut peers = self.peers.write();
        for peer in peers.values() {
            peer.closed.store(true, Ordering::Relaxed);
        }
        peers.clear();
    }

    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream, remote: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut handshake = [0u8; 4];
        if let Err(e) = stream.read_exact(&mut handshake).await {
            warn!(%remote, error = %e, "handshake read failed");
            return;
        }
        let peer_id = NodeId::from_le_bytes(handshake);
        info!(peer_id, %remote, "accepted peer connection");
        self.register_connection(peer_id, stream);
    }

    /// Wire a connection into the peer table and spawn its reader and
    /// writer tasks. A later connection for the same peer replaces the
    /// table entry; the superseded tasks drain and exit on their own.
    fn register_connection(self: &Arc<Self>, peer_id: NodeId, stream: TcpStream) {
        let (mut read_half, mut write_half) = stream.into_split();
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Bytes>();
        let peer = Arc::new(Peer {
            id: peer_id,
            outbox,
            closed: AtomicBool::new(false),
        });
        self.peers.write().insert(peer_id, Arc::clone(&peer));

        let writer_mesh = Arc::clone(self);
        let writer_peer = Arc::clone(&peer);
        tokio::spawn(async move {
            while let Some(frame) = outbox_rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!(peer_id = writer_peer.id, error = %e, "write failed; closing");
                    break;
                }
            }
            writer_mesh.deregister(&writer_peer);
        });

        let reader_mesh = Arc::clone(self);
        let reader_peer = peer;
        tokio::spawn(async move {
            let mut header = [0u8; FRAME_HEADER_LEN];
            loop {
                if read_half.read_exact(&mut header).await.is_err() {
                    break;
                }
                let lane_raw = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
                let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
                if size > MAX_FRAME_SIZE {
                    warn!(peer_id, size, "oversized frame; closing connection");
                    break;
                }
                let mut body = vec![0u8; size as usize];
                if read_half.read_exact(&mut body).await.is_err() {
                    break;
                }

                let Some(lane) = Lane::from_u32(lane_raw) else {
                    warn!(peer_id, lane_raw, "unknown lane; dropping frame");
                    continue;
                };
                reader_mesh.metrics.counter_add(
                    &metrics::mesh_bytes_received(lane.name()),
                    size as u64,
                );

                let cb = reader_mesh.on_message.read().clone();
                if let Some(cb) = cb {
                    cb(peer_id, lane, body);
                }
            }
            reader_mesh.deregister(&reader_peer);
        });
    }

    /// Remove a peer entry, but only if it still refers to this
    /// connection — a replacement dialed in the meantime stays.
    fn deregister(&self, peer: &Arc<Peer>) {
        peer.closed.store(true, Ordering::Relaxed);
        let mut peers = self.peers.write();
        if let Some(current) = peers.get(&peer.id) {
            if Arc::ptr_eq(current, peer) {
                peers.remove(&peer.id);
                debug!(peer_id = peer.id, "peer deregistered");
            }
        }
    }

    fn frame(lane: Lane, payload: &[u8]) -> Bytes {
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.put_u32_le(lane.as_u32());
        frame.put_u32_le(payload.len() as u32);
        frame.put_slice(payload);
        frame.freeze()
    }
}

impl PeerTransport for Mesh {
    fn send(&self, peer_id: NodeId, lane: Lane, payload: Vec<u8>) -> bool {
        let peer = self.peers.read().get(&peer_id).cloned();
        let Some(peer) = peer else {
            return false;
        };
        if peer.closed.load(Ordering::Relaxed) {
            return false;
        }

        self.metrics
            .counter_add(&metrics::mesh_bytes_sent(lane.name()), payload.len() as u64);
        let frame = Self::frame(lane, &payload);

        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(latency)).await;
                if !peer.closed.load(Ordering::Relaxed) {
                    let _ = peer.outbox.send(frame);
                }
            });
            true
        } else {
            peer.outbox.send(frame).is_ok()
        }
    }

    fn active_peers(&self) -> Vec<NodeId> {
        self.peers
            .read()
            .values()
            .filter(|p| !p.closed.load(Ordering::Relaxed))
            .map(|p| p.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::observability::MetricsRegistry;

    #[test]
    fn lane_round_trips_through_the_wire_value() {
        for lane in [Lane::Control, Lane::Express, Lane::Standard, Lane::Heavy] {
            assert_eq!(Lane::from_u32(lane.as_u32()), Some(lane));
        }
        assert_eq!(Lane::from_u32(9), None);
    }

    #[test]
    fn frames_carry_lane_and_length() {
        let frame = Mesh::frame(Lane::Heavy, b"payload");
        assert_eq!(&frame[0..4], &3u32.to_le_bytes());
        assert_eq!(&frame[4..8], &7u32.to_le_bytes());
        assert_eq!(&frame[8..], b"payload");
    }

    #[test]
    fn send_to_unknown_peer_fails() {
        let registry = Arc::new(MetricsRegistry::new());
        let mesh = Mesh::new(1, "127.0.0.1:0".parse().unwrap(), registry);
        assert!(!mesh.send(42, Lane::Control, b"hello".to_vec()));
        assert!(mesh.active_peers().is_empty());
    }
}
