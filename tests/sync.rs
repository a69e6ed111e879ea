//! Anti-entropy and transport integration tests over real sockets.

mod common;

use common::{test_node, TestNode};
use meridian::engine::merkle::leaf_index;
use meridian::engine::MetaRecord;
use meridian::mesh::{Lane, Mesh, PeerTransport};
use meridian::sync::SyncManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

struct SyncNode {
    node: TestNode,
    mesh: Arc<Mesh>,
    sync: Arc<SyncManager<Mesh>>,
    addr: SocketAddr,
}

/// Boot an engine + mesh + sync manager on an ephemeral loopback port.
async fn start_sync_node(node_id: u32) -> SyncNode {
    let node = test_node(node_id);
    let mesh = Arc::new(Mesh::new(
        node_id,
        "127.0.0.1:0".parse().unwrap(),
        Arc::clone(&node.metrics),
    ));
    let sync = Arc::new(SyncManager::new(
        Arc::clone(&mesh),
        Arc::clone(&node.engine),
        Duration::from_millis(100),
        Arc::clone(&node.metrics),
    ));

    let handler = Arc::clone(&sync);
    mesh.set_on_message(Arc::new(move |from, lane, payload| {
        handler.handle_message(from, lane, &payload);
    }));

    let addr = mesh.listen().await.expect("listen failed");
    SyncNode {
        node,
        mesh,
        sync,
        addr,
    }
}

/// Trigger gossip on both sides until `done` holds or the deadline passes.
async fn converge(nodes: &[&SyncNode], done: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if done() {
            return true;
        }
        for node in nodes {
            node.sync.trigger();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    done()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_nodes_converge_on_one_hundred_keys() {
    let a = start_sync_node(1).await;
    let b = start_sync_node(2).await;
    a.mesh.connect(2, "127.0.0.1", b.addr.port()).await.unwrap();

    for i in 0..100 {
        a.node
            .engine
            .put(
                format!("key/{i}").as_bytes(),
                format!(r#"{{"seq": {i}}}"#).as_bytes(),
            )
            .unwrap();
    }
    assert_ne!(
        a.node.engine.merkle_root_hash(),
        b.node.engine.merkle_root_hash()
    );

    let converged = converge(&[&a, &b], || {
        a.node.engine.merkle_root_hash() == b.node.engine.merkle_root_hash()
    })
    .await;
    assert!(converged, "replicas did not converge");

    for i in 0..100 {
        let key = format!("key/{i}");
        assert_eq!(
            a.node.engine.get(key.as_bytes()),
            b.node.engine.get(key.as_bytes()),
            "value mismatch on {key}"
        );
        let meta_key = format!("{key}:meta");
        assert_eq!(
            a.node.engine.get(meta_key.as_bytes()),
            b.node.engine.get(meta_key.as_bytes()),
            "meta mismatch on {key}"
        );
    }
    assert!(b.node.metrics.counter_get("meridian.sync.keys_repaired") >= 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deletions_propagate_as_tombstones() {
    let a = start_sync_node(1).await;
    let b = start_sync_node(2).await;
    a.mesh.connect(2, "127.0.0.1", b.addr.port()).await.unwrap();

    a.node.engine.put(b"keep", br#"{"v": 1}"#).unwrap();
    a.node.engine.put(b"drop", br#"{"v": 2}"#).unwrap();
    a.node.engine.del(b"drop").unwrap();

    let converged = converge(&[&a, &b], || {
        a.node.engine.merkle_root_hash() == b.node.engine.merkle_root_hash()
    })
    .await;
    assert!(converged);

    assert!(!b.node.engine.get(b"keep").is_empty());
    assert!(b.node.engine.get(b"drop").is_empty());
    let meta = MetaRecord::parse(&b.node.engine.get(b"drop:meta")).unwrap();
    assert!(meta.tombstone);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bidirectional_divergence_merges_both_ways() {
    let a = start_sync_node(1).await;
    let b = start_sync_node(2).await;
    a.mesh.connect(2, "127.0.0.1", b.addr.port()).await.unwrap();

    for i in 0..20 {
        a.node
            .engine
            .put(format!("from-a/{i}").as_bytes(), br#"{"origin": "a"}"#)
            .unwrap();
        b.node
            .engine
            .put(format!("from-b/{i}").as_bytes(), br#"{"origin": "b"}"#)
            .unwrap();
    }

    let converged = converge(&[&a, &b], || {
        a.node.engine.merkle_root_hash() == b.node.engine.merkle_root_hash()
    })
    .await;
    assert!(converged);

    for i in 0..20 {
        assert!(!a.node.engine.get(format!("from-b/{i}").as_bytes()).is_empty());
        assert!(!b.node.engine.get(format!("from-a/{i}").as_bytes()).is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_writer_wins_after_partition_heals() {
    let a = start_sync_node(1).await;
    let b = start_sync_node(2).await;
    let c = start_sync_node(3).await;

    // Nodes 1 and 2 are connected; node 3 starts partitioned.
    a.mesh.connect(2, "127.0.0.1", b.addr.port()).await.unwrap();

    a.node.engine.put(b"contested", br#"{"val": "A"}"#).unwrap();
    let converged = converge(&[&a, &b], || {
        a.node.engine.merkle_root_hash() == b.node.engine.merkle_root_hash()
    })
    .await;
    assert!(converged);

    // The partitioned node writes later; its hybrid clock is ahead in
    // wall time, so its write must win everywhere after the heal.
    tokio::time::sleep(Duration::from_millis(20)).await;
    c.node.engine.put(b"contested", br#"{"val": "B"}"#).unwrap();

    c.mesh.connect(1, "127.0.0.1", a.addr.port()).await.unwrap();
    c.mesh.connect(2, "127.0.0.1", b.addr.port()).await.unwrap();

    let all_converged = converge(&[&a, &b, &c], || {
        let root = c.node.engine.merkle_root_hash();
        a.node.engine.merkle_root_hash() == root && b.node.engine.merkle_root_hash() == root
    })
    .await;
    assert!(all_converged, "three-way convergence failed");

    for node in [&a, &b, &c] {
        let value: serde_json::Value =
            serde_json::from_slice(&node.node.engine.get(b"contested")).unwrap();
        assert_eq!(value["val"], "B");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_value_transfers_byte_for_byte() {
    let a = start_sync_node(1).await;
    let b = start_sync_node(2).await;
    a.mesh.connect(2, "127.0.0.1", b.addr.port()).await.unwrap();

    // A megabyte of non-JSON bytes rides the Heavy lane in one frame.
    let payload: Vec<u8> = (0..1_048_576u32).map(|i| (i * 31 % 251) as u8).collect();
    a.node.engine.put(b"bulk/blob", &payload).unwrap();

    let converged = converge(&[&a, &b], || {
        a.node.engine.merkle_root_hash() == b.node.engine.merkle_root_hash()
    })
    .await;
    assert!(converged);
    assert_eq!(b.node.engine.get(b"bulk/blob"), payload);
    assert!(b.node.metrics.counter_get("meridian.mesh.bytes_received.heavy") >= payload.len() as u64);
}

/// Mine keys that share one Merkle leaf so a single bucket listing has to
/// carry them all.
fn colliding_keys(count: usize) -> Vec<Vec<u8>> {
    let target = leaf_index(b"bucket-seed/0");
    let mut keys = vec![b"bucket-seed/0".to_vec()];
    let mut i = 1u64;
    while keys.len() < count {
        let candidate = format!("bucket-seed/{i}").into_bytes();
        if leaf_index(&candidate) == target {
            keys.push(candidate);
        }
        i += 1;
    }
    keys
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crowded_bucket_repairs_in_one_listing() {
    let a = start_sync_node(1).await;
    let b = start_sync_node(2).await;
    a.mesh.connect(2, "127.0.0.1", b.addr.port()).await.unwrap();

    let keys = colliding_keys(24);
    for (i, key) in keys.iter().enumerate() {
        a.node
            .engine
            .put(key, format!(r#"{{"n": {i}}}"#).as_bytes())
            .unwrap();
    }

    let converged = converge(&[&a, &b], || {
        a.node.engine.merkle_root_hash() == b.node.engine.merkle_root_hash()
    })
    .await;
    assert!(converged);
    for key in &keys {
        assert_eq!(a.node.engine.get(key), b.node.engine.get(key));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn frames_preserve_order_and_peer_identity() {
    let registry_a = Arc::new(meridian::MetricsRegistry::new());
    let registry_b = Arc::new(meridian::MetricsRegistry::new());
    let a = Arc::new(Mesh::new(1, "127.0.0.1:0".parse().unwrap(), registry_a));
    let b = Arc::new(Mesh::new(2, "127.0.0.1:0".parse().unwrap(), registry_b));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    b.set_on_message(Arc::new(move |from, lane, payload| {
        let _ = tx.send((from, lane, payload));
    }));

    let addr_b = b.listen().await.unwrap();
    a.connect(2, "127.0.0.1", addr_b.port()).await.unwrap();

    for i in 0..100u32 {
        assert!(a.send(2, Lane::Standard, i.to_le_bytes().to_vec()));
    }

    for i in 0..100u32 {
        let (from, lane, payload) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        assert_eq!(from, 1, "acceptor must report the handshake peer id");
        assert_eq!(lane, Lane::Standard);
        assert_eq!(payload, i.to_le_bytes().to_vec());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undecodable_sync_payloads_are_dropped() {
    let a = start_sync_node(1).await;
    let b = start_sync_node(2).await;
    a.mesh.connect(2, "127.0.0.1", b.addr.port()).await.unwrap();

    assert!(a.mesh.send(2, Lane::Control, vec![0xFF, 1, 2]));
    assert!(a.mesh.send(2, Lane::Control, Vec::new()));

    let counted = converge(&[&a, &b], || {
        b.node.metrics.counter_get("meridian.sync.decode_errors") >= 2
    })
    .await;
    assert!(counted, "decode errors were not counted");

    // The connection survives garbage; real traffic still flows.
    a.node.engine.put(b"after-garbage", b"ok").unwrap();
    let converged = converge(&[&a, &b], || !b.node.engine.get(b"after-garbage").is_empty()).await;
    assert!(converged);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn send_fails_once_the_peer_is_gone() {
    let a = start_sync_node(1).await;
    let b = start_sync_node(2).await;
    a.mesh.connect(2, "127.0.0.1", b.addr.port()).await.unwrap();
    assert!(a.mesh.send(2, Lane::Control, b"ping".to_vec()));

    b.mesh.shutdown();
    // The reader notices the close and deregisters the peer.
    let gone = converge(&[&a], || a.mesh.active_peers().is_empty()).await;
    assert!(gone, "closed peer never deregistered");
    assert!(!a.mesh.send(2, Lane::Control, b"ping".to_vec()));
}
