//! End-to-end scenarios over an in-memory mesh: every node runs a real
//! manager and packets travel through real channels.

use std::{collections::HashMap, sync::Arc, time::Duration};

use veil_common::tokio::spawn_task;

use super::{
    config::{ACCEPTED_TIMEOUT, BETWEEN_PEERS, LONG_PERIOD, NetworkIdConfig},
    manager::NetworkIdManager,
    packet::{SecretPing, StoreSecret},
    peer::{Peer, PeerId, Rx, SecretResponse},
    peer_list::PeerList,
};

struct TestNode {
    manager: Arc<NetworkIdManager>,
    peer_list: Arc<PeerList>,
    location: f64,
}

struct Mesh {
    nodes: Vec<TestNode>,
    // handles[(a, b)] is node a's handle for node b
    handles: HashMap<(usize, usize), Arc<Peer>>,
}

impl Mesh {
    fn handle(&self, a: usize, b: usize) -> Arc<Peer> {
        Arc::clone(&self.handles[&(a, b)])
    }
}

fn node_id(index: usize) -> PeerId {
    index as PeerId + 1
}

// Feed one direction of a link into the receiving node's manager
fn pump(mut rx: Rx, manager: Arc<NetworkIdManager>, source: Arc<Peer>) {
    spawn_task("test-pump", async move {
        while let Some(packet) = rx.recv().await {
            manager.handle_packet(&source, packet).await;
        }
    });
}

async fn build_mesh(locations: &[f64], edges: &[(usize, usize)], config: NetworkIdConfig) -> Mesh {
    let nodes: Vec<TestNode> = locations
        .iter()
        .map(|&location| {
            let peer_list = Arc::new(PeerList::new());
            let manager = NetworkIdManager::new(config.clone(), Arc::clone(&peer_list));
            TestNode {
                manager,
                peer_list,
                location,
            }
        })
        .collect();

    let mut handles = HashMap::new();
    for &(a, b) in edges {
        let (peer_ab, rx_ab) = Peer::new(node_id(b), nodes[b].location);
        let (peer_ba, rx_ba) = Peer::new(node_id(a), nodes[a].location);
        let peer_ab = Arc::new(peer_ab);
        let peer_ba = Arc::new(peer_ba);

        nodes[a].peer_list.add_peer(Arc::clone(&peer_ab)).await;
        nodes[b].peer_list.add_peer(Arc::clone(&peer_ba)).await;

        // what a sends to its handle for b arrives at b, attributed to a
        pump(rx_ab, Arc::clone(&nodes[b].manager), Arc::clone(&peer_ba));
        pump(rx_ba, Arc::clone(&nodes[a].manager), Arc::clone(&peer_ab));

        handles.insert((a, b), peer_ab);
        handles.insert((b, a), peer_ba);
    }

    Mesh { nodes, handles }
}

const A: usize = 0;
const B: usize = 1;
const C: usize = 2;

#[tokio::test]
async fn test_ping_travels_to_secret_holder() {
    // store a secret at B, then ping it from C through A; the pong
    // carries the secret and the hop count back
    let mesh = build_mesh(
        &[0.1, 0.5, 0.9],
        &[(A, B), (A, C)],
        NetworkIdConfig::enabled(),
    )
    .await;

    let uid = 0x1111;
    mesh.handle(A, B)
        .request_store_secret(StoreSecret::new(uid, 0xDEAD), ACCEPTED_TIMEOUT)
        .await
        .unwrap();

    let ping = SecretPing::new(uid, mesh.nodes[B].location, 6, 4, 0);
    let response = mesh
        .handle(C, A)
        .request_secret_ping(ping, Duration::from_secs(5))
        .await
        .unwrap();

    match response {
        SecretResponse::Pong(pong) => {
            assert_eq!(pong.uid, uid);
            assert_eq!(pong.counter, 2);
            assert_eq!(pong.secret, 0xDEAD);
        }
        SecretResponse::Rejected(_) => panic!("expected a pong"),
    }

    // the uid was burned while forwarding: a replay bounces as a loop
    let replay = SecretPing::new(uid, mesh.nodes[B].location, 6, 4, 0);
    let response = mesh
        .handle(C, A)
        .request_secret_ping(replay, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(response, SecretResponse::Rejected(_)));
}

#[tokio::test]
async fn test_ping_with_spent_prefix_is_rejected() {
    // same path, but the random prefix is already exhausted when the
    // ping lands at the secret holder: path too short
    let mesh = build_mesh(
        &[0.1, 0.5, 0.9],
        &[(A, B), (A, C)],
        NetworkIdConfig::enabled(),
    )
    .await;

    let uid = 0x2222;
    mesh.handle(A, B)
        .request_store_secret(StoreSecret::new(uid, 0xDEAD), ACCEPTED_TIMEOUT)
        .await
        .unwrap();

    let ping = SecretPing::new(uid, mesh.nodes[B].location, 6, 6, 0);
    let response = mesh
        .handle(C, A)
        .request_secret_ping(ping, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(matches!(response, SecretResponse::Rejected(_)));
}

#[tokio::test]
async fn test_unroutable_ping_gets_exactly_one_rejection() {
    // nobody holds the secret and A has no peer to forward to: the
    // chain terminates with a single upstream rejection
    let mesh = build_mesh(&[0.1, 0.9], &[(A, 1)], NetworkIdConfig::enabled()).await;

    let ping = SecretPing::new(0x3333, 0.4, 5, 5, 0);
    let response = mesh
        .handle(1, A)
        .request_secret_ping(ping, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(matches!(response, SecretResponse::Rejected(_)));
}

#[tokio::test]
async fn test_disabled_server_rejects_everything() {
    // flags off (the default): even a ping for a secret we hold bounces
    let mesh = build_mesh(&[0.1, 0.5], &[(A, B)], NetworkIdConfig::default()).await;

    let uid = 0x4444;
    mesh.handle(A, B)
        .request_store_secret(StoreSecret::new(uid, 0xBEEF), ACCEPTED_TIMEOUT)
        .await
        .unwrap();

    let ping = SecretPing::new(uid, mesh.nodes[B].location, 10, 8, 0);
    let response = mesh
        .handle(A, B)
        .request_secret_ping(ping, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(response, SecretResponse::Rejected(_)));
}

#[tokio::test]
async fn test_probe_round_trip_records_success() {
    // the full client side: lodge a secret at B, ping through C, and
    // watch the sample land in the matrix
    let mesh = build_mesh(
        &[0.1, 0.5, 0.9],
        &[(A, B), (A, C), (B, C)],
        NetworkIdConfig::enabled(),
    )
    .await;

    let manager = &mesh.nodes[A].manager;
    let target = mesh.handle(A, B);
    let next = mesh.handle(A, C);
    manager.blocking_update_ping_record(&target, &next).await;

    assert_eq!(manager.ping_stats(), (1, 1));
    assert_eq!(manager.matrix.average(node_id(B), node_id(C)).await, 1.0);
    // directionality: the mirror pair stays untouched
    assert_eq!(manager.matrix.sample_count(node_id(C), node_id(B)).await, 0);
}

#[tokio::test]
async fn test_probe_through_dead_end_records_failure() {
    // C's only neighbour is A, so the ping cannot go anywhere: the
    // probe fails and the failure is recorded as a sample
    let mesh = build_mesh(
        &[0.1, 0.5, 0.9],
        &[(A, B), (A, C)],
        NetworkIdConfig::enabled(),
    )
    .await;

    let manager = &mesh.nodes[A].manager;
    let target = mesh.handle(A, B);
    let next = mesh.handle(A, C);
    manager.blocking_update_ping_record(&target, &next).await;

    assert_eq!(manager.ping_stats(), (0, 1));
    assert_eq!(manager.matrix.average(node_id(B), node_id(C)).await, 0.0);
    assert_eq!(manager.matrix.sample_count(node_id(B), node_id(C)).await, 1);
}

#[tokio::test]
async fn test_probe_tick_drains_queue_and_reschedules() {
    let mesh = build_mesh(
        &[0.1, 0.5, 0.9],
        &[(A, B), (A, C), (B, C)],
        NetworkIdConfig::enabled(),
    )
    .await;

    let manager = &mesh.nodes[A].manager;
    manager.enqueue_probe(node_id(B)).await;

    let delay = manager.probe_tick().await;

    // B was probed through both of A's neighbours
    assert_eq!(manager.ping_stats(), (2, 2));
    assert!(manager.matrix.average(node_id(B), node_id(B)).await > 0.0);
    assert!(manager.matrix.average(node_id(B), node_id(C)).await > 0.0);

    // the queue was refilled with all connected peers, steady cadence
    assert_eq!(delay, LONG_PERIOD);
    let wq = manager.work_queue.lock().await;
    assert_eq!(wq.queue.len(), 2);
    assert_eq!(wq.processing, None);
}

#[tokio::test]
async fn test_reentrant_tick_is_skipped() {
    let mesh = build_mesh(&[0.1, 0.5], &[(A, B)], NetworkIdConfig::enabled()).await;
    let manager = &mesh.nodes[A].manager;

    {
        let mut wq = manager.work_queue.lock().await;
        wq.processing = Some(node_id(B));
        wq.queue.push_back(node_id(B));
    }

    let delay = manager.probe_tick().await;

    // the violating tick did nothing but reschedule
    assert_eq!(delay, BETWEEN_PEERS);
    assert_eq!(manager.ping_stats(), (0, 0));
    let wq = manager.work_queue.lock().await;
    assert_eq!(wq.queue.len(), 1);
}

#[tokio::test]
async fn test_disconnect_drops_probe_state() {
    let mesh = build_mesh(
        &[0.1, 0.5, 0.9],
        &[(A, B), (A, C), (B, C)],
        NetworkIdConfig::enabled(),
    )
    .await;

    let manager = &mesh.nodes[A].manager;
    let target = mesh.handle(A, B);
    let next = mesh.handle(A, C);
    manager.blocking_update_ping_record(&target, &next).await;
    assert_eq!(manager.matrix.sample_count(node_id(B), node_id(C)).await, 1);

    mesh.nodes[A].peer_list.remove_peer(node_id(B)).await;
    manager.on_peer_disconnected(node_id(B)).await;

    assert_eq!(manager.matrix.sample_count(node_id(B), node_id(C)).await, 0);
    assert!(!target.is_connected());
}
