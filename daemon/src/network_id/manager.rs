//! Root state of the network-id manager and the inbound packet dispatch.

use std::{
    collections::VecDeque,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use log::{info, trace, warn};
use lru::LruCache;
use veil_common::tokio::{spawn_task, sync::Mutex};

use super::{
    config::{NetworkIdConfig, COMPLETED_UIDS_CACHE_SIZE, PING_VOLLEYS_PER_NETWORK_RECOMPUTE},
    group::GroupRegistry,
    matrix::SampleMatrix,
    packet::Packet,
    peer::{Peer, PeerId, SecretResponse},
    peer_list::PeerList,
    secret_store::SecretStore,
};

// Compile-time validation that the dedupe cache size is non-zero,
// which makes NonZeroUsize::new_unchecked safe below
const _: () = assert!(
    COMPLETED_UIDS_CACHE_SIZE > 0,
    "COMPLETED_UIDS_CACHE_SIZE must be non-zero"
);

// State of the probe work queue, all under one lock
pub(super) struct WorkQueue {
    // peers waiting to be measured
    pub queue: VecDeque<PeerId>,
    // target of the volley in flight; only one tick may ever process
    pub processing: Option<PeerId>,
    // volleys until the next network reckoning
    pub ping_volleys_to_go: u32,
    // volleys left before reckoning is allowed at all
    pub startup_checks: usize,
}

/// The network-id manager.
///
/// Owns the secret store, the sample matrix and the group registry;
/// the server role answers inbound packets, the prober measures every
/// neighbour, and the reckoner periodically turns the samples into
/// labelled network groups.
pub struct NetworkIdManager {
    pub(super) config: NetworkIdConfig,
    pub(super) peer_list: Arc<PeerList>,
    pub(super) secrets: SecretStore,
    pub(super) matrix: SampleMatrix,
    pub(super) registry: GroupRegistry,
    // recently completed probe uids, for loop rejection
    completed: Mutex<LruCache<u64, ()>>,
    // serialises the reckoner with the reactive path
    pub(super) dont_start_please: Mutex<()>,
    // raised while a reckoning replaces the registry
    pub(super) in_transition: AtomicBool,
    pub(super) work_queue: Mutex<WorkQueue>,
    pub(super) secret_ping_successes: AtomicU64,
    pub(super) total_secret_ping_attempts: AtomicU64,
    running: AtomicBool,
}

impl NetworkIdManager {
    pub fn new(config: NetworkIdConfig, peer_list: Arc<PeerList>) -> Arc<Self> {
        Arc::new(Self {
            config,
            peer_list,
            secrets: SecretStore::new(),
            matrix: SampleMatrix::new(),
            registry: GroupRegistry::new(),
            completed: Mutex::new(LruCache::new(
                // SAFETY: Compile-time assertion above guarantees COMPLETED_UIDS_CACHE_SIZE > 0
                unsafe { NonZeroUsize::new_unchecked(COMPLETED_UIDS_CACHE_SIZE) },
            )),
            dont_start_please: Mutex::new(()),
            in_transition: AtomicBool::new(false),
            work_queue: Mutex::new(WorkQueue {
                queue: VecDeque::new(),
                processing: None,
                ping_volleys_to_go: PING_VOLLEYS_PER_NETWORK_RECOMPUTE,
                startup_checks: 0,
            }),
            secret_ping_successes: AtomicU64::new(0),
            total_secret_ping_attempts: AtomicU64::new(0),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &NetworkIdConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the periodic prober, unless it is disabled.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            if log::log_enabled!(log::Level::Warn) {
                warn!("Network-id manager already running");
            }
            return;
        }

        if !self.config.secret_pinger_enabled() {
            info!("Secret pinger is disabled, network groups will not be measured");
            return;
        }

        let manager = Arc::clone(self);
        spawn_task("network-id-prober", async move {
            manager.prober_loop().await;
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Route one inbound packet from a connected peer.
    ///
    /// Responses wake up whoever is waiting on them; requests run the
    /// server role, with the forwarding handler on its own task so the
    /// read path never blocks behind a wait.
    pub async fn handle_packet(self: &Arc<Self>, peer: &Arc<Peer>, packet: Packet) {
        match packet {
            Packet::StoreSecret(msg) => self.handle_store_secret(peer, msg).await,
            Packet::SecretPing(msg) => {
                let manager = Arc::clone(self);
                let source = Arc::clone(peer);
                spawn_task("network-id-ping", async move {
                    manager.handle_secret_ping(&source, msg).await;
                });
            }
            Packet::Accepted(msg) => peer.notify_accepted(msg).await,
            Packet::SecretPong(msg) => {
                peer.notify_secret_response(msg.uid, SecretResponse::Pong(msg))
                    .await
            }
            Packet::RejectedLoop(msg) => {
                peer.notify_secret_response(msg.uid, SecretResponse::Rejected(msg))
                    .await
            }
            Packet::NetworkId(msg) => {
                let manager = Arc::clone(self);
                let source = Arc::clone(peer);
                spawn_task("network-id-react", async move {
                    manager.on_peer_announced_network_id(&source, msg.id).await;
                });
            }
        }
    }

    // Has this probe uid been seen to completion recently?
    pub(super) async fn recently_completed(&self, uid: u64) -> bool {
        let completed = self.completed.lock().await;
        completed.contains(&uid)
    }

    pub(super) async fn mark_completed(&self, uid: u64) {
        let mut completed = self.completed.lock().await;
        completed.put(uid, ());
    }

    /// Forget everything tied to a peer that went away. The work queue is
    /// left alone: a stale entry is dropped when it gets popped.
    pub async fn on_peer_disconnected(&self, peer: PeerId) {
        if log::log_enabled!(log::Level::Trace) {
            trace!("Dropping network-id state for departed peer {}", peer);
        }
        self.secrets.on_disconnect(peer).await;
        self.matrix.forget(peer).await;
    }

    /// Queue a peer for measurement, suppressing duplicates.
    pub async fn enqueue_probe(&self, peer: PeerId) {
        let mut wq = self.work_queue.lock().await;
        if wq.processing != Some(peer) && !wq.queue.contains(&peer) {
            wq.queue.push_back(peer);
        }
    }

    /// The network id the local node currently believes in.
    /// Lock-free; a stale read is acceptable.
    pub fn our_network_id(&self) -> i32 {
        self.registry.our_network_id()
    }

    /// (successes, attempts) over the life of the process.
    pub fn ping_stats(&self) -> (u64, u64) {
        (
            self.secret_ping_successes.load(Ordering::SeqCst),
            self.total_secret_ping_attempts.load(Ordering::SeqCst),
        )
    }
}
