use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    hash::{Hash as StdHash, Hasher},
    sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
    time::Duration,
};

use log::{debug, warn};
use veil_common::tokio::{
    select,
    sync::{broadcast, mpsc, oneshot, Mutex},
    time::timeout,
};

use crate::config::MAX_HTL;

use super::{
    config::PEER_PACKET_CHANNEL_SIZE,
    error::{NetworkIdError, NetworkIdResult},
    packet::{Accepted, Packet, RejectedLoop, SecretPing, SecretPong, StoreSecret},
};

pub type PeerId = u64;

pub type Tx = mpsc::Sender<Packet>;
pub type Rx = mpsc::Receiver<Packet>;

/// Terminal answer to a secret ping: either the secret came back or the
/// path was rejected somewhere along the way.
#[derive(Debug, Clone, Copy)]
pub enum SecretResponse {
    Pong(SecretPong),
    Rejected(RejectedLoop),
}

// A Peer is the handle for one directly-connected neighbour.
// It owns the outbound packet channel and the maps used to await
// responses to in-flight requests, keyed by probe uid.
pub struct Peer {
    // unique ID of the peer to recognize him
    id: PeerId,
    // position of the peer on the routing circle, in [0, 1)
    location: f64,
    // Channel to send packets to the writer task
    tx: Tx,
    connected: AtomicBool,
    // Channel to notify pending waits that the peer is gone
    exit_channel: broadcast::Sender<()>,
    // network id this peer last announced for itself
    provided_network_id: AtomicI32,
    // network id we last assigned to this peer
    assigned_network_id: AtomicI32,
    // registry slot of the group this peer last landed in, offset by
    // one so that zero can mean "none"; a derived projection only
    network_group: AtomicUsize,
    // pending waits for an Accepted ack, keyed by uid
    pending_accepts: Mutex<HashMap<u64, oneshot::Sender<Accepted>>>,
    // pending waits for a SecretPong / RejectedLoop, keyed by uid
    pending_secrets: Mutex<HashMap<u64, oneshot::Sender<SecretResponse>>>,
}

impl Peer {
    pub fn new(id: PeerId, location: f64) -> (Self, Rx) {
        let (exit_channel, _) = broadcast::channel(1);
        let (tx, rx) = mpsc::channel(PEER_PACKET_CHANNEL_SIZE);

        (
            Self {
                id,
                location,
                tx,
                connected: AtomicBool::new(true),
                exit_channel,
                provided_network_id: AtomicI32::new(0),
                assigned_network_id: AtomicI32::new(0),
                network_group: AtomicUsize::new(0),
                pending_accepts: Mutex::new(HashMap::new()),
                pending_secrets: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }

    // Get the unique ID of the peer
    pub fn get_id(&self) -> PeerId {
        self.id
    }

    // Get the position of the peer on the routing circle
    pub fn get_location(&self) -> f64 {
        self.location
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    // Mark the peer gone and wake up every pending wait
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // nobody listening is fine, there was nothing to wake
        let _ = self.exit_channel.send(());
    }

    // Subscribe to the exit channel to be notified when peer disconnects
    pub fn get_exit_receiver(&self) -> broadcast::Receiver<()> {
        self.exit_channel.subscribe()
    }

    // Get the network id this peer last announced for itself
    pub fn provided_network_id(&self) -> i32 {
        self.provided_network_id.load(Ordering::SeqCst)
    }

    pub fn set_provided_network_id(&self, id: i32) {
        self.provided_network_id.store(id, Ordering::SeqCst);
    }

    // Get the network id we last assigned to this peer
    pub fn assigned_network_id(&self) -> i32 {
        self.assigned_network_id.load(Ordering::SeqCst)
    }

    pub fn set_assigned_network_id(&self, id: i32) {
        self.assigned_network_id.store(id, Ordering::SeqCst);
    }

    // Registry slot of the group this peer last landed in
    pub fn network_group(&self) -> Option<usize> {
        match self.network_group.load(Ordering::SeqCst) {
            0 => None,
            slot => Some(slot - 1),
        }
    }

    pub fn set_network_group(&self, slot: usize) {
        self.network_group.store(slot + 1, Ordering::SeqCst);
    }

    // Enforce the hop budget policy for this link: an inflated HTL is
    // clamped to the node ceiling before the decrement
    pub fn decrement_htl(&self, htl: i16) -> i16 {
        let htl = htl.min(MAX_HTL);
        (htl - 1).max(0)
    }

    // Send a packet to the peer
    pub async fn send_packet(&self, packet: Packet) -> NetworkIdResult<()> {
        if !self.is_connected() {
            return Err(NetworkIdError::Disconnected);
        }
        self.tx
            .send(packet)
            .await
            .map_err(|e| NetworkIdError::SendError(e.to_string()))
    }

    // Lodge a secret at this peer and wait for the ack.
    // The waiter is registered and the packet sent under the same lock
    // so a fast answer cannot slip past us.
    pub async fn request_store_secret(
        &self,
        msg: StoreSecret,
        duration: Duration,
    ) -> NetworkIdResult<Accepted> {
        let uid = msg.uid;
        let receiver = {
            let mut pending = self.pending_accepts.lock().await;
            self.send_packet(Packet::StoreSecret(msg)).await?;
            let (sender, receiver) = oneshot::channel();
            if pending.insert(uid, sender).is_some() {
                if log::log_enabled!(log::Level::Warn) {
                    warn!("A store-secret for {:#018x} was already pending on {}", uid, self);
                }
            }
            receiver
        };

        self.wait_response(&self.pending_accepts, uid, receiver, duration)
            .await
    }

    // Send a secret ping to this peer and wait for the terminal answer
    pub async fn request_secret_ping(
        &self,
        msg: SecretPing,
        duration: Duration,
    ) -> NetworkIdResult<SecretResponse> {
        let uid = msg.uid;
        let receiver = {
            let mut pending = self.pending_secrets.lock().await;
            self.send_packet(Packet::SecretPing(msg)).await?;
            let (sender, receiver) = oneshot::channel();
            if pending.insert(uid, sender).is_some() {
                if log::log_enabled!(log::Level::Warn) {
                    warn!("A secret ping for {:#018x} was already pending on {}", uid, self);
                }
            }
            receiver
        };

        self.wait_response(&self.pending_secrets, uid, receiver, duration)
            .await
    }

    async fn wait_response<T>(
        &self,
        pending: &Mutex<HashMap<u64, oneshot::Sender<T>>>,
        uid: u64,
        receiver: oneshot::Receiver<T>,
        duration: Duration,
    ) -> NetworkIdResult<T> {
        let mut exit_channel = self.get_exit_receiver();
        select! {
            _ = exit_channel.recv() => Err(NetworkIdError::Disconnected),
            res = timeout(duration, receiver) => match res {
                Ok(Ok(msg)) => Ok(msg),
                // sender dropped without an answer, the peer is gone
                Ok(Err(_)) => Err(NetworkIdError::Disconnected),
                Err(e) => {
                    pending.lock().await.remove(&uid);
                    Err(NetworkIdError::AsyncTimeOut(e))
                }
            }
        }
    }

    // Hand an inbound Accepted to whoever is waiting on it
    pub async fn notify_accepted(&self, msg: Accepted) {
        let sender = self.pending_accepts.lock().await.remove(&msg.uid);
        match sender {
            Some(sender) => {
                if sender.send(msg).is_err() && log::log_enabled!(log::Level::Debug) {
                    debug!("Waiter for accept {:#018x} on {} gave up", msg.uid, self);
                }
            }
            None => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Unclaimed Accepted {:#018x} from {}", msg.uid, self);
                }
            }
        }
    }

    // Hand an inbound pong or rejection to whoever is waiting on it
    pub async fn notify_secret_response(&self, uid: u64, response: SecretResponse) {
        let sender = self.pending_secrets.lock().await.remove(&uid);
        match sender {
            Some(sender) => {
                if sender.send(response).is_err() && log::log_enabled!(log::Level::Debug) {
                    debug!("Waiter for probe {:#018x} on {} gave up", uid, self);
                }
            }
            None => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Unclaimed probe response {:#018x} from {}", uid, self);
                }
            }
        }
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Peer[id: {}, location: {:.4}, connected: {}]",
            self.id,
            self.location,
            self.is_connected()
        )
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.get_id() == other.get_id()
    }
}

impl Eq for Peer {}

impl StdHash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.get_id().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_store_secret_round_trip() {
        let (peer, mut rx) = Peer::new(1, 0.25);
        let msg = StoreSecret::new(42, 0xDEAD);

        let wait = peer.request_store_secret(msg, Duration::from_secs(1));
        let notify = async {
            // the packet must already be on the wire before the answer
            match rx.recv().await.unwrap() {
                Packet::StoreSecret(sent) => assert_eq!(sent, msg),
                other => panic!("unexpected packet {:?}", other),
            }
            peer.notify_accepted(Accepted::new(42)).await;
        };

        let (res, _) = tokio::join!(wait, notify);
        assert_eq!(res.unwrap().uid, 42);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (peer, _rx) = Peer::new(1, 0.25);
        let res = peer
            .request_store_secret(StoreSecret::new(7, 7), Duration::from_millis(20))
            .await;
        assert!(matches!(res, Err(NetworkIdError::AsyncTimeOut(_))));
    }

    #[tokio::test]
    async fn test_disconnect_aborts_wait() {
        let (peer, _rx) = Peer::new(1, 0.25);
        let wait = peer.request_store_secret(StoreSecret::new(7, 7), Duration::from_secs(5));
        let drop_peer = async {
            peer.disconnect();
        };
        let (res, _) = tokio::join!(wait, drop_peer);
        assert!(matches!(res, Err(NetworkIdError::Disconnected)));
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn test_decrement_htl_clamps_to_ceiling() {
        let (peer, _rx) = Peer::new(1, 0.0);
        // an inflated budget buys nothing
        assert_eq!(peer.decrement_htl(1000), MAX_HTL - 1);
        assert_eq!(peer.decrement_htl(5), 4);
        assert_eq!(peer.decrement_htl(0), 0);
    }

    #[tokio::test]
    async fn test_network_group_projection() {
        let (peer, _rx) = Peer::new(1, 0.0);
        assert_eq!(peer.network_group(), None);
        peer.set_network_group(0);
        assert_eq!(peer.network_group(), Some(0));
        peer.set_network_group(3);
        assert_eq!(peer.network_group(), Some(3));
    }
}
