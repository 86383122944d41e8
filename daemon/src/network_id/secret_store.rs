//! Store for secrets lodged at this node by its neighbours.

use std::collections::HashMap;

use log::trace;
use veil_common::tokio::sync::Mutex;

use super::peer::PeerId;

/// A secret a neighbour lodged here, waiting for its ping to arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredSecret {
    pub peer: PeerId,
    pub uid: u64,
    pub secret: u64,
}

// Both indexes live under one lock so a by-uid hit can never point at a
// peer whose entry was already evicted.
struct Indexes {
    by_peer: HashMap<PeerId, StoredSecret>,
    by_uid: HashMap<u64, StoredSecret>,
}

/// Two-way index over stored secrets: at most one live entry per peer.
pub struct SecretStore {
    indexes: Mutex<Indexes>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self {
            indexes: Mutex::new(Indexes {
                by_peer: HashMap::new(),
                by_uid: HashMap::new(),
            }),
        }
    }

    // Store a secret for a peer, replacing any prior entry it had
    pub async fn put(&self, peer: PeerId, uid: u64, secret: u64) {
        if log::log_enabled!(log::Level::Trace) {
            trace!("Storing secret {:#018x} for peer {}", uid, peer);
        }
        let entry = StoredSecret { peer, uid, secret };
        let mut indexes = self.indexes.lock().await;
        if let Some(old) = indexes.by_peer.insert(peer, entry) {
            indexes.by_uid.remove(&old.uid);
        }
        indexes.by_uid.insert(uid, entry);
    }

    pub async fn by_uid(&self, uid: u64) -> Option<StoredSecret> {
        let indexes = self.indexes.lock().await;
        indexes.by_uid.get(&uid).copied()
    }

    // Drop whatever the peer had lodged here
    pub async fn on_disconnect(&self, peer: PeerId) {
        let mut indexes = self.indexes.lock().await;
        if let Some(old) = indexes.by_peer.remove(&peer) {
            indexes.by_uid.remove(&old.uid);
        }
    }

    pub async fn len(&self) -> usize {
        let indexes = self.indexes.lock().await;
        indexes.by_peer.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}
