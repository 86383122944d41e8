//! Registry of directly-connected neighbours and the routing oracle
//! over their positions on the location circle.

use std::{collections::HashSet, sync::Arc};

use indexmap::IndexMap;
use log::trace;
use rand::Rng;
use veil_common::tokio::sync::RwLock;

use super::peer::{Peer, PeerId};

/// Distance between two points on the unit circle of locations.
pub fn location_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).abs();
    d.min(1.0 - d)
}

/// Connected peers keyed by id, in connection order.
pub struct PeerList {
    peers: RwLock<IndexMap<PeerId, Arc<Peer>>>,
}

impl PeerList {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(IndexMap::new()),
        }
    }

    pub async fn add_peer(&self, peer: Arc<Peer>) {
        if log::log_enabled!(log::Level::Trace) {
            trace!("Adding {} to the peer list", peer);
        }
        let mut peers = self.peers.write().await;
        peers.insert(peer.get_id(), peer);
    }

    // Drop the peer and wake up everything waiting on it
    pub async fn remove_peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        let removed = {
            let mut peers = self.peers.write().await;
            peers.shift_remove(&id)
        };
        if let Some(peer) = &removed {
            peer.disconnect();
        }
        removed
    }

    pub async fn get_peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        let peers = self.peers.read().await;
        peers.get(&id).cloned()
    }

    // Snapshot of every peer that is still connected
    pub async fn connected_peers(&self) -> Vec<Arc<Peer>> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| p.is_connected())
            .cloned()
            .collect()
    }

    pub async fn quick_count_connected_peers(&self) -> usize {
        let peers = self.peers.read().await;
        peers.values().filter(|p| p.is_connected()).count()
    }

    /// Routing oracle: the connected peer closest to `target_location`,
    /// skipping `source` and everything in `exclude`.
    pub async fn closer_peer(
        &self,
        source: Option<PeerId>,
        exclude: &HashSet<PeerId>,
        target_location: f64,
    ) -> Option<Arc<Peer>> {
        let peers = self.peers.read().await;
        let mut best: Option<(&Arc<Peer>, f64)> = None;
        for peer in peers.values() {
            if !peer.is_connected() {
                continue;
            }
            if Some(peer.get_id()) == source || exclude.contains(&peer.get_id()) {
                continue;
            }
            let distance = location_distance(peer.get_location(), target_location);
            match best {
                Some((_, best_distance)) if best_distance <= distance => {}
                _ => best = Some((peer, distance)),
            }
        }
        best.map(|(peer, _)| Arc::clone(peer))
    }

    /// A uniformly random connected peer other than `source`.
    pub async fn get_random_peer(&self, source: Option<PeerId>) -> Option<Arc<Peer>> {
        let peers = self.peers.read().await;
        let candidates: Vec<&Arc<Peer>> = peers
            .values()
            .filter(|p| p.is_connected() && Some(p.get_id()) != source)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Some(Arc::clone(candidates[index]))
    }
}

impl Default for PeerList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn peer_list_with(locations: &[f64]) -> PeerList {
        let list = PeerList::new();
        for (i, &location) in locations.iter().enumerate() {
            let (peer, _rx) = Peer::new(i as PeerId + 1, location);
            list.add_peer(Arc::new(peer)).await;
        }
        list
    }

    #[test]
    fn test_location_distance_wraps() {
        assert!((location_distance(0.1, 0.9) - 0.2).abs() < 1e-9);
        assert!((location_distance(0.25, 0.5) - 0.25).abs() < 1e-9);
        assert_eq!(location_distance(0.4, 0.4), 0.0);
    }

    #[tokio::test]
    async fn test_closer_peer_picks_nearest() {
        let list = peer_list_with(&[0.1, 0.5, 0.85]).await;
        let nearest = list
            .closer_peer(None, &HashSet::new(), 0.9)
            .await
            .unwrap();
        assert_eq!(nearest.get_id(), 3);
    }

    #[tokio::test]
    async fn test_closer_peer_honours_exclusions() {
        let list = peer_list_with(&[0.1, 0.5, 0.85]).await;
        let mut exclude = HashSet::new();
        exclude.insert(3);
        let nearest = list.closer_peer(Some(1), &exclude, 0.9).await.unwrap();
        assert_eq!(nearest.get_id(), 2);

        exclude.insert(2);
        assert!(list.closer_peer(Some(1), &exclude, 0.9).await.is_none());
    }

    #[tokio::test]
    async fn test_random_peer_skips_source() {
        let list = peer_list_with(&[0.1, 0.5]).await;
        for _ in 0..16 {
            let peer = list.get_random_peer(Some(1)).await.unwrap();
            assert_eq!(peer.get_id(), 2);
        }
    }

    #[tokio::test]
    async fn test_disconnected_peers_are_invisible() {
        let list = peer_list_with(&[0.1, 0.5]).await;
        assert_eq!(list.quick_count_connected_peers().await, 2);

        let removed = list.remove_peer(2).await.unwrap();
        assert!(!removed.is_connected());
        assert_eq!(list.quick_count_connected_peers().await, 1);
        assert!(list
            .closer_peer(None, &HashSet::new(), 0.5)
            .await
            .map(|p| p.get_id() == 1)
            .unwrap_or(false));
    }
}
