//! Network groups and the ordered registry publishing "our" id.

use std::{
    collections::HashSet,
    fmt::{self, Display, Formatter},
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};

use indexmap::IndexMap;
use log::debug;
use veil_common::time::{get_current_time_in_millis, TimestampMillis};
use veil_common::tokio::sync::{Mutex, RwLock};

use super::{
    config::NO_NETWORKID,
    packet::{NetworkId, Packet},
    peer::{Peer, PeerId},
};

struct GroupState {
    network_id: i32,
    forbidden_ids: HashSet<i32>,
    last_assign: TimestampMillis,
}

/// A cluster of well-interconnected neighbours sharing one network id.
///
/// Membership is fixed at creation; the id, the forbidden set and the
/// assignment timestamp live behind a group-local lock.
pub struct PeerNetworkGroup {
    members: Vec<Arc<Peer>>,
    state: Mutex<GroupState>,
    our_group: AtomicBool,
}

impl PeerNetworkGroup {
    pub fn new(members: Vec<Arc<Peer>>, forbidden_ids: HashSet<i32>) -> Self {
        debug_assert!(!members.is_empty());
        Self {
            members,
            state: Mutex::new(GroupState {
                network_id: NO_NETWORKID,
                forbidden_ids,
                last_assign: 0,
            }),
            our_group: AtomicBool::new(false),
        }
    }

    pub fn members(&self) -> &[Arc<Peer>] {
        &self.members
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.members.iter().any(|p| p.get_id() == peer)
    }

    pub fn is_our_group(&self) -> bool {
        self.our_group.load(Ordering::SeqCst)
    }

    pub fn set_our_group(&self, value: bool) {
        self.our_group.store(value, Ordering::SeqCst);
    }

    pub async fn network_id(&self) -> i32 {
        self.state.lock().await.network_id
    }

    pub async fn forbidden_ids(&self) -> HashSet<i32> {
        self.state.lock().await.forbidden_ids.clone()
    }

    pub async fn set_forbidden(&self, forbidden_ids: HashSet<i32>) {
        self.state.lock().await.forbidden_ids = forbidden_ids;
    }

    // Was the group assigned within the given window?
    pub async fn recently_assigned(&self, window: Duration) -> bool {
        let last_assign = self.state.lock().await.last_assign;
        last_assign + window.as_millis() as u64 > get_current_time_in_millis()
    }

    /// Plurality of the non-forbidden, non-zero ids the members advertise.
    ///
    /// With one distinct option or none, falls back to the last id seen
    /// and then to the group's own current id.
    pub async fn consensus(&self) -> i32 {
        let (forbidden, current) = {
            let state = self.state.lock().await;
            (state.forbidden_ids.clone(), state.network_id)
        };

        let mut votes: IndexMap<i32, usize> = IndexMap::new();
        let mut last_seen = NO_NETWORKID;
        for member in &self.members {
            let id = member.provided_network_id();
            if id == NO_NETWORKID || forbidden.contains(&id) {
                continue;
            }
            *votes.entry(id).or_insert(0) += 1;
            last_seen = id;
        }

        if votes.len() <= 1 {
            if last_seen != NO_NETWORKID {
                return last_seen;
            }
            return current;
        }

        // plurality; the first option seen wins a tie
        let mut best = NO_NETWORKID;
        let mut best_count = 0;
        for (id, count) in votes {
            if count > best_count {
                best = id;
                best_count = count;
            }
        }
        best
    }

    /// Set the group id and push it onto every member: their projections
    /// are rewritten and the id is announced to them best-effort.
    pub async fn assign(&self, id: i32, slot: usize) {
        {
            let mut state = self.state.lock().await;
            state.network_id = id;
            state.last_assign = get_current_time_in_millis();
        }
        for member in &self.members {
            member.set_assigned_network_id(id);
            member.set_network_group(slot);
            if let Err(e) = member.send_packet(Packet::NetworkId(NetworkId::new(id))).await {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Could not announce network id {} to {}: {}", id, member, e);
                }
            }
        }
    }
}

impl Display for PeerNetworkGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PeerNetworkGroup[{} member(s), ours: {}]",
            self.members.len(),
            self.is_our_group()
        )
    }
}

/// The ordered list of network groups, highest priority first.
///
/// Replacement swaps the whole list at once; `our_network_id` is
/// published through an atomic so queries never take a lock.
pub struct GroupRegistry {
    groups: RwLock<Vec<Arc<PeerNetworkGroup>>>,
    our_network_id: AtomicI32,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(Vec::new()),
            our_network_id: AtomicI32::new(NO_NETWORKID),
        }
    }

    // The id of the group we believe we belong to; stale reads are fine
    pub fn our_network_id(&self) -> i32 {
        self.our_network_id.load(Ordering::SeqCst)
    }

    pub async fn groups(&self) -> Vec<Arc<PeerNetworkGroup>> {
        self.groups.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.groups.read().await.is_empty()
    }

    /// Install a freshly reckoned list: the local node is declared part
    /// of its most-connected group, whose id becomes ours.
    pub async fn replace(&self, groups: Vec<Arc<PeerNetworkGroup>>) {
        for (slot, group) in groups.iter().enumerate() {
            group.set_our_group(slot == 0);
        }
        let our_id = match groups.first() {
            Some(group) => group.network_id().await,
            None => NO_NETWORKID,
        };
        self.our_network_id.store(our_id, Ordering::SeqCst);
        *self.groups.write().await = groups;
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_id::peer::Rx;

    fn member(id: PeerId, provided: i32) -> (Arc<Peer>, Rx) {
        let (peer, rx) = Peer::new(id, 0.1 * id as f64);
        peer.set_provided_network_id(provided);
        (Arc::new(peer), rx)
    }

    #[tokio::test]
    async fn test_consensus_plurality() {
        let (a, _ra) = member(1, 99);
        let (b, _rb) = member(2, 99);
        let (c, _rc) = member(3, 7);
        let group = PeerNetworkGroup::new(vec![a, b, c], HashSet::new());

        assert_eq!(group.consensus().await, 99);
    }

    #[tokio::test]
    async fn test_consensus_ignores_forbidden_and_zero() {
        let (a, _ra) = member(1, 99);
        let (b, _rb) = member(2, 99);
        let (c, _rc) = member(3, 7);
        let (d, _rd) = member(4, NO_NETWORKID);
        let mut forbidden = HashSet::new();
        forbidden.insert(99);
        let group = PeerNetworkGroup::new(vec![a, b, c, d], forbidden);

        // 99 is taken by a higher-priority group, 7 is the only vote left
        assert_eq!(group.consensus().await, 7);
    }

    #[tokio::test]
    async fn test_consensus_falls_back_to_current_id() {
        let (a, _ra) = member(1, NO_NETWORKID);
        let (b, _rb) = member(2, NO_NETWORKID);
        let group = PeerNetworkGroup::new(vec![a, b], HashSet::new());
        group.assign(42, 0).await;

        assert_eq!(group.consensus().await, 42);
    }

    #[tokio::test]
    async fn test_assign_rewrites_member_projections() {
        let (a, mut ra) = member(1, 0);
        let (b, mut rb) = member(2, 0);
        let group = PeerNetworkGroup::new(vec![Arc::clone(&a), Arc::clone(&b)], HashSet::new());

        group.assign(1234, 2).await;

        assert_eq!(group.network_id().await, 1234);
        for peer in [&a, &b] {
            assert_eq!(peer.assigned_network_id(), 1234);
            assert_eq!(peer.network_group(), Some(2));
        }
        // members got the announcement
        for rx in [&mut ra, &mut rb] {
            match rx.recv().await.unwrap() {
                Packet::NetworkId(msg) => assert_eq!(msg.id, 1234),
                other => panic!("unexpected packet {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_recently_assigned_window() {
        let (a, _ra) = member(1, 0);
        let group = PeerNetworkGroup::new(vec![a], HashSet::new());
        assert!(!group.recently_assigned(Duration::from_secs(2)).await);

        group.assign(5, 0).await;
        assert!(group.recently_assigned(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_registry_replace_publishes_first_group() {
        let (a, _ra) = member(1, 0);
        let (b, _rb) = member(2, 0);
        let first = Arc::new(PeerNetworkGroup::new(vec![a], HashSet::new()));
        let second = Arc::new(PeerNetworkGroup::new(vec![b], HashSet::new()));
        first.assign(17, 0).await;
        second.assign(23, 1).await;

        let registry = GroupRegistry::new();
        assert_eq!(registry.our_network_id(), NO_NETWORKID);

        registry.replace(vec![Arc::clone(&first), Arc::clone(&second)]).await;
        assert_eq!(registry.our_network_id(), 17);
        assert!(first.is_our_group());
        assert!(!second.is_our_group());
        assert_eq!(registry.len().await, 2);
    }
}
