//! Turning the sample matrix into labelled network groups, and the
//! reactive path that re-labels groups when peers announce their own id.

use std::{
    collections::HashSet,
    sync::{atomic::Ordering, Arc},
};

use log::{debug, info, trace};
use metrics::counter;

use super::{
    config::{
        BETWEEN_PEERS, DREGS_MERGE_MARK, FALL_OPEN_MARK, MAGIC_LINEAR_GRACE, NO_NETWORKID,
    },
    group::PeerNetworkGroup,
    manager::NetworkIdManager,
    matrix::AverageSnapshot,
    peer::{Peer, PeerId},
};

// How well `target` is reachable through `via`, per the snapshot
fn ping_avg(snapshot: &AverageSnapshot, target: PeerId, via: PeerId) -> f64 {
    snapshot
        .get(&target)
        .and_then(|row| row.get(&via))
        .copied()
        .unwrap_or(0.0)
}

// Product of reachabilities of `peer` through everyone in `all`, floored
// at 1/|all| so a single unmeasured pair does not annihilate the score
fn connectedness(snapshot: &AverageSnapshot, peer: PeerId, all: &[Arc<Peer>]) -> f64 {
    let floor = 1.0 / all.len() as f64;
    all.iter()
        .map(|q| ping_avg(snapshot, peer, q.get_id()).max(floor))
        .product()
}

// Mean reachability of `peer` through a reference set
fn setwise_average(snapshot: &AverageSnapshot, peer: PeerId, others: &[PeerId]) -> f64 {
    if others.is_empty() {
        return 0.0;
    }
    let total: f64 = others
        .iter()
        .map(|&via| ping_avg(snapshot, peer, via))
        .sum();
    total / others.len() as f64
}

// Pull the peers clustering around `seed` out of `todo`. The seed itself
// is not part of the returned set; the caller appends it.
fn extract_cluster(
    snapshot: &AverageSnapshot,
    seed: &Arc<Peer>,
    todo: &mut Vec<Arc<Peer>>,
) -> Vec<Arc<Peer>> {
    let others: Vec<PeerId> = todo.iter().map(|p| p.get_id()).collect();
    let goodness = setwise_average(snapshot, seed.get_id(), &others);
    if goodness < FALL_OPEN_MARK {
        // fall open: nothing is measurably close, everyone coalesces
        return std::mem::take(todo);
    }

    let threshold = goodness * MAGIC_LINEAR_GRACE;
    let mut cluster: Vec<Arc<Peer>> = Vec::new();
    while !todo.is_empty() {
        let mut reference: Vec<PeerId> = vec![seed.get_id()];
        reference.extend(cluster.iter().map(|p| p.get_id()));

        let mut best_index = 0;
        let mut best_score = f64::MIN;
        for (index, candidate) in todo.iter().enumerate() {
            let score = setwise_average(snapshot, candidate.get_id(), &reference);
            if score > best_score {
                best_score = score;
                best_index = index;
            }
        }
        if best_score < threshold {
            break;
        }
        cluster.push(todo.remove(best_index));
    }

    // combine the dregs: do not leave a lone peer out of a pair that is
    // still mutually reachable
    if cluster.is_empty() && todo.len() == 1 {
        let leftover = todo[0].get_id();
        let mutual = (ping_avg(snapshot, leftover, seed.get_id())
            + ping_avg(snapshot, seed.get_id(), leftover))
            / 2.0;
        if mutual > DREGS_MERGE_MARK {
            cluster.push(todo.remove(0));
        }
    }

    cluster
}

// A random non-zero id avoiding everything already taken
fn fresh_network_id(taken: &HashSet<i32>) -> i32 {
    loop {
        let id: i32 = rand::random();
        if id != NO_NETWORKID && !taken.contains(&id) {
            return id;
        }
    }
}

impl NetworkIdManager {
    /// Recompute the network groups from the current sample matrix and
    /// install them. Serialised with the reactive path; a reckoning that
    /// finds nothing to do leaves the previous registry in force.
    pub async fn reckon(self: &Arc<Self>) {
        let _guard = self.dont_start_please.lock().await;
        self.in_transition.store(true, Ordering::SeqCst);
        self.reckon_inner().await;
        self.in_transition.store(false, Ordering::SeqCst);
    }

    async fn reckon_inner(self: &Arc<Self>) {
        counter!("veil_p2p_network_reckons").increment(1u64);

        let all = self.peer_list.connected_peers().await;
        if all.is_empty() {
            debug!("No connected peers, keeping the previous network groups");
            return;
        }
        let snapshot = self.matrix.averages().await;

        let mut todo = all.clone();
        let mut taken: HashSet<i32> = HashSet::new();
        let mut groups: Vec<Arc<PeerNetworkGroup>> = Vec::new();

        while !todo.is_empty() {
            // the most-connected remaining peer seeds the next cluster
            let mut seed_index = 0;
            let mut seed_score = f64::MIN;
            for (index, peer) in todo.iter().enumerate() {
                let score = connectedness(&snapshot, peer.get_id(), &all);
                if score > seed_score {
                    seed_score = score;
                    seed_index = index;
                }
            }
            let seed = todo.remove(seed_index);

            let mut members = if todo.is_empty() {
                Vec::new()
            } else {
                extract_cluster(&snapshot, &seed, &mut todo)
            };
            members.push(seed);

            let group = Arc::new(PeerNetworkGroup::new(members, taken.clone()));
            let mut id = group.consensus().await;
            if id == NO_NETWORKID {
                id = fresh_network_id(&taken);
            }
            group.assign(id, groups.len()).await;
            taken.insert(id);
            groups.push(group);
        }

        info!(
            "Network reckoning produced {} group(s) from {} peer(s)",
            groups.len(),
            all.len()
        );
        self.registry.replace(groups).await;
    }

    /// Reactive path: a peer announced the network id it believes in.
    ///
    /// The reporting peer's group may adopt the new consensus (unless it
    /// is our own group, or was reassigned moments ago); every group of
    /// lower priority then gets its forbidden set refreshed and is fixed
    /// up if its id collides.
    pub async fn on_peer_announced_network_id(self: &Arc<Self>, peer: &Arc<Peer>, id: i32) {
        if log::log_enabled!(log::Level::Trace) {
            trace!("{} announced network id {}", peer, id);
        }
        peer.set_provided_network_id(id);

        if self.in_transition.load(Ordering::SeqCst) {
            // a reckoning is replacing everything anyway
            return;
        }
        let _guard = self.dont_start_please.lock().await;

        let groups = self.registry.groups().await;
        let mut now_taken: HashSet<i32> = HashSet::new();
        let mut seen_reporting = false;

        for (slot, group) in groups.iter().enumerate() {
            if !seen_reporting && group.contains(peer.get_id()) {
                seen_reporting = true;
                if !group.is_our_group() {
                    let consensus = group.consensus().await;
                    if consensus == group.network_id().await {
                        return;
                    }
                    if group.recently_assigned(BETWEEN_PEERS).await {
                        debug!("Group {} was assigned moments ago, not reassigning", slot);
                        return;
                    }
                    group.assign(consensus, slot).await;
                }
                // our own group keeps its id: stability beats consensus
            } else if seen_reporting {
                group.set_forbidden(now_taken.clone()).await;
                if now_taken.contains(&group.network_id().await) {
                    let mut fresh = group.consensus().await;
                    if fresh == NO_NETWORKID || now_taken.contains(&fresh) {
                        fresh = fresh_network_id(&now_taken);
                    }
                    group.assign(fresh, slot).await;
                }
            }
            now_taken.insert(group.network_id().await);
        }
    }
}
