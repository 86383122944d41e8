//! Server role of the probe protocol: storing secrets and answering or
//! forwarding secret pings.

use std::{collections::HashSet, sync::Arc};

use log::{debug, error, trace};

use super::{
    config::SECRETPONG_TIMEOUT,
    error::NetworkIdError,
    manager::NetworkIdManager,
    packet::{Accepted, Packet, RejectedLoop, SecretPing, SecretPong, StoreSecret},
    peer::{Peer, PeerId, SecretResponse},
};

impl NetworkIdManager {
    // A neighbour lodges a secret with us. Never forwarded; the ack is
    // best-effort.
    pub(super) async fn handle_store_secret(&self, source: &Arc<Peer>, msg: StoreSecret) {
        if log::log_enabled!(log::Level::Trace) {
            trace!("Storing secret {:#018x} from {}", msg.uid, source);
        }
        self.secrets.put(source.get_id(), msg.uid, msg.secret).await;
        if let Err(e) = source
            .send_packet(Packet::Accepted(Accepted::new(msg.uid)))
            .await
        {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Could not ack secret {:#018x} from {}: {}", msg.uid, source, e);
            }
        }
    }

    // A secret ping arrived: answer it if the secret is ours, otherwise
    // forward it along the routing circle. Duplicate uids are rejected as
    // loops through the shared recently-completed set.
    pub(super) async fn handle_secret_ping(&self, source: &Arc<Peer>, msg: SecretPing) {
        let uid = msg.uid;

        if !self.config.secret_pings_enabled() || self.recently_completed(uid).await {
            if log::log_enabled!(log::Level::Trace) {
                trace!("Rejecting probe {:#018x}: disabled or recently completed", uid);
            }
            self.reply_rejected(source, uid).await;
            return;
        }

        if let Some(stored) = self.secrets.by_uid(uid).await {
            // The ping reached the peer the secret was lodged at. Not
            // marked completed: we may reject it from one peer for a
            // short path and still accept it from another.
            if msg.htl <= msg.dawn_htl {
                // the random prefix was already spent, path too short
                if log::log_enabled!(log::Level::Debug) {
                    debug!(
                        "Probe {:#018x} landed with htl {} <= dawn {}, rejecting",
                        uid, msg.htl, msg.dawn_htl
                    );
                }
                self.reply_rejected(source, uid).await;
            } else {
                let pong = SecretPong::new(uid, msg.counter + 1, stored.secret);
                if let Err(e) = source.send_packet(Packet::SecretPong(pong)).await {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Could not pong probe {:#018x} to {}: {}", uid, source, e);
                    }
                }
            }
            return;
        }

        // Not ours; remember the uid before forwarding so the ping
        // bounces as a loop if it ever comes back around
        self.mark_completed(uid).await;
        self.forward_secret_ping(source, msg).await;
    }

    // Walk candidate intermediaries until one of them produces a
    // terminal answer. Exactly one reply goes upstream, except on
    // timeout (the source has long given up) and on source loss.
    async fn forward_secret_ping(&self, source: &Arc<Peer>, msg: SecretPing) {
        let uid = msg.uid;
        let mut routed_to: HashSet<PeerId> = HashSet::new();
        let mut htl = msg.htl;

        loop {
            // the first hop of a ping still carrying its random prefix is
            // a uniformly random neighbour; after that, greedy routing
            let next = if htl > msg.dawn_htl && routed_to.is_empty() {
                self.peer_list.get_random_peer(Some(source.get_id())).await
            } else {
                self.peer_list
                    .closer_peer(Some(source.get_id()), &routed_to, msg.target)
                    .await
            };

            let Some(next) = next else {
                if log::log_enabled!(log::Level::Trace) {
                    trace!("No route left for probe {:#018x}", uid);
                }
                self.reply_rejected(source, uid).await;
                return;
            };

            htl = next.decrement_htl(htl);
            if htl <= 0 {
                self.reply_rejected(source, uid).await;
                return;
            }

            if !source.is_connected() {
                // nobody left to answer, drop the chain silently
                if log::log_enabled!(log::Level::Trace) {
                    trace!("Source {} gone while forwarding probe {:#018x}", source, uid);
                }
                return;
            }

            routed_to.insert(next.get_id());
            let forward = SecretPing::new(uid, msg.target, htl, msg.dawn_htl, msg.counter + 1);
            match next.request_secret_ping(forward, SECRETPONG_TIMEOUT).await {
                Ok(SecretResponse::Pong(pong)) => {
                    let relayed =
                        SecretPong::new(uid, msg.counter.max(pong.counter), pong.secret);
                    if let Err(e) = source.send_packet(Packet::SecretPong(relayed)).await {
                        if log::log_enabled!(log::Level::Debug) {
                            debug!("Could not relay pong {:#018x} to {}: {}", uid, source, e);
                        }
                    }
                    return;
                }
                Ok(SecretResponse::Rejected(_)) => {
                    // normal outcome, try the next candidate
                    continue;
                }
                Err(NetworkIdError::AsyncTimeOut(_)) => {
                    error!("Timed out waiting on {} for probe {:#018x}", next, uid);
                    return;
                }
                Err(e) => {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Forwarding probe {:#018x} via {} failed: {}", uid, next, e);
                    }
                    continue;
                }
            }
        }
    }

    async fn reply_rejected(&self, source: &Arc<Peer>, uid: u64) {
        if let Err(e) = source
            .send_packet(Packet::RejectedLoop(RejectedLoop::new(uid)))
            .await
        {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Could not reject probe {:#018x} from {}: {}", uid, source, e);
            }
        }
    }
}
