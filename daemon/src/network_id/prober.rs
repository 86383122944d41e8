//! Client role of the probe protocol: the periodic volleys measuring
//! every connected peer through every intermediary.

use std::{
    collections::HashSet,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use log::{debug, error, info};
use metrics::counter;
use veil_common::tokio::time::sleep;

use crate::config::MAX_HTL;

use super::{
    config::{
        ACCEPTED_TIMEOUT, BETWEEN_PEERS, LONG_PERIOD, MIN_PINGS_FOR_STARTUP,
        PING_VOLLEYS_PER_NETWORK_RECOMPUTE, PROBE_SPACING, SECRETPONG_TIMEOUT, STARTUP_DELAY,
    },
    error::{NetworkIdError, NetworkIdResult},
    manager::NetworkIdManager,
    packet::{SecretPing, StoreSecret},
    peer::{Peer, SecretResponse},
};

impl NetworkIdManager {
    // Drive the probe ticks for as long as the manager is running.
    // Owned by the task spawned in start().
    pub(super) async fn prober_loop(self: Arc<Self>) {
        sleep(STARTUP_DELAY).await;

        let connected = self.peer_list.quick_count_connected_peers().await;
        {
            let mut wq = self.work_queue.lock().await;
            wq.startup_checks = connected * MIN_PINGS_FOR_STARTUP;
        }
        info!(
            "Secret pinger starting, draining {} startup volleys first",
            connected * MIN_PINGS_FOR_STARTUP
        );

        while self.is_running() {
            let delay = self.probe_tick().await;
            sleep(delay).await;
        }
    }

    /// One prober tick: measure the next queued peer, maybe reckon, and
    /// report when the next tick is due.
    ///
    /// Only one tick may ever be processing; a re-entrant tick is a
    /// programming error and gets skipped.
    pub(super) async fn probe_tick(self: &Arc<Self>) -> Duration {
        let target_id = {
            let mut wq = self.work_queue.lock().await;
            if wq.processing.is_some() {
                error!("Probe tick fired while a volley is still processing, this is a bug");
                return BETWEEN_PEERS;
            }
            if let Some(id) = wq.queue.pop_front() {
                wq.processing = Some(id);
                Some(id)
            } else {
                None
            }
        };

        if let Some(target_id) = target_id {
            // a queued peer that disconnected in the meantime is skipped
            let target = self
                .peer_list
                .get_peer(target_id)
                .await
                .filter(|p| p.is_connected());
            if let Some(target) = target {
                self.probe_volley(&target).await;
            }

            let reckon = {
                let mut wq = self.work_queue.lock().await;
                wq.processing = None;
                wq.startup_checks = wq.startup_checks.saturating_sub(1);
                wq.ping_volleys_to_go = wq.ping_volleys_to_go.saturating_sub(1);
                if wq.ping_volleys_to_go == 0 {
                    wq.ping_volleys_to_go = PING_VOLLEYS_PER_NETWORK_RECOMPUTE;
                    wq.startup_checks == 0
                } else {
                    false
                }
            };
            if reckon {
                self.reckon().await;
            }
        }

        let connected = self.peer_list.connected_peers().await;
        let mut wq = self.work_queue.lock().await;
        if wq.queue.is_empty() {
            for peer in &connected {
                let id = peer.get_id();
                if !wq.queue.contains(&id) {
                    wq.queue.push_back(id);
                }
            }
            if wq.startup_checks == 0 {
                LONG_PERIOD
            } else {
                BETWEEN_PEERS
            }
        } else {
            BETWEEN_PEERS
        }
    }

    // One volley: probe `target` through every connected peer, walking
    // them in routing order around a random point of the circle
    pub(super) async fn probe_volley(self: &Arc<Self>, target: &Arc<Peer>) {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Starting probe volley against {}", target);
        }
        self.matrix.begin_probe(target.get_id()).await;

        let probe_location: f64 = rand::random();
        let mut excluded = HashSet::new();
        loop {
            if !target.is_connected() || self.matrix.race_flagged().await {
                break;
            }
            let Some(next) = self
                .peer_list
                .closer_peer(None, &excluded, probe_location)
                .await
            else {
                break;
            };
            excluded.insert(next.get_id());
            self.blocking_update_ping_record(target, &next).await;
            // stay polite between probes
            sleep(PROBE_SPACING).await;
        }

        if self.matrix.end_probe().await {
            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "Volley against {} raced with a disconnect, discarding its samples",
                    target
                );
            }
            self.matrix.forget(target.get_id()).await;
        }
    }

    /// One probe: lodge a fresh secret at `target`, fire a secret ping
    /// through `next`, and record the outcome as exactly one sample.
    pub(super) async fn blocking_update_ping_record(&self, target: &Arc<Peer>, next: &Arc<Peer>) {
        let uid: u64 = rand::random();
        let secret: u64 = rand::random();

        let (htl, dawn_htl) = self
            .matrix
            .with_record(target.get_id(), next.get_id(), |record| {
                let htl = record.next_htl(MAX_HTL);
                (htl, record.next_dawn_htl(htl))
            })
            .await;

        self.total_secret_ping_attempts
            .fetch_add(1, Ordering::SeqCst);
        counter!("veil_p2p_secret_ping_attempts").increment(1u64);

        match self.run_probe(target, next, uid, secret, htl, dawn_htl).await {
            Ok(counter_value) => {
                self.secret_ping_successes.fetch_add(1, Ordering::SeqCst);
                counter!("veil_p2p_secret_ping_successes").increment(1u64);
                self.matrix
                    .with_record(target.get_id(), next.get_id(), |record| {
                        record.success(counter_value, htl, dawn_htl)
                    })
                    .await;
            }
            Err(e) => {
                match &e {
                    // rejection is a normal outcome, a timeout is not
                    NetworkIdError::ProbeRejected(_) => {
                        if log::log_enabled!(log::Level::Debug) {
                            debug!("Probe of {} via {} rejected", target, next);
                        }
                    }
                    NetworkIdError::AsyncTimeOut(_) => {
                        error!("Probe of {} via {} timed out", target, next);
                    }
                    _ => {
                        if log::log_enabled!(log::Level::Debug) {
                            debug!("Probe of {} via {} failed: {}", target, next, e);
                        }
                    }
                }
                self.matrix
                    .with_record(target.get_id(), next.get_id(), |record| {
                        record.failure(0, htl, dawn_htl)
                    })
                    .await;
            }
        }
    }

    // StoreSecret -> Accepted -> SecretPing -> SecretPong, synchronous.
    // Success means the pong carried our secret back; the hop counter is
    // returned for the shortest-path statistic.
    async fn run_probe(
        &self,
        target: &Arc<Peer>,
        next: &Arc<Peer>,
        uid: u64,
        secret: u64,
        htl: i16,
        dawn_htl: i16,
    ) -> NetworkIdResult<i32> {
        target
            .request_store_secret(StoreSecret::new(uid, secret), ACCEPTED_TIMEOUT)
            .await?;

        let ping = SecretPing::new(uid, target.get_location(), htl, dawn_htl, 0);
        match next.request_secret_ping(ping, SECRETPONG_TIMEOUT).await? {
            SecretResponse::Pong(pong) => {
                if pong.secret != secret {
                    return Err(NetworkIdError::SecretMismatch(uid));
                }
                Ok(pong.counter)
            }
            SecretResponse::Rejected(_) => Err(NetworkIdError::ProbeRejected(uid)),
        }
    }
}
