//! Two-level map of ping records: target peer -> intermediary -> record.

use indexmap::IndexMap;
use veil_common::tokio::sync::Mutex;

use super::peer::PeerId;
use super::ping_record::PingRecord;

/// Plain snapshot of every ping average, for the reckoner to chew on
/// without holding the matrix lock.
pub type AverageSnapshot = IndexMap<PeerId, IndexMap<PeerId, f64>>;

struct MatrixInner {
    // rows are targets, columns are intermediaries
    rows: IndexMap<PeerId, IndexMap<PeerId, PingRecord>>,
    // target of the volley currently in flight, if any
    probing: Option<PeerId>,
    // set when a forget raced with the volley in flight
    race: bool,
}

/// The directional sample matrix.
///
/// `forget` on the peer currently being probed does not mutate anything:
/// it flags a race instead, and the prober discards the volley's samples
/// once it notices.
pub struct SampleMatrix {
    inner: Mutex<MatrixInner>,
}

impl SampleMatrix {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MatrixInner {
                rows: IndexMap::new(),
                probing: None,
                race: false,
            }),
        }
    }

    /// Run `f` against the record for `(target, via)`, creating it on
    /// first use.
    pub async fn with_record<F, R>(&self, target: PeerId, via: PeerId, f: F) -> R
    where
        F: FnOnce(&mut PingRecord) -> R,
    {
        let mut inner = self.inner.lock().await;
        let record = inner
            .rows
            .entry(target)
            .or_default()
            .entry(via)
            .or_insert_with(|| PingRecord::new(target, via));
        f(record)
    }

    /// Success ratio for reaching `target` through `via`; zero when the
    /// pair was never measured. Reading does not create a record.
    pub async fn average(&self, target: PeerId, via: PeerId) -> f64 {
        let inner = self.inner.lock().await;
        inner
            .rows
            .get(&target)
            .and_then(|row| row.get(&via))
            .map(|record| record.average())
            .unwrap_or(0.0)
    }

    /// Clone out every average at once.
    pub async fn averages(&self) -> AverageSnapshot {
        let inner = self.inner.lock().await;
        inner
            .rows
            .iter()
            .map(|(&target, row)| {
                let averages = row
                    .iter()
                    .map(|(&via, record)| (via, record.average()))
                    .collect();
                (target, averages)
            })
            .collect()
    }

    /// Drop `peer` both as a target and as an intermediary.
    ///
    /// If `peer` is the target of the volley in flight, the matrix is
    /// left untouched and the race flag is raised instead.
    pub async fn forget(&self, peer: PeerId) {
        let mut inner = self.inner.lock().await;
        if inner.probing == Some(peer) {
            inner.race = true;
            return;
        }
        inner.rows.shift_remove(&peer);
        for row in inner.rows.values_mut() {
            row.shift_remove(&peer);
        }
    }

    // Mark the start of a probe volley against `target`
    pub async fn begin_probe(&self, target: PeerId) {
        let mut inner = self.inner.lock().await;
        inner.probing = Some(target);
        inner.race = false;
    }

    pub async fn race_flagged(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.race
    }

    // Mark the end of the volley; returns whether a forget raced with it
    pub async fn end_probe(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.probing = None;
        let race = inner.race;
        inner.race = false;
        race
    }

    // Sample count for a pair, mostly for tests and diagnostics
    pub async fn sample_count(&self, target: PeerId, via: PeerId) -> u64 {
        let inner = self.inner.lock().await;
        inner
            .rows
            .get(&target)
            .and_then(|row| row.get(&via))
            .map(|record| record.sample_count())
            .unwrap_or(0)
    }

    pub async fn row_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.rows.len()
    }
}

impl Default for SampleMatrix {
    fn default() -> Self {
        Self::new()
    }
}
