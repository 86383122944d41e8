//! Per-(target, via) probe statistics and the adaptive HTL policy.

use std::fmt::{self, Display, Formatter};

use veil_common::time::{get_current_time_in_millis, TimestampMillis};
use veil_common::utils::RunningAverage;

use super::config::{COMFORT_LEVEL, MIN_HTL, RUNNING_AVERAGE_HORIZON};
use super::peer::PeerId;

/// Decaying statistics for probing one target through one intermediary.
///
/// The direction matters: reaching `target` through `via` says nothing
/// about reaching `via` through `target`.
pub struct PingRecord {
    target: PeerId,
    via: PeerId,
    last_try: TimestampMillis,
    last_success: TimestampMillis,
    // fewest hops any successful probe ever took
    shortest_success: i32,
    // success ratio of all probes, in [0, 1]
    average: RunningAverage,
    // htl values that came back successful / failed
    s_htl: RunningAverage,
    f_htl: RunningAverage,
    // random-hop counts (htl - dawn) that succeeded / failed
    s_dawn: RunningAverage,
    f_dawn: RunningAverage,
}

impl PingRecord {
    pub fn new(target: PeerId, via: PeerId) -> Self {
        let htl_range = i16::MAX as f64;
        Self {
            target,
            via,
            last_try: 0,
            last_success: 0,
            shortest_success: i32::MAX,
            average: RunningAverage::new(0.0, 0.0, 1.0, RUNNING_AVERAGE_HORIZON),
            s_htl: RunningAverage::new(0.0, 0.0, htl_range, RUNNING_AVERAGE_HORIZON),
            f_htl: RunningAverage::new(0.0, 0.0, htl_range, RUNNING_AVERAGE_HORIZON),
            s_dawn: RunningAverage::new(0.0, 0.0, htl_range, RUNNING_AVERAGE_HORIZON),
            f_dawn: RunningAverage::new(0.0, 0.0, htl_range, RUNNING_AVERAGE_HORIZON),
        }
    }

    pub fn target(&self) -> PeerId {
        self.target
    }

    pub fn via(&self) -> PeerId {
        self.via
    }

    // The probe came back with the right secret after `counter` hops
    pub fn success(&mut self, counter: i32, htl: i16, dawn: i16) {
        self.last_try = get_current_time_in_millis();
        self.last_success = self.last_try;
        if counter < self.shortest_success {
            self.shortest_success = counter;
        }
        self.average.report(1.0);
        self.s_htl.report(htl as f64);
        self.s_dawn.report((htl - dawn) as f64);
    }

    // Timeout, disconnection or rejection; the hop count is unknown
    pub fn failure(&mut self, _counter: i32, htl: i16, dawn: i16) {
        self.last_try = get_current_time_in_millis();
        self.average.report(0.0);
        self.f_htl.report(htl as f64);
        self.f_dawn.report((htl - dawn) as f64);
    }

    pub fn average(&self) -> f64 {
        self.average.value()
    }

    pub fn last_try(&self) -> TimestampMillis {
        self.last_try
    }

    pub fn last_success(&self) -> TimestampMillis {
        self.last_success
    }

    pub fn shortest_success(&self) -> Option<i32> {
        if self.shortest_success == i32::MAX {
            None
        } else {
            Some(self.shortest_success)
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.average.count()
    }

    /// Budget for the next probe.
    ///
    /// Until enough successes accumulated we probe at the ceiling; after
    /// that, good connectivity pushes the budget down, bad connectivity
    /// pushes it back up.
    pub fn next_htl(&self, max_htl: i16) -> i16 {
        if self.s_htl.count() < COMFORT_LEVEL {
            return max_htl;
        }
        let value = if self.average.value() > 0.8 {
            self.s_htl.value() - 0.5
        } else {
            self.s_htl.value() + 0.5
        };
        (value.round() as i16).clamp(MIN_HTL, max_htl)
    }

    /// Dawn for the next probe: the HTL value at which deterministic
    /// routing takes over.
    ///
    /// The random prefix widens as failures accumulate, but at least
    /// half of the hops always stay deterministic.
    pub fn next_dawn_htl(&self, htl: i16) -> i16 {
        let diff = if self.f_dawn.count() < COMFORT_LEVEL {
            2
        } else if self.s_dawn.count() < COMFORT_LEVEL {
            self.f_dawn.value().round() as i16
        } else {
            (0.25 * self.f_dawn.value() + 0.75 * self.s_dawn.value()).round() as i16
        };
        let cap = (htl / 2 - 1).max(0);
        htl - diff.clamp(0, cap)
    }
}

impl Display for PingRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PingRecord[{} via {}, average: {}, shortest: {:?}]",
            self.target,
            self.via,
            self.average,
            self.shortest_success()
        )
    }
}
