//! Tunables and runtime configuration for the network-id manager.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// Grace period after startup before the first probe volley
pub const STARTUP_DELAY: Duration = Duration::from_secs(20);

// Delay between two probe ticks while the queue is non-empty.
// Doubles as the anti-thrash window for group reassignments.
pub const BETWEEN_PEERS: Duration = Duration::from_secs(2);

// Steady-state delay once every connected peer has been measured
pub const LONG_PERIOD: Duration = Duration::from_secs(120);

// Politeness sleep between two probes of the same volley
pub const PROBE_SPACING: Duration = Duration::from_millis(200);

// How long to wait for a StoreSecret to be acknowledged
pub const ACCEPTED_TIMEOUT: Duration = Duration::from_secs(5);

// How long to wait for a SecretPong (or a rejection) per hop
pub const SECRETPONG_TIMEOUT: Duration = Duration::from_secs(20);

// Probes never go out with less budget than this
pub const MIN_HTL: i16 = 3;

// Volleys per connected peer before reckoning is allowed to start
pub const MIN_PINGS_FOR_STARTUP: usize = 3;

// Samples needed before an average is trusted over the defaults
pub const COMFORT_LEVEL: u64 = 20;

// Volleys between two network reckonings
pub const PING_VOLLEYS_PER_NETWORK_RECOMPUTE: u32 = 5;

// Fraction of the seed goodness a peer must reach to join its cluster
pub const MAGIC_LINEAR_GRACE: f64 = 0.8;

// Below this setwise goodness the clustering falls open and lumps
// every remaining peer into one group
pub const FALL_OPEN_MARK: f64 = 0.2;

// Minimum mutual reachability for the final two-peer merge
pub const DREGS_MERGE_MARK: f64 = 0.25;

// Sentinel for "no network id assigned yet"
pub const NO_NETWORKID: i32 = 0;

// Decay horizon of every ping statistic
pub const RUNNING_AVERAGE_HORIZON: u64 = 200;

// Recently-completed probe uids kept for loop rejection
pub const COMPLETED_UIDS_CACHE_SIZE: usize = 1024;

// Outbound packet queue per peer
pub const PEER_PACKET_CHANNEL_SIZE: usize = 256;

const fn default_disabled() -> bool {
    true
}

/// Configuration for the network-id manager.
///
/// Both roles default to disabled: measuring the network costs traffic,
/// so the operator has to opt in.
#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct NetworkIdConfig {
    /// Disable answering and forwarding secret pings.
    ///
    /// When disabled, every inbound secret ping is rejected as a loop.
    #[clap(name = "disable-secret-pings", long, default_value_t = default_disabled(), action = clap::ArgAction::Set)]
    #[serde(default = "default_disabled")]
    pub disable_secret_pings: bool,

    /// Disable the periodic secret pinger.
    ///
    /// When disabled, no probe volleys are scheduled and the node never
    /// recomputes its network groups on its own.
    #[clap(name = "disable-secret-pinger", long, default_value_t = default_disabled(), action = clap::ArgAction::Set)]
    #[serde(default = "default_disabled")]
    pub disable_secret_pinger: bool,
}

impl Default for NetworkIdConfig {
    fn default() -> Self {
        Self {
            disable_secret_pings: true,
            disable_secret_pinger: true,
        }
    }
}

impl NetworkIdConfig {
    // Convenience for tests and embedders that want the subsystem live
    pub fn enabled() -> Self {
        Self {
            disable_secret_pings: false,
            disable_secret_pinger: false,
        }
    }

    pub fn secret_pings_enabled(&self) -> bool {
        !self.disable_secret_pings
    }

    pub fn secret_pinger_enabled(&self) -> bool {
        !self.disable_secret_pinger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_off() {
        let config = NetworkIdConfig::default();

        assert!(config.disable_secret_pings);
        assert!(config.disable_secret_pinger);
        assert!(!config.secret_pings_enabled());
        assert!(!config.secret_pinger_enabled());
    }

    #[test]
    fn test_enabled_config() {
        let config = NetworkIdConfig::enabled();

        assert!(config.secret_pings_enabled());
        assert!(config.secret_pinger_enabled());
    }

    #[test]
    fn test_dawn_cap_leaves_room_for_routing() {
        // at the minimum budget there is no room for a random prefix at all
        assert_eq!(MIN_HTL / 2 - 1, 0);
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = NetworkIdConfig::enabled();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: NetworkIdConfig = serde_json::from_str(&json).unwrap();
        assert!(decoded.secret_pings_enabled());
        assert!(decoded.secret_pinger_enabled());

        // absent fields fall back to the off-by-default flags
        let decoded: NetworkIdConfig = serde_json::from_str("{}").unwrap();
        assert!(!decoded.secret_pings_enabled());
        assert!(!decoded.secret_pinger_enabled());
    }
}
