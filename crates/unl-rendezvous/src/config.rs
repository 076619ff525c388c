//! Rendezvous server configuration

use serde::{Deserialize, Serialize};

/// Rendezvous server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// Server bind address
    pub bind_addr: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// How long a passive/simultaneous registration remains eligible for
    /// `NODES`/candidate propagation before the cleanup sweep drops it.
    #[serde(default = "default_node_lifetime_secs")]
    pub node_lifetime_secs: u64,
    /// How long a registration may go un-refreshed before a new `CANDIDATE`
    /// against it triggers a `RECONNECT` rather than being trusted as-is.
    #[serde(default = "default_challenge_timeout_secs")]
    pub challenge_timeout_secs: u64,
    /// Maximum number of simultaneous-open candidates tracked per target IP.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// How far apart cleanup sweeps run.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Tolerance, in seconds, for the `ntp_time` field of an `ACCEPT`
    /// command relative to server wall-clock.
    #[serde(default = "default_ntp_tolerance_secs")]
    pub ntp_tolerance_secs: f64,
}

fn default_node_lifetime_secs() -> u64 {
    24 * 60 * 60
}

fn default_challenge_timeout_secs() -> u64 {
    120
}

fn default_max_candidates() -> usize {
    100
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

fn default_ntp_tolerance_secs() -> f64 {
    600.0
}

impl RendezvousConfig {
    const MIN_CLEANUP_INTERVAL_SECS: u64 = 10;

    /// Validate and clamp configuration values
    pub fn validate(&mut self) {
        if self.cleanup_interval_secs < Self::MIN_CLEANUP_INTERVAL_SECS {
            tracing::warn!(
                configured = self.cleanup_interval_secs,
                clamped = Self::MIN_CLEANUP_INTERVAL_SECS,
                "cleanup_interval_secs too low, clamping"
            );
            self.cleanup_interval_secs = Self::MIN_CLEANUP_INTERVAL_SECS;
        }
        if self.max_candidates == 0 {
            tracing::warn!("max_candidates was 0, forcing to 1");
            self.max_candidates = 1;
        }
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            tracing::warn!(addr = %self.bind_addr, "invalid bind_addr, falling back to default");
            self.bind_addr = Self::default().bind_addr;
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:46882".to_string(),
            max_connections: 10000,
            node_lifetime_secs: default_node_lifetime_secs(),
            challenge_timeout_secs: default_challenge_timeout_secs(),
            max_candidates: default_max_candidates(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            ntp_tolerance_secs: default_ntp_tolerance_secs(),
        }
    }
}
