//! Supervisor configuration: the "Network supervisor options" table.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::nat::NatKind;
use crate::unl::NodeType;

/// Whether connections are expected to be brokered through a DHT-style
/// overlay (`p2p`) or dialed directly by address (`direct`). Only affects
/// which connection-id scheme callers rely on; both paths use the same
/// Supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetType {
    P2p,
    Direct,
}

/// At most one `BOOTSTRAP` per this interval.
pub const RENDEZVOUS_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// At most one `PASSIVE READY` / `SIMULTANEOUS READY` per this interval.
pub const ADVERTISE_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
/// Skip advertising once inbound connections reach this count.
pub const MIN_CONNECTED: usize = 3;
/// Out-of-band relay is drained at most this often.
pub const DHT_MSG_INTERVAL: Duration = Duration::from_secs(5);
/// `CHALLENGE` dispatch is rate-limited to this interval.
pub const SIM_OPEN_INTERVAL: Duration = Duration::from_secs(2);
/// A direct-net handshake pump reads at most this many bytes per pass.
pub const HANDSHAKE_PUMP_BYTES: usize = 64;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub net_type: NetType,
    pub node_type: Option<NodeType>,
    pub nat_type: Option<NatKind>,
    pub passive_bind: Ipv4Addr,
    pub passive_port: u16,
    pub max_outbound: usize,
    pub max_inbound: usize,
    /// Fallback LAN address used when no interface-enumeration facility is
    /// available in this deployment; override with the real interface
    /// address where one can be determined.
    pub lan_ip: Ipv4Addr,
    pub wan_ip: Option<Ipv4Addr>,
    pub enable_bootstrap: bool,
    pub enable_advertise: bool,
    pub enable_forwarding: bool,
    pub enable_simultaneous: bool,
    pub enable_duplicates: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            net_type: NetType::P2p,
            node_type: None,
            nat_type: None,
            passive_bind: Ipv4Addr::UNSPECIFIED,
            passive_port: 0,
            max_outbound: 8,
            max_inbound: 8,
            lan_ip: Ipv4Addr::LOCALHOST,
            wan_ip: None,
            enable_bootstrap: true,
            enable_advertise: true,
            enable_forwarding: true,
            enable_simultaneous: true,
            enable_duplicates: false,
        }
    }
}
