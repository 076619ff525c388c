//! Port-mapping helpers: ask the local gateway to forward a TCP port.
//!
//! Each helper is tried in turn by the Supervisor's `start()` sequence
//! (UPnP, then NAT-PMP); the first one that succeeds *and* whose mapping
//! is confirmed by an external reachability probe wins.

mod natpmp;
mod upnp;

pub use natpmp::forward as forward_natpmp;
pub use upnp::forward as forward_upnp;

use std::net::SocketAddr;

use crate::error::Result;
use crate::traits::PublicIpProbe;

/// Which mechanism produced a forwarded port, mirroring the UNL wire
/// forwarding-type codes ('f', 'm', 'U', 'N').
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingMethod {
    /// Already reachable without any mapping (`'f'`).
    AlreadyForwarded,
    /// Operator configured a manual static mapping (`'m'`).
    Manual,
    /// UPnP IGD `AddPortMapping` (`'U'`).
    Upnp,
    /// NAT-PMP mapping request (`'N'`).
    NatPmp,
}

/// A port mapping installed on the gateway, plus the external address a
/// peer would dial to reach it.
#[derive(Debug, Clone, Copy)]
pub struct ForwardedPort {
    pub external_addr: SocketAddr,
    pub method: ForwardingMethod,
}

/// Try UPnP, then NAT-PMP, returning the first mapping confirmed forwarded
/// by `probe`. Neither error is fatal on its own; only exhausting both
/// methods is.
pub async fn try_forward_any(
    internal_addr: SocketAddr,
    external_port: u16,
    description: &str,
    probe: &impl PublicIpProbe,
) -> Result<ForwardedPort> {
    match upnp::forward(internal_addr, external_port, description).await {
        Ok(mapped) => {
            if probe.is_port_forwarded(mapped.external_addr.port(), "TCP").await.unwrap_or(false) {
                return Ok(mapped);
            }
            tracing::warn!("UPnP mapping installed but probe could not confirm forwarding");
        }
        Err(e) => tracing::debug!(error = %e, "UPnP forwarding unavailable"),
    }

    match natpmp::forward(internal_addr, external_port).await {
        Ok(mapped) => {
            if probe.is_port_forwarded(mapped.external_addr.port(), "TCP").await.unwrap_or(false) {
                return Ok(mapped);
            }
            tracing::warn!("NAT-PMP mapping installed but probe could not confirm forwarding");
        }
        Err(e) => tracing::debug!(error = %e, "NAT-PMP forwarding unavailable"),
    }

    Err(crate::error::NetError::PortMapping(
        "no port-mapping method succeeded and was confirmed forwarded".to_string(),
    ))
}
