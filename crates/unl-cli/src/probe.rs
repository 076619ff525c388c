//! Default `PublicIpProbe`: this crate ships no reachability/WAN-IP probe
//! service of its own (`unl_net::traits::PublicIpProbe`'s own docs say
//! callers supply one appropriate to their deployment, e.g. an HTTP client
//! against a probe service). Until such a service is configured, every
//! mapping is conservatively treated as unconfirmed rather than guessed.

use unl_net::error::{NetError, Result};
use unl_net::traits::PublicIpProbe;

pub struct NullProbe;

impl PublicIpProbe for NullProbe {
    async fn get_wan_ip(&self) -> Result<std::net::Ipv4Addr> {
        Err(NetError::Configuration(
            "no WAN-IP probe service configured; pass one appropriate to this deployment".to_string(),
        ))
    }

    async fn is_port_forwarded(&self, _port: u16, _proto: &str) -> Result<bool> {
        Ok(false)
    }
}
