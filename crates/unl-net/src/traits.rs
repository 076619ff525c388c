//! Consumed interfaces: out-of-band relay, public-IP probe, and clock
//! source. None of these are provided by this crate -- callers supply an
//! implementation appropriate to their deployment (an HTTP client hitting a
//! probe service, an NTP-disciplined clock, a mailbox relay).

use crate::error::Result;

/// Best-effort out-of-band message relay used for reverse-connect requests
/// when neither side can initiate a direct connection.
#[allow(async_fn_in_trait)]
pub trait RelayTransport: Send + Sync {
    async fn send(&self, node_id: [u8; 20], message: Vec<u8>) -> Result<()>;
    async fn poll(&self) -> Result<Vec<(Option<[u8; 20]>, Vec<u8>)>>;
}

/// Reports our externally-visible address and whether a port is forwarded.
#[allow(async_fn_in_trait)]
pub trait PublicIpProbe: Send + Sync {
    async fn get_wan_ip(&self) -> Result<std::net::Ipv4Addr>;
    async fn is_port_forwarded(&self, port: u16, proto: &str) -> Result<bool>;
}

/// A wall clock comparable with a peer's to within ~50ms, used for
/// simultaneous-open meeting-time arithmetic.
pub trait ClockSource: Send + Sync {
    /// Seconds since the epoch, NTP-comparable across peers.
    fn now(&self) -> f64;
}

/// `ClockSource` backed by the local system clock, with no skew correction.
/// Suitable only when the deployment trusts both peers' system clocks to
/// already be closely synchronized (e.g. both behind the same NTP pool).
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_now_is_plausible() {
        let now = SystemClock.now();
        assert!(now > 1_700_000_000.0);
    }
}
