//! Simultaneous-Open Engine: synchronize two hosts against a shared
//! meeting time, then race parallel (or, for delta NATs, sequential)
//! connect attempts against listen sockets so a SYN crossing succeeds.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};

use crate::nat::{NatDescriptor, NatKind};
use crate::rendezvous::connect_from_local_port;
use crate::traits::ClockSource;
use crate::error::{NetError, Result};

const NTP_DELAY_SECS: f64 = 6.0;
const MAX_MEETING_SLEEP_SECS: f64 = 300.0;
/// Switch from coarse `tokio::time::sleep` to a busy-wait once within this
/// long of the meeting time -- commodity schedulers drift 10-50ms on
/// coarse sleeps, enough to blow the SYN-crossing window.
const BUSY_WAIT_WINDOW: Duration = Duration::from_secs(1);
const LOOPBACK_RETRY_ATTEMPTS: u32 = 20;
const LOOPBACK_RETRY_JITTER_MS: u64 = 25;
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Compute how long to sleep before the meeting, given a peer-reported
/// meeting time `t_peer` (NTP-comparable seconds) and our clock source.
/// Errors when the meeting has already passed or lies implausibly far in
/// the future.
pub fn plan_meeting(clock: &impl ClockSource, t_peer: f64) -> Result<Duration> {
    let t_local = clock.now();
    let sleep = (t_peer + NTP_DELAY_SECS) - t_local;

    if sleep < 0.0 {
        return Err(NetError::NatTraversal("simultaneous-open meeting already missed".to_string()));
    }
    if sleep >= MAX_MEETING_SLEEP_SECS {
        return Err(NetError::NatTraversal(
            "simultaneous-open meeting time implausibly far in the future".to_string(),
        ));
    }
    Ok(Duration::from_secs_f64(sleep))
}

/// Sleep until the meeting time: coarse sleep for everything beyond
/// [`BUSY_WAIT_WINDOW`], then a blocking-thread busy-wait for the final
/// stretch so the wakeup lands within microseconds of the target.
pub async fn wait_for_meeting(sleep: Duration) {
    if sleep > BUSY_WAIT_WINDOW {
        tokio::time::sleep(sleep - BUSY_WAIT_WINDOW).await;
    }
    let remaining = sleep.min(BUSY_WAIT_WINDOW);
    let _ = tokio::task::spawn_blocking(move || {
        let deadline = std::time::Instant::now() + remaining;
        while std::time::Instant::now() < deadline {
            std::hint::spin_loop();
        }
    })
    .await;
}

fn is_loopback_or_private(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private()
}

/// Attempt a single connect from `local_port` to `peer_ip:peer_port`,
/// retrying with jitter when the peer is loopback/private (compensating
/// for the missing WAN latency that would otherwise smooth out timing on
/// same-host tests).
async fn connect_attempt(local_port: u16, peer_ip: Ipv4Addr, peer_port: u16) -> Option<TcpStream> {
    let target = SocketAddr::new(IpAddr::V4(peer_ip), peer_port);
    let attempts = if is_loopback_or_private(peer_ip) { LOOPBACK_RETRY_ATTEMPTS } else { 1 };

    for attempt in 0..attempts {
        if let Ok(Ok(stream)) = tokio::time::timeout(CONNECT_ATTEMPT_TIMEOUT, connect_from_local_port(local_port, target)).await {
            return Some(stream);
        }
        if attempt + 1 < attempts {
            let jitter = Duration::from_millis(LOOPBACK_RETRY_JITTER_MS * (attempt as u64 % 4));
            tokio::time::sleep(jitter).await;
        }
    }
    None
}

/// Race connect attempts across `listeners` against `peer_ip` using
/// `predicted_ports` (paired positionally with `listeners`), falling back
/// to polling the listen sockets for an already-arrived inbound connection.
/// Returns exactly one winning stream, or `None` if nothing succeeded.
pub async fn attend_fight(
    listeners: Vec<TcpListener>,
    peer_ip: Ipv4Addr,
    predicted_ports: &[u16],
    nat: &NatDescriptor,
) -> Option<TcpStream> {
    let pairs: Vec<(u16, u16)> = listeners
        .iter()
        .zip(predicted_ports.iter())
        .filter_map(|(l, &port)| l.local_addr().ok().map(|a| (a.port(), port)))
        .collect();

    let winner = if nat.kind == NatKind::Delta {
        // Delta NATs are adjacent-mapping-sensitive: parallel attempts
        // would steal each other's port allocation, so attempts run
        // sequentially in source-port order.
        let mut winner = None;
        for &(local_port, peer_port) in &pairs {
            if let Some(stream) = connect_attempt(local_port, peer_ip, peer_port).await {
                winner = Some(stream);
                break;
            }
        }
        winner
    } else {
        let mut futures = FuturesUnordered::new();
        for &(local_port, peer_port) in &pairs {
            futures.push(connect_attempt(local_port, peer_ip, peer_port));
        }
        let mut winner = None;
        while let Some(result) = futures.next().await {
            if result.is_some() {
                winner = result;
                break;
            }
        }
        winner
    };

    if winner.is_some() {
        return winner;
    }

    poll_accept_queues(listeners).await
}

/// Poll every listener non-blockingly for a connection that may have
/// already arrived (the peer's SYN reaching us first).
async fn poll_accept_queues(listeners: Vec<TcpListener>) -> Option<TcpStream> {
    let mut futures = FuturesUnordered::new();
    for listener in listeners {
        futures.push(async move {
            tokio::time::timeout(Duration::from_millis(200), listener.accept())
                .await
                .ok()
                .and_then(|r| r.ok())
                .map(|(stream, _)| stream)
        });
    }
    while let Some(result) = futures.next().await {
        if result.is_some() {
            return result;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::sequential_bind;

    struct FixedClock(f64);
    impl ClockSource for FixedClock {
        fn now(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn plan_meeting_rejects_already_missed_meeting() {
        let clock = FixedClock(1000.0);
        assert!(plan_meeting(&clock, 900.0).is_err());
    }

    #[test]
    fn plan_meeting_rejects_implausible_future() {
        let clock = FixedClock(1000.0);
        assert!(plan_meeting(&clock, 1000.0 + 400.0).is_err());
    }

    #[test]
    fn plan_meeting_accepts_reasonable_window() {
        let clock = FixedClock(1000.0);
        let sleep = plan_meeting(&clock, 1000.0 + 2.0).unwrap();
        assert!(sleep.as_secs_f64() > 0.0 && sleep.as_secs_f64() < MAX_MEETING_SLEEP_SECS);
    }

    #[tokio::test]
    async fn wait_for_meeting_returns_for_small_sleep() {
        let start = std::time::Instant::now();
        wait_for_meeting(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn connect_attempt_succeeds_against_listening_peer() {
        let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_port = peer.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = peer.accept().await;
        });
        let stream = connect_attempt(0, "127.0.0.1".parse().unwrap(), peer_port).await;
        assert!(stream.is_some());
    }

    #[tokio::test]
    async fn poll_accept_queues_finds_already_pending_connection() {
        let listeners = sequential_bind(1).await.unwrap();
        let port = listeners[0].local_addr().unwrap().port();
        let _incoming = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let result = poll_accept_queues(listeners).await;
        assert!(result.is_some());
    }
}
