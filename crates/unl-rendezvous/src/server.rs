//! Per-connection handler implementing the rendezvous wire protocol:
//! bootstrap directory lookups, passive/simultaneous registration, and the
//! candidate/fight broker that turns `CANDIDATE`+`ACCEPT` into `CHALLENGE`
//! and `FIGHT` relays.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use unl_net::framing::FramedSocket;
use unl_net::rendezvous::protocol;

use crate::candidates::{CandidateTable, RegisterOutcome};
use crate::config::RendezvousConfig;
use crate::nodes::NodeTable;

/// Shared server state: the node directory, the candidate broker, and
/// config-derived timeouts.
pub struct ServerState {
    pub nodes: NodeTable,
    pub candidates: CandidateTable,
    pub config: RendezvousConfig,
}

impl ServerState {
    pub fn new(config: RendezvousConfig) -> Self {
        Self {
            nodes: NodeTable::new(),
            candidates: CandidateTable::new(),
            config,
        }
    }

    pub fn node_lifetime(&self) -> Duration {
        Duration::from_secs(self.config.node_lifetime_secs)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.config.challenge_timeout_secs)
    }
}

const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

fn as_ipv4(addr: SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        std::net::IpAddr::V4(ip) => Some(ip),
        std::net::IpAddr::V6(_) => None,
    }
}

fn wall_clock_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Drive one accepted connection until the peer disconnects, sends `QUIT`,
/// or a protocol error forces a close.
pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, state: Arc<ServerState>) {
    let Some(peer_ip) = as_ipv4(peer_addr) else {
        tracing::warn!(%peer_addr, "rejecting non-IPv4 peer");
        return;
    };

    let mut framed = FramedSocket::from_stream(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            line = framed.recv_line(IDLE_TIMEOUT) => {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(%peer_addr, error = %e, "connection read failed");
                        break;
                    }
                };
                if !framed.is_connected() {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(%peer_addr, %line, "received command");
                if !dispatch(&line, peer_ip, peer_addr, &mut framed, &state, &tx).await {
                    break;
                }
            }
            Some(push) = rx.recv() => {
                if framed.send_line(&push, SEND_TIMEOUT).await.is_err() {
                    break;
                }
            }
        }
    }

    state.nodes.clear(peer_ip);
    framed.close().await;
}

/// Handle one line. Returns `false` when the connection should close.
async fn dispatch(
    line: &str,
    peer_ip: Ipv4Addr,
    peer_addr: SocketAddr,
    framed: &mut FramedSocket,
    state: &Arc<ServerState>,
    tx: &UnboundedSender<String>,
) -> bool {
    if line == "QUIT" {
        return false;
    }

    if line == "CLEAR" {
        state.nodes.clear(peer_ip);
        return true;
    }

    if line.starts_with("BOOTSTRAP") {
        return handle_bootstrap(line, peer_ip, framed, state).await;
    }

    if line.starts_with("SOURCE TCP") {
        return handle_source_tcp(peer_addr, framed).await;
    }

    if line.starts_with("PASSIVE READY") {
        return handle_passive_ready(line, peer_ip, state).await;
    }

    if line.starts_with("SIMULTANEOUS READY") {
        state.nodes.register_simultaneous(peer_ip, tx.clone());
        tracing::info!(%peer_ip, "registered simultaneous node");
        return true;
    }

    if line.starts_with("CANDIDATE") {
        return handle_candidate(line, peer_ip, tx, framed, state).await;
    }

    if line.starts_with("ACCEPT") {
        return handle_accept(line, peer_ip, state).await;
    }

    tracing::warn!(%peer_ip, %line, "unrecognized command");
    true
}

async fn handle_bootstrap(line: &str, peer_ip: Ipv4Addr, framed: &mut FramedSocket, state: &Arc<ServerState>) -> bool {
    let n = match protocol::parse_bootstrap(line) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(%peer_ip, error = %e, "malformed BOOTSTRAP");
            return false;
        }
    };
    let entries = state.nodes.random_sample(n, peer_ip);
    let reply = protocol::encode_nodes(&entries);
    framed.send_line(&reply, SEND_TIMEOUT).await.is_ok()
}

async fn handle_source_tcp(peer_addr: SocketAddr, framed: &mut FramedSocket) -> bool {
    let reply = protocol::encode_remote_tcp(peer_addr.port());
    framed.send_line(&reply, SEND_TIMEOUT).await.is_ok()
}

async fn handle_passive_ready(line: &str, peer_ip: Ipv4Addr, state: &Arc<ServerState>) -> bool {
    match protocol::parse_passive_ready(line) {
        Ok((port, _max_inbound)) => {
            state.nodes.register_passive(peer_ip, port);
            tracing::info!(%peer_ip, port, "registered passive node");
            true
        }
        Err(e) => {
            tracing::warn!(%peer_ip, error = %e, "malformed PASSIVE READY");
            false
        }
    }
}

async fn handle_candidate(
    line: &str,
    peer_ip: Ipv4Addr,
    tx: &UnboundedSender<String>,
    framed: &mut FramedSocket,
    state: &Arc<ServerState>,
) -> bool {
    let (target_ip, predictions) = match protocol::parse_candidate(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%peer_ip, error = %e, "malformed CANDIDATE");
            return false;
        }
    };

    let outcome = state
        .candidates
        .register(target_ip, peer_ip, predictions.clone(), tx.clone(), state.config.max_candidates);
    match outcome {
        RegisterOutcome::TargetFull => {
            tracing::warn!(%peer_ip, %target_ip, "candidate rejected: target at max_candidates");
            return framed.send_line("CANDIDATE FULL", SEND_TIMEOUT).await.is_ok();
        }
        RegisterOutcome::Registered => {}
    }

    if !framed.send_line(&protocol::encode_prediction_set(), SEND_TIMEOUT).await.unwrap_or(false) {
        return false;
    }

    propagate_candidates(target_ip, state);
    true
}

/// Push unpropagated candidates for `target_ip` as `CHALLENGE`s if its
/// simultaneous node is registered and fresh; otherwise force a
/// `RECONNECT` so future predictions land against a refreshed registration.
fn propagate_candidates(target_ip: Ipv4Addr, state: &Arc<ServerState>) {
    if !state.nodes.is_registered_simultaneous(target_ip) {
        return;
    }

    if !state.nodes.is_fresh_simultaneous(target_ip, state.challenge_timeout()) {
        state.nodes.notify_simultaneous(target_ip, protocol::encode_reconnect());
        return;
    }

    for candidate in state.candidates.take_unpropagated(target_ip) {
        let challenge = protocol::encode_challenge(candidate.candidate_ip, &candidate.predictions);
        state.nodes.notify_simultaneous(target_ip, challenge);
    }
}

async fn handle_accept(line: &str, peer_ip: Ipv4Addr, state: &Arc<ServerState>) -> bool {
    let (candidate_ip, predictions, ntp_time) = match protocol::parse_accept(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%peer_ip, error = %e, "malformed ACCEPT");
            return false;
        }
    };

    if (ntp_time - wall_clock_secs()).abs() > state.config.ntp_tolerance_secs {
        tracing::warn!(%peer_ip, ntp_time, "ACCEPT ntp_time out of tolerance");
        return true;
    }

    let fight = protocol::encode_fight(ntp_time, peer_ip, &predictions);
    if !state.candidates.deliver_and_remove(peer_ip, candidate_ip, fight) {
        tracing::warn!(%peer_ip, %candidate_ip, "ACCEPT for unknown/expired candidate");
    }
    true
}
