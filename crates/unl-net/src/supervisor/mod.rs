//! Network Supervisor: owns the passive listener and inbound/outbound
//! connection sets, runs the `start()` setup sequence, and drives the
//! periodic `synchronize()` pass (relay draining, handshake pumping,
//! accept-loop, simultaneous-open dispatch).

mod config;

pub use config::{
    NetType, SupervisorConfig, ADVERTISE_INTERVAL, DHT_MSG_INTERVAL, HANDSHAKE_PUMP_BYTES,
    MIN_CONNECTED, RENDEZVOUS_INTERVAL, SIM_OPEN_INTERVAL,
};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::{NetError, Result};
use crate::framing::{FramedSocket, SeenMessages};
use crate::nat::NatDescriptor;
use crate::portmap::{try_forward_any, ForwardedPort, ForwardingMethod};
use crate::rendezvous::{protocol, sequential_bind, RendezvousClient};
use crate::simopen;
use crate::traits::{ClockSource, PublicIpProbe, RelayTransport};
use crate::unl::{self, relay_messages, NodeType, Orchestrator, UnlFields};

/// Lifecycle state: `created -> started -> { serving | stopped }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Created,
    Started,
    Serving,
    Stopped,
}

/// Owns the listening socket, the inbound/outbound connection sets, and the
/// cadence bookkeeping for bootstrap/advertise/relay/simultaneous-open.
pub struct Supervisor {
    config: SupervisorConfig,
    rendezvous: Mutex<RendezvousClient>,
    orchestrator: Orchestrator,
    seen: SeenMessages,

    state: Mutex<SupervisorState>,
    running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,

    passive_listener: Mutex<Option<TcpListener>>,
    inbound: Mutex<Vec<FramedSocket>>,
    outbound: Mutex<Vec<FramedSocket>>,
    /// Direct-net connections awaiting their nonce handshake before joining
    /// `inbound`/`outbound`.
    pending_handshakes: Mutex<Vec<(FramedSocket, bool)>>,

    nat: Mutex<Option<NatDescriptor>>,
    node_type: Mutex<Option<NodeType>>,
    forwarded: Mutex<Option<ForwardedPort>>,
    local_unl: Mutex<Option<String>>,

    last_bootstrap: Mutex<Option<Instant>>,
    last_advertise: Mutex<Option<Instant>>,
    last_dht_poll: Mutex<Option<Instant>>,
    last_sim_open: Mutex<Option<Instant>>,
}

impl Supervisor {
    pub async fn new(config: SupervisorConfig, rendezvous_server: SocketAddr) -> Result<Self> {
        let rendezvous = RendezvousClient::connect_to_server(rendezvous_server).await?;
        Ok(Self {
            config,
            rendezvous: Mutex::new(rendezvous),
            orchestrator: Orchestrator::new(),
            seen: SeenMessages::new(),
            state: Mutex::new(SupervisorState::Created),
            running: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            passive_listener: Mutex::new(None),
            inbound: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
            pending_handshakes: Mutex::new(Vec::new()),
            nat: Mutex::new(None),
            node_type: Mutex::new(None),
            forwarded: Mutex::new(None),
            local_unl: Mutex::new(None),
            last_bootstrap: Mutex::new(None),
            last_advertise: Mutex::new(None),
            last_dht_poll: Mutex::new(None),
            last_sim_open: Mutex::new(None),
        })
    }

    pub async fn state(&self) -> SupervisorState {
        *self.state.lock().await
    }

    pub async fn local_unl(&self) -> Option<String> {
        self.local_unl.lock().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn inbound_count(&self) -> usize {
        self.inbound.lock().await.len()
    }

    pub async fn outbound_count(&self) -> usize {
        self.outbound.lock().await.len()
    }

    /// Characterize the NAT (if not already known), open the passive
    /// listener, attempt port forwarding, finalize the node type, and build
    /// the local UNL.
    pub async fn start(&self, probe: &impl PublicIpProbe) -> Result<()> {
        {
            let state = self.state.lock().await;
            if *state != SupervisorState::Created {
                return Err(NetError::Configuration("supervisor already started".to_string()));
            }
        }

        let nat = match self.config.nat_type {
            Some(kind) => NatDescriptor::new(kind, 0),
            None => self.rendezvous.lock().await.determine_nat().await?,
        };
        *self.nat.lock().await = Some(nat);

        let listener = TcpListener::bind((self.config.passive_bind, self.config.passive_port))
            .await
            .map_err(|e| NetError::Configuration(format!("passive listener bind failed: {e}")))?;
        let listen_port = listener.local_addr()?.port();
        *self.passive_listener.lock().await = Some(listener);

        let wan_ip = match self.config.wan_ip {
            Some(ip) => ip,
            None => probe.get_wan_ip().await?,
        };

        let forwarded = if self.config.enable_forwarding {
            let internal_addr = SocketAddr::new(IpAddr::V4(self.config.lan_ip), listen_port);
            try_forward_any(internal_addr, listen_port, "p2p listen port", probe).await.ok()
        } else {
            None
        };
        *self.forwarded.lock().await = forwarded;

        let node_type = match self.config.node_type {
            Some(explicit) => explicit,
            None if forwarded.is_some() => NodeType::Passive,
            None if self.config.enable_simultaneous && nat.kind.is_predictable() => NodeType::Simultaneous,
            None => NodeType::Active,
        };
        *self.node_type.lock().await = Some(node_type);

        let forwarding_method = forwarded.map(|f| f.method).unwrap_or(ForwardingMethod::AlreadyForwarded);
        let fields = UnlFields {
            version: unl::CURRENT_VERSION,
            node_id: UnlFields::NO_NODE_ID,
            node_type,
            nat_kind: nat.kind,
            forwarding: forwarding_method,
            listen_port,
            wan_ip,
            lan_ip: self.config.lan_ip,
        };
        *self.local_unl.lock().await = Some(unl::construct(&fields));

        self.running.store(true, Ordering::SeqCst);
        *self.state.lock().await = SupervisorState::Started;
        Ok(())
    }

    /// One iteration of the periodic synchronization pass: prune closed
    /// connections, expire reverse queries, pump pending handshakes, drain
    /// the relay, accept inbound connections, and (if simultaneous) dispatch
    /// `CHALLENGE`/`RECONNECT` notifications.
    pub async fn synchronize(&self, relay: Option<&impl RelayTransport>, clock: &impl ClockSource) -> Result<()> {
        self.prune_closed().await;
        self.orchestrator.expire_reverse_queries().await;
        self.pump_handshakes().await;

        if let Some(relay) = relay {
            self.drain_relay(relay).await?;
        }

        self.accept_inbound().await?;

        if *self.node_type.lock().await == Some(NodeType::Simultaneous) {
            self.poll_simultaneous(clock).await?;
        }

        *self.state.lock().await = SupervisorState::Serving;
        Ok(())
    }

    async fn prune_closed(&self) {
        self.inbound.lock().await.retain(|s| s.is_connected());
        self.outbound.lock().await.retain(|s| s.is_connected());
    }

    async fn pump_handshakes(&self) {
        let mut pending = self.pending_handshakes.lock().await;
        let mut finished = Vec::new();

        for (idx, (sock, _)) in pending.iter_mut().enumerate() {
            match sock.recv(HANDSHAKE_PUMP_BYTES).await {
                Ok(bytes) if bytes.len() == HANDSHAKE_PUMP_BYTES => {
                    if let Ok(nonce) = std::str::from_utf8(&bytes) {
                        if unl::validate_nonce(nonce).is_ok() {
                            finished.push(idx);
                        }
                    }
                }
                Ok(_) => {}
                Err(_) => finished.push(idx),
            }
        }

        for idx in finished.into_iter().rev() {
            let (sock, is_inbound) = pending.remove(idx);
            if sock.is_connected() {
                if is_inbound {
                    self.inbound.lock().await.push(sock);
                } else {
                    self.outbound.lock().await.push(sock);
                }
            }
        }
    }

    /// Register a freshly `connect()`-ed direct-net socket so its nonce
    /// handshake gets pumped by `synchronize()`.
    pub async fn register_pending_handshake(&self, stream: TcpStream, is_inbound: bool) {
        self.pending_handshakes.lock().await.push((FramedSocket::from_stream(stream), is_inbound));
    }

    async fn drain_relay(&self, relay: &impl RelayTransport) -> Result<()> {
        {
            let mut last = self.last_dht_poll.lock().await;
            if let Some(prev) = *last {
                if prev.elapsed() < DHT_MSG_INTERVAL {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }

        for (source, payload) in relay.poll().await? {
            let Ok(text) = String::from_utf8(payload) else { continue };
            let Some((tag, peer_unl, _nonce)) = relay_messages::parse(&text) else { continue };
            let Some(source_node_id) = source else { continue };

            match tag {
                "REVERSE_CONNECT" => {
                    tracing::info!(%peer_unl, "received reverse-connect request");
                    if let Err(e) = self.orchestrator.handle_reverse_connect(relay, source_node_id, peer_unl).await {
                        tracing::warn!(error = %e, "failed to acknowledge reverse-connect request");
                    }
                }
                "REVERSE_QUERY" => {
                    tracing::debug!(%peer_unl, "received reverse-connect query");
                    if let Err(e) = self.orchestrator.handle_reverse_query(relay, source_node_id, peer_unl).await {
                        tracing::warn!(error = %e, "failed to confirm reverse-connect origin");
                    }
                }
                "REVERSE_ORIGIN" => {
                    tracing::debug!(%peer_unl, "received reverse-connect origin reply");
                    if let Some(fields) = self.orchestrator.handle_reverse_origin(peer_unl).await {
                        match TcpStream::connect((fields.wan_ip, fields.listen_port)).await {
                            Ok(stream) => {
                                self.pending_handshakes.lock().await.push((FramedSocket::from_stream(stream), false));
                            }
                            Err(e) => tracing::warn!(error = %e, "reverse-connect dial failed"),
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn accept_inbound(&self) -> Result<()> {
        let mut listener_guard = self.passive_listener.lock().await;
        let Some(listener) = listener_guard.as_mut() else { return Ok(()) };

        while let Ok(Ok((stream, addr))) = tokio::time::timeout(Duration::ZERO, listener.accept()).await {
            if self.is_blocked(addr).await {
                tracing::warn!(%addr, "rejected inbound connection from blocklisted peer");
                continue;
            }
            let mut inbound = self.inbound.lock().await;
            if inbound.len() >= self.config.max_inbound {
                tracing::debug!(%addr, "inbound connection limit reached, dropping");
                continue;
            }
            inbound.push(FramedSocket::from_stream(stream));
        }
        Ok(())
    }

    async fn is_blocked(&self, addr: SocketAddr) -> bool {
        let IpAddr::V4(ip) = addr.ip() else { return true };
        if is_self_ip(ip, self.config.lan_ip, self.config.wan_ip) {
            return true;
        }
        if self.config.enable_duplicates {
            return false;
        }
        let inbound = self.inbound.lock().await;
        let outbound = self.outbound.lock().await;
        inbound
            .iter()
            .chain(outbound.iter())
            .any(|s| s.peer_addr().map(|a| a.ip()) == Some(addr.ip()))
    }

    async fn poll_simultaneous(&self, clock: &impl ClockSource) -> Result<()> {
        {
            let mut last = self.last_sim_open.lock().await;
            if let Some(prev) = *last {
                if prev.elapsed() < SIM_OPEN_INTERVAL {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }

        let line = self.rendezvous.lock().await.control_mut().recv_line(Duration::ZERO).await?;
        if line.is_empty() {
            return Ok(());
        }
        if line == "RECONNECT" {
            tracing::info!("rendezvous server requested re-listen");
            return Ok(());
        }

        let Ok(challenge) = protocol::parse_challenge(&line) else { return Ok(()) };

        // Plan an imminent, locally-anchored meeting and echo it back via
        // ACCEPT; the peer derives its own sleep from the same value.
        let meeting_time = clock.now() + 2.0;
        self.rendezvous
            .lock()
            .await
            .control_mut()
            .send_line(&protocol::encode_accept(challenge.candidate_ip, &challenge.predictions, meeting_time), Duration::from_secs(2))
            .await?;

        let nat = (*self.nat.lock().await).unwrap_or_else(NatDescriptor::unknown);
        let sleep = simopen::plan_meeting(clock, meeting_time)?;
        simopen::wait_for_meeting(sleep).await;

        let listeners = sequential_bind(challenge.predictions.len()).await?;
        if let Some(stream) = simopen::attend_fight(listeners, challenge.candidate_ip, &challenge.predictions, &nat).await {
            self.pending_handshakes.lock().await.push((FramedSocket::from_stream(stream), true));
        }
        Ok(())
    }

    /// At most one `BOOTSTRAP` per [`RENDEZVOUS_INTERVAL`].
    pub async fn maybe_bootstrap(&self, n: u8) -> Result<Vec<protocol::NodeEntry>> {
        if !self.config.enable_bootstrap {
            return Ok(Vec::new());
        }
        {
            let mut last = self.last_bootstrap.lock().await;
            if let Some(prev) = *last {
                if prev.elapsed() < RENDEZVOUS_INTERVAL {
                    return Ok(Vec::new());
                }
            }
            *last = Some(Instant::now());
        }
        self.rendezvous.lock().await.bootstrap(n).await
    }

    /// At most one advertisement per [`ADVERTISE_INTERVAL`], skipped once
    /// `|inbound| >= MIN_CONNECTED`.
    pub async fn maybe_advertise(&self) -> Result<()> {
        if !self.config.enable_advertise {
            return Ok(());
        }
        if self.inbound.lock().await.len() >= MIN_CONNECTED {
            return Ok(());
        }
        {
            let mut last = self.last_advertise.lock().await;
            if let Some(prev) = *last {
                if prev.elapsed() < ADVERTISE_INTERVAL {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }

        let node_type = *self.node_type.lock().await;
        match node_type {
            Some(NodeType::Passive) => {
                let port = {
                    let listener = self.passive_listener.lock().await;
                    listener.as_ref().map(|l| l.local_addr()).transpose()?.map(|a| a.port())
                };
                if let Some(port) = port {
                    self.rendezvous.lock().await.passive_listen(port, self.config.max_inbound as u32).await?;
                }
            }
            Some(NodeType::Simultaneous) => {
                // Simultaneous nodes re-advertise via the control-channel
                // round trip already performed in `simultaneous_listen`;
                // nothing further to send here.
            }
            _ => {}
        }
        Ok(())
    }

    /// Send `line` to every established connection except `exclude`,
    /// suppressing retransmitted duplicates via the seen-messages table.
    pub async fn broadcast(&self, line: &str, exclude: Option<SocketAddr>) {
        if self.seen.observe(line.as_bytes()) {
            return;
        }
        let mut inbound = self.inbound.lock().await;
        let mut outbound = self.outbound.lock().await;
        for sock in inbound.iter_mut().chain(outbound.iter_mut()) {
            if exclude.is_some() && sock.peer_addr() == exclude {
                continue;
            }
            let _ = sock.send_line(line, Duration::from_secs(2)).await;
        }
    }

    /// Flip the running flag, wake anyone waiting on [`Supervisor::stopped`],
    /// close the passive listener, and best-effort shut down every
    /// established socket.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();

        *self.passive_listener.lock().await = None;

        let mut inbound = self.inbound.lock().await;
        for sock in inbound.iter_mut() {
            sock.close().await;
        }
        inbound.clear();

        let mut outbound = self.outbound.lock().await;
        for sock in outbound.iter_mut() {
            sock.close().await;
        }
        outbound.clear();

        *self.state.lock().await = SupervisorState::Stopped;
    }

    /// Resolves once `stop()` has been called.
    pub async fn stopped(&self) {
        self.stop_notify.notified().await;
    }
}

fn is_self_ip(ip: Ipv4Addr, lan_ip: Ipv4Addr, wan_ip: Option<Ipv4Addr>) -> bool {
    ip == lan_ip || Some(ip) == wan_ip
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as NetResult;

    struct FakeProbe;

    impl PublicIpProbe for FakeProbe {
        async fn get_wan_ip(&self) -> NetResult<Ipv4Addr> {
            Ok("203.0.113.9".parse().unwrap())
        }
        async fn is_port_forwarded(&self, _port: u16, _proto: &str) -> NetResult<bool> {
            Ok(false)
        }
    }

    async fn spawn_fake_rendezvous_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut sock = FramedSocket::from_stream(stream);
                    loop {
                        let line = sock.recv_line(Duration::from_secs(2)).await.unwrap_or_default();
                        if line.is_empty() {
                            break;
                        }
                        if let Some(port) = line.strip_prefix("SOURCE TCP ") {
                            let _ = sock.send_line(&format!("REMOTE TCP {port}"), Duration::from_secs(1)).await;
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn is_self_ip_matches_lan_and_wan() {
        let lan: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let wan = Some("203.0.113.9".parse().unwrap());
        assert!(is_self_ip("10.0.0.5".parse().unwrap(), lan, wan));
        assert!(is_self_ip("203.0.113.9".parse().unwrap(), lan, wan));
        assert!(!is_self_ip("203.0.113.10".parse().unwrap(), lan, wan));
    }

    #[test]
    fn default_config_disallows_duplicate_ips_by_default() {
        let config = SupervisorConfig::default();
        assert!(!config.enable_duplicates);
        assert!(config.enable_bootstrap);
    }

    #[tokio::test]
    async fn supervisor_start_builds_a_unl_without_forwarding() {
        let addr = spawn_fake_rendezvous_server().await;
        let mut config = SupervisorConfig::default();
        config.enable_forwarding = false;

        let supervisor = Supervisor::new(config, addr).await.unwrap();
        supervisor.start(&FakeProbe).await.unwrap();

        assert_eq!(supervisor.state().await, SupervisorState::Started);
        assert!(supervisor.local_unl().await.is_some());
        assert!(supervisor.is_running());
    }

    #[tokio::test]
    async fn maybe_bootstrap_respects_disabled_flag() {
        let addr = spawn_fake_rendezvous_server().await;
        let mut config = SupervisorConfig::default();
        config.enable_bootstrap = false;

        let supervisor = Supervisor::new(config, addr).await.unwrap();
        let nodes = supervisor.maybe_bootstrap(5).await.unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn stop_flips_running_flag_and_wakes_waiters() {
        let addr = spawn_fake_rendezvous_server().await;
        let supervisor = Supervisor::new(SupervisorConfig::default(), addr).await.unwrap();
        supervisor.running.store(true, Ordering::SeqCst);

        supervisor.stop().await;

        assert!(!supervisor.is_running());
        assert_eq!(supervisor.state().await, SupervisorState::Stopped);
        supervisor.stopped().await;
    }
}
