//! UNL connection orchestrator: master election, hairpin rewrite, strategy
//! selection, reverse-connect via the out-of-band relay, and deduplication
//! of concurrent connect attempts to the same peer.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::codec::{self, NodeType, UnlFields};
use crate::error::{NetError, Result};
use crate::traits::RelayTransport;

/// How long a pending reverse-connect query may sit unanswered.
const REVERSE_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-pending-UNL wait budget, multiplied by the current queue depth.
const PENDING_UNL_WAIT_PER_ENTRY: Duration = Duration::from_secs(60);

/// Which side should dial out, decided after hairpin rewrite and strategy
/// selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// We dial `their` UNL directly.
    WeConnect,
    /// We wait for them to dial us.
    TheyConnect,
    /// Both sides attempt a synchronized simultaneous-open.
    SimultaneousOpen,
    /// Neither side can initiate; post a reverse-connect request and wait.
    ReverseConnect,
}

/// Decide which side initiates, after applying the hairpin rewrite when
/// both endpoints share a WAN IP.
///
/// Returns `None` when both sides' raw UNL bytes are bit-identical -- the
/// "our UNL equals their UNL" edge case from the original implementation,
/// where neither side can be deterministically elected master.
pub fn is_master(our_encoded: &str, their_encoded: &str) -> Option<bool> {
    if our_encoded == their_encoded {
        tracing::warn!("our UNL and the peer's UNL are byte-identical; no master can be elected");
        return None;
    }

    // Mirrors `int(binascii.hexlify(unl), 16)` comparison: decoding to raw
    // bytes and comparing lexicographically is exactly big-endian numeric
    // comparison of the underlying integer.
    let our_bytes = BASE64.decode(our_encoded.trim()).ok()?;
    let their_bytes = BASE64.decode(their_encoded.trim()).ok()?;
    Some(our_bytes > their_bytes)
}

/// Apply the hairpin rewrite: if both endpoints share a WAN IP (same public
/// IP, both behind one NAT), substitute each side's WAN IP with its LAN IP
/// and, if `downgrade` is set, force both node types to `passive` since no
/// traversal is required.
pub fn hairpin_rewrite(mut ours: UnlFields, mut theirs: UnlFields, downgrade: bool) -> (UnlFields, UnlFields) {
    if ours.wan_ip == theirs.wan_ip {
        ours.wan_ip = ours.lan_ip;
        theirs.wan_ip = theirs.lan_ip;
        if downgrade {
            ours.node_type = NodeType::Passive;
            theirs.node_type = NodeType::Passive;
        }
    }
    (ours, theirs)
}

/// Strategy selection table from `spec.md` §4.G, applied after the hairpin
/// rewrite, in passive-then-simultaneous order.
pub fn select_strategy(master: bool, ours: NodeType, theirs: NodeType) -> Strategy {
    use NodeType::*;

    if theirs == Passive {
        return if master { Strategy::WeConnect } else { Strategy::TheyConnect };
    }
    if ours == Passive && theirs == Simultaneous {
        return Strategy::TheyConnect;
    }
    if ours == Simultaneous && theirs == Simultaneous {
        return Strategy::SimultaneousOpen;
    }
    if ours == Active && theirs != Active {
        return Strategy::TheyConnect;
    }
    if ours != Active && theirs == Active {
        return Strategy::WeConnect;
    }
    // Both active (or any combination not covered above): neither side can
    // safely initiate.
    Strategy::ReverseConnect
}

/// Builds and parses the three plain-text messages exchanged over the
/// out-of-band relay.
pub mod relay_messages {
    pub fn reverse_connect(our_unl: &str, nonce: &str) -> String {
        format!("REVERSE_CONNECT:{our_unl}:{nonce}")
    }

    pub fn reverse_query(our_unl: &str) -> String {
        format!("REVERSE_QUERY:{our_unl}")
    }

    pub fn reverse_origin(our_unl: &str) -> String {
        format!("REVERSE_ORIGIN:{our_unl}")
    }

    /// Parse an incoming relay message into its tag and UNL payload.
    pub fn parse(message: &str) -> Option<(&'static str, &str, Option<&str>)> {
        if let Some(rest) = message.strip_prefix("REVERSE_CONNECT:") {
            let mut parts = rest.splitn(2, ':');
            let unl = parts.next()?;
            let nonce = parts.next();
            return Some(("REVERSE_CONNECT", unl, nonce));
        }
        if let Some(unl) = message.strip_prefix("REVERSE_QUERY:") {
            return Some(("REVERSE_QUERY", unl, None));
        }
        if let Some(unl) = message.strip_prefix("REVERSE_ORIGIN:") {
            return Some(("REVERSE_ORIGIN", unl, None));
        }
        None
    }
}

struct PendingReverseQuery {
    peer_unl: String,
    posted_at: Instant,
}

struct PendingOrigin {
    peer_unl: String,
    posted_at: Instant,
}

/// Deduplicates concurrent connect attempts and tracks in-flight
/// reverse-connect requests. Shared across all connect attempts from one
/// Supervisor instance.
pub struct Orchestrator {
    pending_unls: Mutex<Vec<String>>,
    pending_sim_open: Mutex<Vec<String>>,
    /// Posted `REVERSE_CONNECT`s awaiting the peer's `REVERSE_QUERY` echo
    /// (we are the original poster who cannot initiate).
    pending_reverse: Mutex<Vec<PendingReverseQuery>>,
    /// Acknowledged `REVERSE_CONNECT`s awaiting the poster's `REVERSE_ORIGIN`
    /// confirmation before we dial them (we are the responder, roles swapped).
    pending_origin: Mutex<Vec<PendingOrigin>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            pending_unls: Mutex::new(Vec::new()),
            pending_sim_open: Mutex::new(Vec::new()),
            pending_reverse: Mutex::new(Vec::new()),
            pending_origin: Mutex::new(Vec::new()),
        }
    }

    /// Wait for any prior connect attempt to `their_unl` to finish, then
    /// register ours. Returns a guard; drop it (via `finish`) to remove the
    /// entry unconditionally once the attempt concludes.
    pub async fn enter(&self, their_unl: &str) -> PendingGuard<'_> {
        let deadline = {
            let pending = self.pending_unls.lock().await;
            Instant::now() + PENDING_UNL_WAIT_PER_ENTRY * pending.len().max(1) as u32
        };

        loop {
            {
                let pending = self.pending_unls.lock().await;
                if !pending.iter().any(|u| u == their_unl) {
                    break;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.pending_unls.lock().await.push(their_unl.to_string());
        PendingGuard {
            orchestrator: self,
            unl: their_unl.to_string(),
        }
    }

    /// FIFO-queue behind other simultaneous-opens targeting the same peer,
    /// returning once this attempt reaches the front of the queue.
    pub async fn queue_simultaneous_open(&self, their_unl: &str) -> SimOpenGuard<'_> {
        {
            let mut queue = self.pending_sim_open.lock().await;
            queue.push(their_unl.to_string());
        }

        let deadline = Instant::now()
            + PENDING_UNL_WAIT_PER_ENTRY * self.pending_unls.lock().await.len().max(1) as u32;
        loop {
            {
                let queue = self.pending_sim_open.lock().await;
                if queue.first().map(|s| s.as_str()) == Some(their_unl) {
                    break;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        SimOpenGuard {
            orchestrator: self,
            unl: their_unl.to_string(),
        }
    }

    /// Post a `REVERSE_CONNECT` request through `relay` and track it as
    /// pending.
    pub async fn request_reverse_connect(
        &self,
        relay: &impl RelayTransport,
        their_node_id: [u8; 20],
        our_unl: &str,
        nonce: &str,
    ) -> Result<()> {
        let message = relay_messages::reverse_connect(our_unl, nonce);
        relay.send(their_node_id, message.into_bytes()).await?;
        self.pending_reverse.lock().await.push(PendingReverseQuery {
            peer_unl: our_unl.to_string(),
            posted_at: Instant::now(),
        });
        Ok(())
    }

    /// Drop any pending reverse-connect queries older than
    /// [`REVERSE_QUERY_TIMEOUT`].
    pub async fn expire_reverse_queries(&self) {
        let mut pending = self.pending_reverse.lock().await;
        pending.retain(|p| p.posted_at.elapsed() < REVERSE_QUERY_TIMEOUT);

        let mut pending_origin = self.pending_origin.lock().await;
        pending_origin.retain(|p| p.posted_at.elapsed() < REVERSE_QUERY_TIMEOUT);
    }

    /// Responder side: we received a `REVERSE_CONNECT` naming the poster's
    /// own UNL. Echo it back as `REVERSE_QUERY` so they know we got it, and
    /// remember we're waiting on their `REVERSE_ORIGIN` before dialing them
    /// -- roles are swapped, so we initiate once that confirmation lands.
    pub async fn handle_reverse_connect(
        &self,
        relay: &impl RelayTransport,
        source_node_id: [u8; 20],
        peer_unl: &str,
    ) -> Result<()> {
        let message = relay_messages::reverse_query(peer_unl);
        relay.send(source_node_id, message.into_bytes()).await?;
        self.pending_origin.lock().await.push(PendingOrigin {
            peer_unl: peer_unl.to_string(),
            posted_at: Instant::now(),
        });
        Ok(())
    }

    /// Poster side: `source_node_id` echoed our posted UNL back via
    /// `REVERSE_QUERY`, confirming they received our `REVERSE_CONNECT`.
    /// Reply `REVERSE_ORIGIN` to confirm authenticity and retire the
    /// pending entry -- they initiate from here, not us.
    pub async fn handle_reverse_query(
        &self,
        relay: &impl RelayTransport,
        source_node_id: [u8; 20],
        peer_unl: &str,
    ) -> Result<()> {
        let matched = {
            let mut pending = self.pending_reverse.lock().await;
            match pending.iter().position(|p| p.peer_unl == peer_unl) {
                Some(pos) => {
                    pending.remove(pos);
                    true
                }
                None => false,
            }
        };
        if !matched {
            return Ok(());
        }

        let message = relay_messages::reverse_origin(peer_unl);
        relay.send(source_node_id, message.into_bytes()).await
    }

    /// Responder side: `peer_unl` matches an entry we acknowledged with
    /// `REVERSE_QUERY` and are waiting to hear `REVERSE_ORIGIN` for. Returns
    /// the poster's decoded UNL fields so the caller can dial them directly.
    pub async fn handle_reverse_origin(&self, peer_unl: &str) -> Option<UnlFields> {
        let mut pending = self.pending_origin.lock().await;
        let pos = pending.iter().position(|p| p.peer_unl == peer_unl)?;
        pending.remove(pos);
        codec::deconstruct(peer_unl).ok()
    }

    /// Number of in-flight connect attempts, used to size dedup wait
    /// budgets elsewhere.
    pub async fn in_flight(&self) -> usize {
        self.pending_unls.lock().await.len()
    }
}

/// RAII guard removing a `pending_unls` entry unconditionally on drop is not
/// possible for async cleanup, so callers must call `finish` explicitly
/// (mirrors the original's `finally`-block removal).
pub struct PendingGuard<'a> {
    orchestrator: &'a Orchestrator,
    unl: String,
}

impl PendingGuard<'_> {
    pub async fn finish(self) {
        let mut pending = self.orchestrator.pending_unls.lock().await;
        if let Some(pos) = pending.iter().position(|u| u == &self.unl) {
            pending.remove(pos);
        }
    }
}

pub struct SimOpenGuard<'a> {
    orchestrator: &'a Orchestrator,
    unl: String,
}

impl SimOpenGuard<'_> {
    pub async fn finish(self) {
        let mut queue = self.orchestrator.pending_sim_open.lock().await;
        if let Some(pos) = queue.iter().position(|u| u == &self.unl) {
            queue.remove(pos);
        }
    }
}

/// Compute the connection id for a nonce-identified direct connection,
/// ordering the two WAN IPs numerically so both peers derive the same id.
pub fn connection_id(nonce: &str, our_wan_ip_hex: &str, their_wan_ip_hex: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let (lower, higher) = if our_wan_ip_hex <= their_wan_ip_hex {
        (our_wan_ip_hex, their_wan_ip_hex)
    } else {
        (their_wan_ip_hex, our_wan_ip_hex)
    };

    let lower_hash = Sha256::digest(lower.as_bytes());
    let higher_hash = Sha256::digest(higher.as_bytes());

    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(lower_hash);
    hasher.update(higher_hash);
    hasher.finalize().into()
}

/// Validate a 64-hex-character nonce as required before a `direct`-type
/// connection is indexable by `con_id`.
pub fn validate_nonce(nonce: &str) -> Result<()> {
    if nonce.len() != 64 || !nonce.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(NetError::Protocol("nonce must be 64 hex characters".to_string()));
    }
    Ok(())
}

/// Convenience wrapper combining `codec::deconstruct` with the hairpin
/// rewrite and strategy selection, returning `None` on the UNL-equality
/// edge case (no deterministic master).
pub fn plan_connection(
    our_encoded: &str,
    their_encoded: &str,
    force_master: bool,
    hairpin: bool,
) -> Result<Option<(Strategy, UnlFields, UnlFields)>> {
    let mut ours = codec::deconstruct(our_encoded)?;
    let mut theirs = codec::deconstruct(their_encoded)?;

    let master = match is_master(our_encoded, their_encoded) {
        Some(m) => force_master || m,
        None if force_master => true,
        None => return Ok(None),
    };

    if hairpin {
        let (rewritten_ours, rewritten_theirs) = hairpin_rewrite(ours, theirs, true);
        ours = rewritten_ours;
        theirs = rewritten_theirs;
    }

    let strategy = select_strategy(master, ours.node_type, theirs.node_type);
    Ok(Some((strategy, ours, theirs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::NatKind;
    use crate::portmap::ForwardingMethod;

    fn fields(node_type: NodeType, wan: &str, lan: &str, port: u16) -> UnlFields {
        UnlFields {
            version: codec::CURRENT_VERSION,
            node_id: UnlFields::NO_NODE_ID,
            node_type,
            nat_kind: NatKind::Preserving,
            forwarding: ForwardingMethod::Upnp,
            listen_port: port,
            wan_ip: wan.parse().unwrap(),
            lan_ip: lan.parse().unwrap(),
        }
    }

    #[test]
    fn is_master_is_consistent_and_antisymmetric() {
        let a = codec::construct(&fields(NodeType::Passive, "203.0.113.1", "10.0.0.1", 1));
        let b = codec::construct(&fields(NodeType::Passive, "203.0.113.2", "10.0.0.1", 1));
        assert_eq!(is_master(&a, &b), Some(!is_master(&b, &a).unwrap()));
    }

    #[test]
    fn is_master_returns_none_for_identical_unls() {
        let a = codec::construct(&fields(NodeType::Passive, "203.0.113.1", "10.0.0.1", 1));
        assert_eq!(is_master(&a, &a), None);
    }

    #[test]
    fn hairpin_rewrite_substitutes_lan_and_downgrades() {
        let ours = fields(NodeType::Simultaneous, "203.0.113.9", "10.0.0.5", 1);
        let theirs = fields(NodeType::Active, "203.0.113.9", "10.0.0.6", 2);
        let (ours, theirs) = hairpin_rewrite(ours, theirs, true);
        assert_eq!(ours.wan_ip, "10.0.0.5".parse().unwrap());
        assert_eq!(theirs.wan_ip, "10.0.0.6".parse().unwrap());
        assert_eq!(ours.node_type, NodeType::Passive);
        assert_eq!(theirs.node_type, NodeType::Passive);
    }

    #[test]
    fn hairpin_rewrite_noop_for_distinct_wan() {
        let ours = fields(NodeType::Active, "203.0.113.9", "10.0.0.5", 1);
        let theirs = fields(NodeType::Active, "198.51.100.1", "10.0.0.6", 2);
        let (rewritten_ours, rewritten_theirs) = hairpin_rewrite(ours, theirs, true);
        assert_eq!(rewritten_ours.wan_ip, ours.wan_ip);
        assert_eq!(rewritten_theirs.node_type, NodeType::Active);
    }

    #[test]
    fn strategy_peer_passive_means_master_connects() {
        assert_eq!(
            select_strategy(true, NodeType::Active, NodeType::Passive),
            Strategy::WeConnect
        );
        assert_eq!(
            select_strategy(false, NodeType::Active, NodeType::Passive),
            Strategy::TheyConnect
        );
    }

    #[test]
    fn strategy_both_simultaneous_means_sim_open() {
        assert_eq!(
            select_strategy(true, NodeType::Simultaneous, NodeType::Simultaneous),
            Strategy::SimultaneousOpen
        );
    }

    #[test]
    fn strategy_active_vs_active_means_reverse_connect() {
        assert_eq!(
            select_strategy(true, NodeType::Active, NodeType::Active),
            Strategy::ReverseConnect
        );
    }

    #[test]
    fn strategy_non_active_initiates_against_active_peer() {
        assert_eq!(
            select_strategy(true, NodeType::Simultaneous, NodeType::Active),
            Strategy::WeConnect
        );
        assert_eq!(
            select_strategy(false, NodeType::Active, NodeType::Simultaneous),
            Strategy::TheyConnect
        );
    }

    #[test]
    fn relay_message_round_trip() {
        let msg = relay_messages::reverse_connect("unl123", "ab".repeat(32).as_str());
        let (tag, unl, nonce) = relay_messages::parse(&msg).unwrap();
        assert_eq!(tag, "REVERSE_CONNECT");
        assert_eq!(unl, "unl123");
        assert!(nonce.is_some());
    }

    #[test]
    fn validate_nonce_rejects_wrong_length() {
        assert!(validate_nonce("ab").is_err());
        assert!(validate_nonce(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn connection_id_is_order_independent() {
        let a = connection_id("nonce", "c0a80001", "c0a80002");
        let b = connection_id("nonce", "c0a80002", "c0a80001");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn enter_dedups_concurrent_attempts_to_same_unl() {
        let orch = Orchestrator::new();
        let guard = orch.enter("peer-unl").await;
        assert_eq!(orch.in_flight().await, 1);
        guard.finish().await;
        assert_eq!(orch.in_flight().await, 0);
    }

    struct RecordingRelay {
        sent: Mutex<Vec<([u8; 20], String)>>,
    }

    impl RecordingRelay {
        fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()) }
        }
    }

    impl crate::traits::RelayTransport for RecordingRelay {
        async fn send(&self, node_id: [u8; 20], message: Vec<u8>) -> Result<()> {
            self.sent.lock().await.push((node_id, String::from_utf8(message).unwrap()));
            Ok(())
        }
        async fn poll(&self) -> Result<Vec<(Option<[u8; 20]>, Vec<u8>)>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn reverse_connect_responder_round_trip_ends_in_origin_confirmation() {
        let bob = Orchestrator::new();
        let alice = Orchestrator::new();
        let relay = RecordingRelay::new();
        let alice_node_id = [1u8; 20];
        let bob_node_id = [2u8; 20];
        let alice_unl = codec::construct(&fields(NodeType::Active, "203.0.113.1", "10.0.0.1", 1));

        alice
            .request_reverse_connect(&relay, bob_node_id, &alice_unl, &"a".repeat(64))
            .await
            .unwrap();

        // Bob receives the REVERSE_CONNECT and acknowledges with REVERSE_QUERY.
        bob.handle_reverse_connect(&relay, alice_node_id, &alice_unl).await.unwrap();
        let (dest, msg) = relay.sent.lock().await[1].clone();
        assert_eq!(dest, alice_node_id);
        assert_eq!(msg, relay_messages::reverse_query(&alice_unl));

        // Alice receives the REVERSE_QUERY and confirms with REVERSE_ORIGIN.
        alice.handle_reverse_query(&relay, bob_node_id, &alice_unl).await.unwrap();
        let (dest, msg) = relay.sent.lock().await[2].clone();
        assert_eq!(dest, bob_node_id);
        assert_eq!(msg, relay_messages::reverse_origin(&alice_unl));

        // Bob receives the REVERSE_ORIGIN and is now cleared to dial Alice.
        let dial_target = bob.handle_reverse_origin(&alice_unl).await.unwrap();
        assert_eq!(dial_target.wan_ip, "203.0.113.1".parse().unwrap());

        // Each step retires its pending entry once matched.
        assert!(bob.handle_reverse_origin(&alice_unl).await.is_none());
    }

    #[tokio::test]
    async fn reverse_query_ignored_without_a_matching_pending_post() {
        let orch = Orchestrator::new();
        let relay = RecordingRelay::new();
        orch.handle_reverse_query(&relay, [9u8; 20], "unknown-unl").await.unwrap();
        assert!(relay.sent.lock().await.is_empty());
    }
}
