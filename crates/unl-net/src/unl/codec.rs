//! Universal Node Locator wire codec: a 38-byte packed little-endian
//! record, base64-encoded for textual transport.
//!
//! Field layout (`offset: size`): `0:1` version, `1:20` node id, `21:1`
//! node type code, `22:1` NAT type code, `23:1` forwarding type code,
//! `24:2` listen port, `26:4` WAN IPv4, `30:4` LAN IPv4, `34:4` checksum
//! (first 4 bytes of `SHA256(SHA256(bytes[0..34]))`).

use std::net::Ipv4Addr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::{NetError, Result};
use crate::nat::NatKind;
use crate::portmap::ForwardingMethod;

pub const CURRENT_VERSION: u8 = 2;
const RECORD_LEN: usize = 38;

/// Node role as advertised on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Passive,
    Active,
    Simultaneous,
}

impl NodeType {
    fn code(self) -> u8 {
        match self {
            NodeType::Passive => b'p',
            NodeType::Active => b'a',
            NodeType::Simultaneous => b's',
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            b'p' => Ok(NodeType::Passive),
            b'a' => Ok(NodeType::Active),
            b's' => Ok(NodeType::Simultaneous),
            _ => Err(NetError::Protocol(format!("unknown UNL node type code {code:#04x}"))),
        }
    }
}

/// `NatKind` as an on-wire code. The original three-value scheme (random
/// 'm', preserving 'g', reuse 'e') is the last character of the kind's
/// name; `delta` ('a') and `unknown` ('n') extend that same convention,
/// since the wire format predates those two classifications.
fn nat_code(kind: NatKind) -> u8 {
    match kind {
        NatKind::Random => b'm',
        NatKind::Preserving => b'g',
        NatKind::Reuse => b'e',
        NatKind::Delta => b'a',
        NatKind::Unknown => b'n',
    }
}

fn nat_from_code(code: u8) -> Result<NatKind> {
    match code {
        b'm' => Ok(NatKind::Random),
        b'g' => Ok(NatKind::Preserving),
        b'e' => Ok(NatKind::Reuse),
        b'a' => Ok(NatKind::Delta),
        b'n' => Ok(NatKind::Unknown),
        _ => Err(NetError::Protocol(format!("unknown UNL NAT type code {code:#04x}"))),
    }
}

fn forwarding_code(method: ForwardingMethod) -> u8 {
    match method {
        ForwardingMethod::AlreadyForwarded => b'f',
        ForwardingMethod::Manual => b'm',
        ForwardingMethod::Upnp => b'U',
        ForwardingMethod::NatPmp => b'N',
    }
}

fn forwarding_from_code(code: u8) -> Result<ForwardingMethod> {
    match code {
        b'f' => Ok(ForwardingMethod::AlreadyForwarded),
        b'm' => Ok(ForwardingMethod::Manual),
        b'U' => Ok(ForwardingMethod::Upnp),
        b'N' => Ok(ForwardingMethod::NatPmp),
        _ => Err(NetError::Protocol(format!("unknown UNL forwarding type code {code:#04x}"))),
    }
}

/// Fully decoded UNL contents.
///
/// Equality is by `(wan_ip, lan_ip, listen_port)` only, per `spec.md` §3 --
/// two UNLs referring to the same reachable endpoint are equal even if
/// their node id, NAT type, or forwarding type differ across a
/// re-advertisement.
#[derive(Debug, Clone, Copy)]
pub struct UnlFields {
    pub version: u8,
    pub node_id: [u8; 20],
    pub node_type: NodeType,
    pub nat_kind: NatKind,
    pub forwarding: ForwardingMethod,
    pub listen_port: u16,
    pub wan_ip: Ipv4Addr,
    pub lan_ip: Ipv4Addr,
}

impl PartialEq for UnlFields {
    fn eq(&self, other: &Self) -> bool {
        self.wan_ip == other.wan_ip && self.lan_ip == other.lan_ip && self.listen_port == other.listen_port
    }
}

impl UnlFields {
    /// `node_id` used when the caller has no DHT identity to advertise.
    pub const NO_NODE_ID: [u8; 20] = [0u8; 20];
}

fn encode_ip(ip: Ipv4Addr) -> [u8; 4] {
    // The original wire format derives the integer via network-byte-order
    // `ip2int`, then packs that integer little-endian -- net effect, the
    // octets land on the wire reversed. Preserved here for interop.
    u32::from_be_bytes(ip.octets()).to_le_bytes()
}

fn decode_ip(bytes: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::from(u32::from_le_bytes(bytes).to_be_bytes())
}

/// Encode `fields` into a base64 UNL string.
pub fn construct(fields: &UnlFields) -> String {
    let mut buf = [0u8; RECORD_LEN];
    buf[0] = fields.version;
    buf[1..21].copy_from_slice(&fields.node_id);
    buf[21] = fields.node_type.code();
    buf[22] = nat_code(fields.nat_kind);
    buf[23] = forwarding_code(fields.forwarding);
    buf[24..26].copy_from_slice(&fields.listen_port.to_le_bytes());
    buf[26..30].copy_from_slice(&encode_ip(fields.wan_ip));
    buf[30..34].copy_from_slice(&encode_ip(fields.lan_ip));

    let checksum = checksum_of(&buf[0..34]);
    buf[34..38].copy_from_slice(&checksum);

    BASE64.encode(buf)
}

fn checksum_of(body: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(body);
    let second = Sha256::digest(first);
    let mut out = [0u8; 4];
    out.copy_from_slice(&second[0..4]);
    out
}

/// Decode and validate a base64 UNL string.
pub fn deconstruct(encoded: &str) -> Result<UnlFields> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|e| NetError::Protocol(format!("UNL is not valid base64: {e}")))?;

    if raw.len() != RECORD_LEN {
        return Err(NetError::Protocol(format!(
            "UNL record must be {RECORD_LEN} bytes, got {}",
            raw.len()
        )));
    }

    let expected_checksum = checksum_of(&raw[0..34]);
    if raw[34..38] != expected_checksum {
        return Err(NetError::Protocol("UNL checksum mismatch".to_string()));
    }

    let mut node_id = [0u8; 20];
    node_id.copy_from_slice(&raw[1..21]);

    let listen_port = u16::from_le_bytes([raw[24], raw[25]]);
    let wan_ip = decode_ip([raw[26], raw[27], raw[28], raw[29]]);
    let lan_ip = decode_ip([raw[30], raw[31], raw[32], raw[33]]);

    Ok(UnlFields {
        version: raw[0],
        node_id,
        node_type: NodeType::from_code(raw[21])?,
        nat_kind: nat_from_code(raw[22])?,
        forwarding: forwarding_from_code(raw[23])?,
        listen_port,
        wan_ip,
        lan_ip,
    })
}

/// Whether `encoded` decodes to a structurally valid UNL (right length,
/// correct checksum, and only recognized type codes).
pub fn is_valid(encoded: &str) -> bool {
    deconstruct(encoded).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UnlFields {
        UnlFields {
            version: CURRENT_VERSION,
            node_id: UnlFields::NO_NODE_ID,
            node_type: NodeType::Passive,
            nat_kind: NatKind::Preserving,
            forwarding: ForwardingMethod::Upnp,
            listen_port: 40000,
            wan_ip: "203.0.113.5".parse().unwrap(),
            lan_ip: "192.168.1.20".parse().unwrap(),
        }
    }

    #[test]
    fn round_trips_through_construct_and_deconstruct() {
        let fields = sample();
        let encoded = construct(&fields);
        let decoded = deconstruct(&encoded).unwrap();
        assert_eq!(decoded.listen_port, fields.listen_port);
        assert_eq!(decoded.wan_ip, fields.wan_ip);
        assert_eq!(decoded.lan_ip, fields.lan_ip);
        assert_eq!(decoded.node_type, fields.node_type);
        assert_eq!(decoded.nat_kind, fields.nat_kind);
        assert_eq!(decoded.forwarding, fields.forwarding);
    }

    #[test]
    fn tampered_byte_fails_checksum() {
        let encoded = construct(&sample());
        let mut raw = BASE64.decode(&encoded).unwrap();
        raw[24] ^= 0xFF;
        let tampered = BASE64.encode(raw);
        assert!(deconstruct(&tampered).is_err());
        assert!(!is_valid(&tampered));
    }

    #[test]
    fn rejects_wrong_length() {
        let short = BASE64.encode([0u8; 10]);
        assert!(deconstruct(&short).is_err());
    }

    #[test]
    fn rejects_unknown_type_codes() {
        let mut raw = BASE64.decode(construct(&sample())).unwrap();
        raw[21] = b'?';
        // recompute checksum so the failure is specifically about the code
        let checksum = checksum_of(&raw[0..34]);
        raw[34..38].copy_from_slice(&checksum);
        let encoded = BASE64.encode(raw);
        assert!(deconstruct(&encoded).is_err());
    }

    #[test]
    fn equality_ignores_node_id_and_nat_type() {
        let mut a = sample();
        let mut b = sample();
        a.node_id = [1u8; 20];
        b.node_id = [2u8; 20];
        b.nat_kind = NatKind::Random;
        assert_eq!(a, b);
    }

    #[test]
    fn equality_differs_on_listen_port() {
        let a = sample();
        let mut b = sample();
        b.listen_port += 1;
        assert_ne!(a, b);
    }

    #[test]
    fn ip_encoding_round_trips_for_asymmetric_octets() {
        let ip: Ipv4Addr = "1.2.3.4".parse().unwrap();
        assert_eq!(decode_ip(encode_ip(ip)), ip);
    }
}
