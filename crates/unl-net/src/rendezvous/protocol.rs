//! Line-protocol commands and replies exchanged with the Rendezvous Server.
//!
//! Bit-exact with the existing wire grammar (`spec.md` §4.D): TCP,
//! line-delimited, one command per line, CRLF-terminated (framing is
//! [`crate::framing::FramedSocket`]'s job; this module only encodes and
//! parses the line bodies).

use std::net::Ipv4Addr;

use crate::error::{NetError, Result};

/// A node entry as returned in a `NODES` reply: `p:ip:port` or `s:ip:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub passive: bool,
    pub ip: Ipv4Addr,
    pub port: u16,
}

pub fn encode_bootstrap(n: u8) -> String {
    format!("BOOTSTRAP {n}")
}

/// Server side of [`encode_bootstrap`]: `BOOTSTRAP <n>`, 1..=100.
pub fn parse_bootstrap(line: &str) -> Result<u8> {
    let n: u32 = line
        .strip_prefix("BOOTSTRAP ")
        .ok_or_else(|| NetError::Protocol(format!("not a BOOTSTRAP command: {line}")))?
        .trim()
        .parse()
        .map_err(|_| NetError::Protocol("malformed BOOTSTRAP count".to_string()))?;

    if n == 0 || n > 100 {
        return Err(NetError::Protocol(format!("BOOTSTRAP count out of range: {n}")));
    }
    Ok(n as u8)
}

/// Server side of [`parse_nodes`]: builds a `NODES ...` reply (or `NODES EMPTY`).
pub fn encode_nodes(entries: &[NodeEntry]) -> String {
    if entries.is_empty() {
        return "NODES EMPTY".to_string();
    }
    let body = entries
        .iter()
        .map(|e| format!("{}:{}:{}", if e.passive { "p" } else { "s" }, e.ip, e.port))
        .collect::<Vec<_>>()
        .join(" ");
    format!("NODES {body}")
}

pub fn parse_nodes(line: &str) -> Result<Vec<NodeEntry>> {
    let rest = line
        .strip_prefix("NODES ")
        .ok_or_else(|| NetError::Protocol(format!("not a NODES reply: {line}")))?;

    if rest == "EMPTY" {
        return Ok(Vec::new());
    }

    rest.split(' ')
        .filter(|e| !e.is_empty())
        .map(parse_node_entry)
        .collect()
}

fn parse_node_entry(entry: &str) -> Result<NodeEntry> {
    let mut parts = entry.splitn(3, ':');
    let category = parts.next().ok_or_else(|| NetError::Protocol("empty node entry".to_string()))?;
    let ip = parts.next().ok_or_else(|| NetError::Protocol("node entry missing ip".to_string()))?;
    let port = parts.next().ok_or_else(|| NetError::Protocol("node entry missing port".to_string()))?;

    let passive = match category {
        "p" => true,
        "s" => false,
        other => return Err(NetError::Protocol(format!("unknown node category {other}"))),
    };

    Ok(NodeEntry {
        passive,
        ip: ip
            .parse()
            .map_err(|_| NetError::Protocol(format!("bad node ip {ip}")))?,
        port: port
            .parse()
            .map_err(|_| NetError::Protocol(format!("bad node port {port}")))?,
    })
}

pub fn encode_source_tcp(port: u16) -> String {
    format!("SOURCE TCP {port}")
}

/// Server side of [`encode_source_tcp`]. The port argument is optional on
/// the wire; a bare `SOURCE TCP` asks the server to just report the
/// observed source port of the current connection.
pub fn parse_source_tcp(line: &str) -> Result<Option<u16>> {
    let rest = line
        .strip_prefix("SOURCE TCP")
        .ok_or_else(|| NetError::Protocol(format!("not a SOURCE TCP command: {line}")))?
        .trim();
    if rest.is_empty() {
        return Ok(None);
    }
    rest.parse()
        .map(Some)
        .map_err(|_| NetError::Protocol("malformed SOURCE TCP port".to_string()))
}

pub fn encode_remote_tcp(port: u16) -> String {
    format!("REMOTE TCP {port}")
}

pub fn parse_remote_tcp(line: &str) -> Result<u16> {
    line.strip_prefix("REMOTE TCP ")
        .ok_or_else(|| NetError::Protocol(format!("not a REMOTE TCP reply: {line}")))?
        .trim()
        .parse()
        .map_err(|_| NetError::Protocol("malformed REMOTE TCP port".to_string()))
}

pub fn encode_passive_ready(port: u16, max_inbound: u32) -> String {
    format!("PASSIVE READY {port} {max_inbound}")
}

/// Server side of [`encode_passive_ready`]: `PASSIVE READY <port> <max_inbound>`.
pub fn parse_passive_ready(line: &str) -> Result<(u16, u32)> {
    let rest = line
        .strip_prefix("PASSIVE READY ")
        .ok_or_else(|| NetError::Protocol(format!("not a PASSIVE READY command: {line}")))?;
    let mut parts = rest.split_whitespace();
    let port: u16 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| NetError::Protocol("malformed PASSIVE READY port".to_string()))?;
    let max_inbound: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| NetError::Protocol("malformed PASSIVE READY max_inbound".to_string()))?;
    Ok((port, max_inbound))
}

pub fn encode_simultaneous_ready() -> String {
    "SIMULTANEOUS READY 0 0".to_string()
}

/// Server side of [`encode_simultaneous_ready`]. The two fields are
/// reserved and always `0 0` on the wire; only the command name matters.
pub fn parse_simultaneous_ready(line: &str) -> Result<()> {
    if line.starts_with("SIMULTANEOUS READY") {
        Ok(())
    } else {
        Err(NetError::Protocol(format!("not a SIMULTANEOUS READY command: {line}")))
    }
}

pub fn encode_candidate(target_ip: Ipv4Addr, predictions: &[u16]) -> String {
    let ports = predictions.iter().map(u16::to_string).collect::<Vec<_>>().join(" ");
    format!("CANDIDATE {target_ip} TCP {ports}")
}

/// Server side of [`encode_candidate`]: `CANDIDATE <target_ip> TCP <p1 p2 ...>`.
pub fn parse_candidate(line: &str) -> Result<(Ipv4Addr, Vec<u16>)> {
    let rest = line
        .strip_prefix("CANDIDATE ")
        .ok_or_else(|| NetError::Protocol(format!("not a CANDIDATE command: {line}")))?;
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() < 2 || tokens[1] != "TCP" {
        return Err(NetError::Protocol(format!("malformed CANDIDATE command: {line}")));
    }
    let target_ip: Ipv4Addr = tokens[0]
        .parse()
        .map_err(|_| NetError::Protocol("malformed CANDIDATE target ip".to_string()))?;
    let predictions = tokens[2..]
        .iter()
        .map(|p| p.parse::<u16>().map_err(|_| NetError::Protocol("malformed CANDIDATE prediction port".to_string())))
        .collect::<Result<Vec<_>>>()?;
    Ok((target_ip, predictions))
}

pub fn encode_prediction_set() -> String {
    "PREDICTION SET".to_string()
}

pub fn encode_accept(candidate_ip: Ipv4Addr, predictions: &[u16], ntp_time: f64) -> String {
    let ports = predictions.iter().map(u16::to_string).collect::<Vec<_>>().join(" ");
    format!("ACCEPT {candidate_ip} {ports} TCP {ntp_time}")
}

/// Server side of [`encode_accept`]: `ACCEPT <candidate_ip> <p1 p2 ...> TCP <ntp_time>`.
pub fn parse_accept(line: &str) -> Result<(Ipv4Addr, Vec<u16>, f64)> {
    let rest = line
        .strip_prefix("ACCEPT ")
        .ok_or_else(|| NetError::Protocol(format!("not an ACCEPT command: {line}")))?;
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() < 3 || tokens[tokens.len() - 2] != "TCP" {
        return Err(NetError::Protocol(format!("malformed ACCEPT command: {line}")));
    }
    let candidate_ip: Ipv4Addr = tokens[0]
        .parse()
        .map_err(|_| NetError::Protocol("malformed ACCEPT candidate ip".to_string()))?;
    let ntp_time: f64 = tokens[tokens.len() - 1]
        .parse()
        .map_err(|_| NetError::Protocol("malformed ACCEPT ntp_time".to_string()))?;
    let predictions = tokens[1..tokens.len() - 2]
        .iter()
        .map(|p| p.parse::<u16>().map_err(|_| NetError::Protocol("malformed ACCEPT prediction port".to_string())))
        .collect::<Result<Vec<_>>>()?;
    Ok((candidate_ip, predictions, ntp_time))
}

pub fn encode_clear() -> String {
    "CLEAR".to_string()
}

pub fn encode_quit() -> String {
    "QUIT".to_string()
}

pub fn encode_reconnect() -> String {
    "RECONNECT".to_string()
}

pub fn encode_fight(meeting_time: f64, acceptor_ip: Ipv4Addr, predictions: &[u16]) -> String {
    let ports = predictions.iter().map(u16::to_string).collect::<Vec<_>>().join(" ");
    format!("FIGHT {meeting_time} {acceptor_ip} {ports} TCP {meeting_time}")
}

pub fn encode_challenge(candidate_ip: Ipv4Addr, predictions: &[u16]) -> String {
    let ports = predictions.iter().map(u16::to_string).collect::<Vec<_>>().join(" ");
    format!("CHALLENGE {candidate_ip} {ports} TCP")
}

/// A `FIGHT` notification: `FIGHT <ntp_time> <acceptor_ip> <p1 p2 ...> TCP <ntp_time>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fight {
    pub meeting_time: f64,
    pub acceptor_ip: Ipv4Addr,
    pub predictions: Vec<u16>,
}

pub fn parse_fight(line: &str) -> Result<Fight> {
    let rest = line
        .strip_prefix("FIGHT ")
        .ok_or_else(|| NetError::Protocol(format!("not a FIGHT message: {line}")))?;

    let tokens: Vec<&str> = rest.split(' ').filter(|t| !t.is_empty()).collect();
    if tokens.len() < 4 || tokens[tokens.len() - 2] != "TCP" {
        return Err(NetError::Protocol(format!("malformed FIGHT message: {line}")));
    }

    let meeting_time: f64 = tokens[0]
        .parse()
        .map_err(|_| NetError::Protocol("malformed FIGHT meeting time".to_string()))?;
    let acceptor_ip: Ipv4Addr = tokens[1]
        .parse()
        .map_err(|_| NetError::Protocol("malformed FIGHT acceptor ip".to_string()))?;
    let predictions = tokens[2..tokens.len() - 2]
        .iter()
        .map(|p| p.parse::<u16>().map_err(|_| NetError::Protocol("malformed FIGHT prediction port".to_string())))
        .collect::<Result<Vec<_>>>()?;

    Ok(Fight {
        meeting_time,
        acceptor_ip,
        predictions,
    })
}

/// A `CHALLENGE <candidate_ip> <p1 p2 ...> <proto>` notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub candidate_ip: Ipv4Addr,
    pub predictions: Vec<u16>,
    pub proto: String,
}

pub fn parse_challenge(line: &str) -> Result<Challenge> {
    let rest = line
        .strip_prefix("CHALLENGE ")
        .ok_or_else(|| NetError::Protocol(format!("not a CHALLENGE message: {line}")))?;
    let tokens: Vec<&str> = rest.split(' ').filter(|t| !t.is_empty()).collect();
    if tokens.len() < 2 {
        return Err(NetError::Protocol(format!("malformed CHALLENGE message: {line}")));
    }

    let candidate_ip: Ipv4Addr = tokens[0]
        .parse()
        .map_err(|_| NetError::Protocol("malformed CHALLENGE ip".to_string()))?;
    let proto = tokens[tokens.len() - 1].to_string();
    let predictions = tokens[1..tokens.len() - 1]
        .iter()
        .map(|p| p.parse::<u16>().map_err(|_| NetError::Protocol("malformed CHALLENGE port".to_string())))
        .collect::<Result<Vec<_>>>()?;

    Ok(Challenge {
        candidate_ip,
        predictions,
        proto,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nodes_reply_with_mixed_categories() {
        let nodes = parse_nodes("NODES p:203.0.113.1:40000 s:203.0.113.2:40001").unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].passive);
        assert!(!nodes[1].passive);
    }

    #[test]
    fn parses_empty_nodes_reply() {
        assert_eq!(parse_nodes("NODES EMPTY").unwrap(), Vec::new());
    }

    #[test]
    fn parses_remote_tcp_reply() {
        assert_eq!(parse_remote_tcp("REMOTE TCP 41234").unwrap(), 41234);
    }

    #[test]
    fn rejects_malformed_remote_tcp() {
        assert!(parse_remote_tcp("REMOTE TCP not-a-port").is_err());
    }

    #[test]
    fn encodes_candidate_with_multiple_predictions() {
        let line = encode_candidate("203.0.113.5".parse().unwrap(), &[40000, 40001]);
        assert_eq!(line, "CANDIDATE 203.0.113.5 TCP 40000 40001");
    }

    #[test]
    fn parses_fight_message() {
        let fight = parse_fight("FIGHT 1700000000.5 203.0.113.5 40000 40001 TCP 1700000000.5").unwrap();
        assert_eq!(fight.acceptor_ip, "203.0.113.5".parse().unwrap());
        assert_eq!(fight.predictions, vec![40000, 40001]);
    }

    #[test]
    fn parses_challenge_message() {
        let challenge = parse_challenge("CHALLENGE 203.0.113.5 40000 40001 TCP").unwrap();
        assert_eq!(challenge.candidate_ip, "203.0.113.5".parse().unwrap());
        assert_eq!(challenge.proto, "TCP");
        assert_eq!(challenge.predictions, vec![40000, 40001]);
    }

    #[test]
    fn parses_bootstrap_count_in_range() {
        assert_eq!(parse_bootstrap("BOOTSTRAP 10").unwrap(), 10);
        assert!(parse_bootstrap("BOOTSTRAP 0").is_err());
        assert!(parse_bootstrap("BOOTSTRAP 101").is_err());
    }

    #[test]
    fn encodes_nodes_reply_round_trips_through_parse() {
        let entries = vec![
            NodeEntry { passive: true, ip: "203.0.113.1".parse().unwrap(), port: 40000 },
            NodeEntry { passive: false, ip: "203.0.113.2".parse().unwrap(), port: 40001 },
        ];
        let line = encode_nodes(&entries);
        assert_eq!(parse_nodes(&line).unwrap(), entries);
        assert_eq!(encode_nodes(&[]), "NODES EMPTY");
    }

    #[test]
    fn parses_source_tcp_with_and_without_port() {
        assert_eq!(parse_source_tcp("SOURCE TCP").unwrap(), None);
        assert_eq!(parse_source_tcp("SOURCE TCP 41234").unwrap(), Some(41234));
    }

    #[test]
    fn parses_passive_ready_fields() {
        assert_eq!(parse_passive_ready("PASSIVE READY 41234 8").unwrap(), (41234, 8));
    }

    #[test]
    fn parses_candidate_command() {
        let (target, ports) = parse_candidate("CANDIDATE 203.0.113.5 TCP 40000 40001").unwrap();
        assert_eq!(target, "203.0.113.5".parse().unwrap());
        assert_eq!(ports, vec![40000, 40001]);
    }

    #[test]
    fn parses_accept_command() {
        let (ip, ports, ntp) = parse_accept("ACCEPT 203.0.113.5 40000 40001 TCP 1700000000.5").unwrap();
        assert_eq!(ip, "203.0.113.5".parse().unwrap());
        assert_eq!(ports, vec![40000, 40001]);
        assert_eq!(ntp, 1700000000.5);
    }

    #[test]
    fn encodes_fight_and_challenge_messages() {
        let ip = "203.0.113.5".parse().unwrap();
        assert_eq!(encode_fight(1.5, ip, &[1, 2]), "FIGHT 1.5 203.0.113.5 1 2 TCP 1.5");
        assert_eq!(encode_challenge(ip, &[1, 2]), "CHALLENGE 203.0.113.5 1 2 TCP");
    }
}
