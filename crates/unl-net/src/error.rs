//! Network error types

use std::fmt;

/// Errors produced by the NAT traversal and rendezvous subsystems.
#[derive(Debug)]
pub enum NetError {
    /// A connection attempt failed outright (refused, reset, unreachable).
    ConnectionFailed(String),
    /// An operation exceeded its allotted time.
    Timeout,
    /// A line, command, or wire record violated the protocol grammar.
    Protocol(String),
    /// NAT traversal (characterization, prediction, simultaneous-open) failed.
    NatTraversal(String),
    /// The rendezvous server rejected or could not service a request.
    Rendezvous(String),
    /// A port-mapping (UPnP/NAT-PMP) request failed.
    PortMapping(String),
    /// An operation was requested that the current configuration cannot
    /// satisfy (e.g. simultaneous-open demanded on a non-predictable NAT).
    Configuration(String),
    /// Every available traversal strategy was exhausted without success.
    TraversalExhausted(String),
    /// Underlying I/O error.
    Io(std::io::Error),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "connection failed: {}", msg),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Self::NatTraversal(msg) => write!(f, "NAT traversal failed: {}", msg),
            Self::Rendezvous(msg) => write!(f, "rendezvous error: {}", msg),
            Self::PortMapping(msg) => write!(f, "port mapping failed: {}", msg),
            Self::Configuration(msg) => write!(f, "configuration error: {}", msg),
            Self::TraversalExhausted(msg) => write!(f, "no connection: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for NetError {}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, NetError>;
