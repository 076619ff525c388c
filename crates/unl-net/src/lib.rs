//! NAT traversal and rendezvous networking for peer-to-peer TCP connections
//!
//! Provides NAT characterization and port prediction, the Universal Node
//! Locator wire format and connection orchestrator, a TCP simultaneous-open
//! engine, a rendezvous client/protocol, UPnP/NAT-PMP port mapping, and the
//! Network Supervisor that ties them together.

#![forbid(unsafe_code)]

pub mod error;
pub mod framing;
pub mod nat;
pub mod portmap;
pub mod rendezvous;
pub mod simopen;
pub mod supervisor;
pub mod traits;
pub mod unl;

// Re-exports
pub use error::NetError;
pub use supervisor::Supervisor;

/// Result type for network operations.
pub type Result<T> = std::result::Result<T, NetError>;
