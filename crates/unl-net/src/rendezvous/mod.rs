//! Rendezvous Client: bootstrap discovery, NAT characterization, and the
//! candidate/fight protocol that drives a simultaneous-open attempt.

mod client;
pub mod protocol;
mod sequential;

pub use client::{RendezvousClient, SimultaneousListen};
pub use sequential::{connect_from_local_port, sequential_bind};
