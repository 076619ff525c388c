//! CLI argument parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "unl-cli")]
#[command(author, version, about = "UNL NAT-traversal client", long_about = None)]
pub struct Cli {
    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Characterize this host's NAT against a rendezvous server
    NatType {
        /// Rendezvous server address, e.g. 203.0.113.1:46882
        rendezvous: String,
    },

    /// Fetch a random sample of other registered nodes
    Bootstrap {
        /// Rendezvous server address
        rendezvous: String,

        /// Number of nodes to request (1-100)
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u8,
    },

    /// Characterize the NAT, register with the rendezvous server, and
    /// serve inbound connections until interrupted
    Listen {
        /// Rendezvous server address
        rendezvous: String,

        /// Local port to bind the passive listener on (0 = any free port)
        #[arg(long, default_value_t = 0)]
        port: u16,

        /// Maximum concurrent inbound connections
        #[arg(long, default_value_t = 8)]
        max_inbound: usize,
    },

    /// Plan and, where the resulting strategy lets us, dial a peer from
    /// their encoded UNL
    Connect {
        /// Rendezvous server address
        rendezvous: String,

        /// The peer's encoded UNL (as printed by `listen`)
        peer_unl: String,

        /// Local port to bind the passive listener on (0 = any free port)
        #[arg(long, default_value_t = 0)]
        port: u16,

        /// Maximum concurrent inbound connections
        #[arg(long, default_value_t = 8)]
        max_inbound: usize,
    },
}
