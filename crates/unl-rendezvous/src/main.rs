//! Rendezvous server: bootstrap directory and candidate/fight broker for
//! TCP simultaneous-open.

mod candidates;
mod cleanup;
mod config;
mod logging;
mod nodes;
mod server;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use config::RendezvousConfig;
use server::ServerState;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "unl-rendezvous")]
#[command(about = "UNL Rendezvous Server", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the rendezvous server
    Serve {
        /// Server bind address, overrides the config file's `bind_addr`
        #[arg(short, long)]
        addr: Option<String>,

        /// Path to a TOML configuration file
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "unl-rendezvous starting");

    match cli.command {
        Commands::Serve { addr, config } => serve(addr, config).await,
    }
}

async fn serve(addr_override: Option<String>, config_path: Option<String>) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            toml::from_str(&raw)?
        }
        None => RendezvousConfig::default(),
    };
    if let Some(addr) = addr_override {
        config.bind_addr = addr;
    }
    config.validate();

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");

    let state = Arc::new(ServerState::new(config));

    tokio::spawn(cleanup::run(state.clone()));

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            server::handle_connection(stream, peer_addr, state).await;
        });
    }
}
