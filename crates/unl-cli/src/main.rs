//! UNL NAT-traversal client: characterize a NAT, query the bootstrap
//! directory, or register and serve as a long-lived listening node.

mod cli;
mod exit_codes;
mod logging;
mod probe;

use std::net::SocketAddr;

use clap::Parser;
use cli::{Cli, Commands};
use probe::NullProbe;
use tokio::net::TcpStream;
use unl_net::error::Result;
use unl_net::rendezvous::RendezvousClient;
use unl_net::supervisor::{Supervisor, SupervisorConfig};
use unl_net::traits::{ClockSource, RelayTransport, SystemClock};
use unl_net::unl::{plan_connection, Strategy};

/// No out-of-band relay is wired up by this CLI; `synchronize()` still
/// needs a concrete type to drain against, so this one always reports
/// nothing pending.
struct NoopRelay;

impl RelayTransport for NoopRelay {
    async fn send(&self, _node_id: [u8; 20], _message: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<(Option<[u8; 20]>, Vec<u8>)>> {
        Ok(Vec::new())
    }
}

const SYNC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = logging::init_logging(cli.verbose) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(exit_codes::ERROR);
    }

    let result = match cli.command {
        Commands::NatType { rendezvous } => nat_type(&rendezvous).await,
        Commands::Bootstrap { rendezvous, count } => bootstrap(&rendezvous, count).await,
        Commands::Listen { rendezvous, port, max_inbound } => listen(&rendezvous, port, max_inbound).await,
        Commands::Connect { rendezvous, peer_unl, port, max_inbound } => {
            connect(&rendezvous, &peer_unl, port, max_inbound).await
        }
    };

    match result {
        Ok(()) => std::process::exit(exit_codes::SUCCESS),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            std::process::exit(exit_codes::NETWORK_ERROR);
        }
    }
}

fn parse_rendezvous_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.parse().map_err(|_| anyhow::anyhow!("invalid rendezvous address: {addr}"))
}

async fn nat_type(rendezvous: &str) -> anyhow::Result<()> {
    let addr = parse_rendezvous_addr(rendezvous)?;
    let mut client = RendezvousClient::connect_to_server(addr).await?;
    let nat = client.determine_nat().await?;
    println!("nat kind: {:?}", nat.kind);
    println!("delta: {}", nat.delta);
    println!("predictable: {}", nat.kind.is_predictable());
    Ok(())
}

async fn bootstrap(rendezvous: &str, count: u8) -> anyhow::Result<()> {
    let addr = parse_rendezvous_addr(rendezvous)?;
    let mut client = RendezvousClient::connect_to_server(addr).await?;
    let nodes = client.bootstrap(count).await?;
    if nodes.is_empty() {
        println!("no nodes available");
    }
    for node in nodes {
        println!("{} {}:{}", if node.passive { "passive" } else { "simultaneous" }, node.ip, node.port);
    }
    Ok(())
}

async fn build_supervisor(rendezvous: &str, port: u16, max_inbound: usize) -> anyhow::Result<Supervisor> {
    let addr = parse_rendezvous_addr(rendezvous)?;
    let config = SupervisorConfig {
        passive_port: port,
        max_inbound,
        ..Default::default()
    };

    let supervisor = Supervisor::new(config, addr).await?;
    supervisor.start(&NullProbe).await?;

    match supervisor.local_unl().await {
        Some(unl) => println!("local UNL: {unl}"),
        None => println!("local UNL unavailable"),
    }
    Ok(supervisor)
}

async fn listen(rendezvous: &str, port: u16, max_inbound: usize) -> anyhow::Result<()> {
    let supervisor = build_supervisor(rendezvous, port, max_inbound).await?;
    serve_loop(supervisor).await
}

async fn connect(rendezvous: &str, peer_unl: &str, port: u16, max_inbound: usize) -> anyhow::Result<()> {
    let supervisor = build_supervisor(rendezvous, port, max_inbound).await?;
    let our_unl = supervisor
        .local_unl()
        .await
        .ok_or_else(|| anyhow::anyhow!("cannot plan a connection without our own UNL"))?;

    match plan_connection(&our_unl, peer_unl, false, true)? {
        None => {
            anyhow::bail!("cannot determine master between identical UNLs; refusing to connect to ourselves");
        }
        Some((Strategy::WeConnect, _ours, theirs)) => {
            println!("strategy: we dial them directly");
            let stream = TcpStream::connect((theirs.wan_ip, theirs.listen_port)).await?;
            supervisor.register_pending_handshake(stream, false).await;
        }
        Some((strategy, ..)) => {
            println!(
                "strategy: {strategy:?} -- letting the background sync loop carry this out \
                 (requires the peer to also be registered with the rendezvous server)"
            );
        }
    }

    serve_loop(supervisor).await
}

async fn serve_loop(supervisor: Supervisor) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(SYNC_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = supervisor.synchronize(None::<&NoopRelay>, &SystemClock).await {
                    tracing::warn!(error = %e, "synchronize pass failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                supervisor.stop().await;
                break;
            }
        }
    }
    Ok(())
}
