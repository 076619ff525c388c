//! Rendezvous Client: the NAT-facing side of the bootstrap/rendezvous
//! protocol, driven against a single control connection to the server.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use super::protocol::{self, Fight, NodeEntry};
use super::sequential::{connect_from_local_port, sequential_bind};
use crate::error::{NetError, Result};
use crate::framing::FramedSocket;
use crate::nat::{self, NatDescriptor, NAT_TESTS};

/// Server RPC round-trip budget (`spec.md` §5).
const SERVER_RPC_TIMEOUT: Duration = Duration::from_secs(2);
/// Bootstrap-specific reply budget.
const BOOTSTRAP_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
/// Challenge/accept round-trip budget.
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected rendezvous control channel plus the bound sockets a
/// simultaneous-open attempt will race connects against.
pub struct RendezvousClient {
    control: FramedSocket,
    server_addr: SocketAddr,
}

impl RendezvousClient {
    pub async fn connect_to_server(server_addr: SocketAddr) -> Result<Self> {
        let control = FramedSocket::connect(&server_addr.ip().to_string(), server_addr.port()).await?;
        Ok(Self { control, server_addr })
    }

    pub async fn bootstrap(&mut self, n: u8) -> Result<Vec<NodeEntry>> {
        let n = n.clamp(1, 100);
        self.control.send_line(&protocol::encode_bootstrap(n), SERVER_RPC_TIMEOUT).await?;
        let line = self.control.recv_line(BOOTSTRAP_REPLY_TIMEOUT).await?;
        if line.is_empty() {
            return Err(NetError::Timeout);
        }
        protocol::parse_nodes(&line)
    }

    /// Characterize the local NAT by opening `NAT_TESTS` fresh connections
    /// to the rendezvous server and comparing the local and server-observed
    /// source ports.
    pub async fn determine_nat(&mut self) -> Result<NatDescriptor> {
        let mut pairs = Vec::with_capacity(NAT_TESTS);

        for _ in 0..NAT_TESTS {
            let mut probe = FramedSocket::connect(&self.server_addr.ip().to_string(), self.server_addr.port()).await?;
            let local_port = probe
                .local_addr()
                .ok_or_else(|| NetError::NatTraversal("could not read local port of probe socket".to_string()))?
                .port();

            probe
                .send_line(&protocol::encode_source_tcp(local_port), SERVER_RPC_TIMEOUT)
                .await?;
            let line = probe.recv_line(SERVER_RPC_TIMEOUT).await?;
            let remote_port = protocol::parse_remote_tcp(&line)?;
            probe.close().await;

            pairs.push((local_port, remote_port));
        }

        nat::classify(&pairs)
    }

    pub async fn passive_listen(&mut self, port: u16, max_inbound: u32) -> Result<()> {
        self.control
            .send_line(&protocol::encode_passive_ready(port, max_inbound), SERVER_RPC_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Register as a simultaneous node and keep the control connection open
    /// for `CHALLENGE`/`RECONNECT` notifications. Returns the bound
    /// listeners (first is also the control-channel source port) and the
    /// predicted mappings derived from the remaining ports.
    pub async fn simultaneous_listen(&mut self, mapping_no: usize, nat: &NatDescriptor) -> Result<SimultaneousListen> {
        let listeners = sequential_bind(mapping_no + 1).await?;
        let p0 = listeners[0].local_addr()?.port();

        let mut source = connect_from_local_port(p0, self.server_addr).await?;
        send_line_to_stream(&mut source, &protocol::encode_source_tcp(p0)).await?;
        let remote_p0 = protocol::parse_remote_tcp(&recv_line_from_stream(&mut source, SERVER_RPC_TIMEOUT).await?)?;
        drop(source);

        let predicted_ports: Vec<u16> = listeners[1..]
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .filter_map(|addr| nat::predict_port(nat, addr.port()))
            .collect();

        self.control
            .send_line(&protocol::encode_simultaneous_ready(), SERVER_RPC_TIMEOUT)
            .await?;

        Ok(SimultaneousListen {
            listeners,
            observed_source_port: remote_p0,
            predicted_ports,
        })
    }

    /// Announce ourselves as a hole-punch candidate against `target_ip`,
    /// await `PREDICTION SET`, then await the resulting `FIGHT`.
    pub async fn simultaneous_challenge(
        &mut self,
        mapping_no: usize,
        target_ip: Ipv4Addr,
        nat: &NatDescriptor,
    ) -> Result<Option<(Vec<TcpListener>, Fight)>> {
        let listeners = match sequential_bind(mapping_no + 1).await {
            Ok(l) => l,
            Err(_) => return Ok(None),
        };

        let predicted_ports: Vec<u16> = listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .filter_map(|addr| nat::predict_port(nat, addr.port()))
            .collect();

        self.control
            .send_line(&protocol::encode_candidate(target_ip, &predicted_ports), SERVER_RPC_TIMEOUT)
            .await?;

        let ack = self.control.recv_line(CHALLENGE_TIMEOUT).await?;
        if ack != "PREDICTION SET" {
            return Ok(None);
        }

        let line = self.control.recv_line(CHALLENGE_TIMEOUT).await?;
        if line.is_empty() {
            return Ok(None);
        }
        let fight = protocol::parse_fight(&line)?;
        Ok(Some((listeners, fight)))
    }

    pub async fn leave_fight(&mut self) -> Result<()> {
        self.control.send_line(&protocol::encode_clear(), SERVER_RPC_TIMEOUT).await?;
        Ok(())
    }

    pub async fn quit(&mut self) -> Result<()> {
        self.control.send_line(&protocol::encode_quit(), SERVER_RPC_TIMEOUT).await?;
        self.control.close().await;
        Ok(())
    }

    /// The underlying control channel, for the Supervisor to poll for
    /// `CHALLENGE`/`RECONNECT` notifications.
    pub fn control_mut(&mut self) -> &mut FramedSocket {
        &mut self.control
    }
}

pub struct SimultaneousListen {
    pub listeners: Vec<TcpListener>,
    pub observed_source_port: u16,
    pub predicted_ports: Vec<u16>,
}

async fn send_line_to_stream(stream: &mut TcpStream, line: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut buf = Vec::with_capacity(line.len() + 2);
    buf.extend_from_slice(line.as_bytes());
    buf.extend_from_slice(b"\r\n");
    tokio::time::timeout(SERVER_RPC_TIMEOUT, stream.write_all(&buf))
        .await
        .map_err(|_| NetError::Timeout)??;
    Ok(())
}

async fn recv_line_from_stream(stream: &mut TcpStream, timeout: Duration) -> Result<String> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(NetError::Timeout);
        }
        match tokio::time::timeout(remaining, stream.read_exact(&mut byte)).await {
            Ok(Ok(_)) => {
                if byte[0] == b'\n' {
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                    return Ok(String::from_utf8_lossy(&buf).into_owned());
                }
                buf.push(byte[0]);
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(NetError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_fake_server(reply: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut sock = FramedSocket::from_stream(stream);
            let _ = sock.recv_line(Duration::from_secs(1)).await;
            let _ = sock.send_line(reply, Duration::from_secs(1)).await;
        });
        addr
    }

    #[tokio::test]
    async fn bootstrap_parses_nodes_reply() {
        let addr = spawn_fake_server("NODES p:203.0.113.1:40000").await;
        let mut client = RendezvousClient::connect_to_server(addr).await.unwrap();
        let nodes = client.bootstrap(5).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].passive);
    }

    #[tokio::test]
    async fn bootstrap_clamps_n_and_handles_empty() {
        let addr = spawn_fake_server("NODES EMPTY").await;
        let mut client = RendezvousClient::connect_to_server(addr).await.unwrap();
        let nodes = client.bootstrap(0).await.unwrap();
        assert!(nodes.is_empty());
    }

    #[test]
    fn timeout_constants_are_ordered_sensibly() {
        assert!(SERVER_RPC_TIMEOUT <= BOOTSTRAP_REPLY_TIMEOUT);
        assert!(CHALLENGE_TIMEOUT > SERVER_RPC_TIMEOUT);
    }
}
