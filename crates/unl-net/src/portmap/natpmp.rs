//! NAT-PMP (RFC 6886) port mapping.
//!
//! No crate in the dependency graph speaks NAT-PMP, and the protocol is a
//! dozen fixed-width bytes over UDP, so it is hand-rolled here the same way
//! the wire-format modules elsewhere in this crate are -- small, well-known
//! binary protocols are implemented directly rather than pulled in as a
//! dependency.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use super::{ForwardedPort, ForwardingMethod};
use crate::error::{NetError, Result};

const NATPMP_PORT: u16 = 5351;
const OPCODE_EXTERNAL_ADDRESS: u8 = 0;
const OPCODE_MAP_TCP: u8 = 2;
/// Requested mapping lifetime, in seconds. NAT-PMP clients are expected to
/// renew well before this elapses; renewal is the Supervisor's job.
const MAPPING_LIFETIME_SECS: u32 = 7200;

const INITIAL_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_ATTEMPTS: u32 = 4;

pub async fn forward(internal_addr: SocketAddr, external_port: u16) -> Result<ForwardedPort> {
    let gateway_ip = default_gateway_guess(internal_addr)
        .ok_or_else(|| NetError::PortMapping("cannot guess default gateway for IPv6".to_string()))?;
    let gateway = SocketAddr::new(gateway_ip, NATPMP_PORT);

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| NetError::PortMapping(format!("failed to bind NAT-PMP socket: {e}")))?;
    socket
        .connect(gateway)
        .await
        .map_err(|e| NetError::PortMapping(format!("failed to reach gateway: {e}")))?;

    let external_ip = request_external_address(&socket).await?;
    let mapped_port = request_mapping(&socket, internal_addr.port(), external_port).await?;

    Ok(ForwardedPort {
        external_addr: SocketAddr::new(external_ip, mapped_port),
        method: ForwardingMethod::NatPmp,
    })
}

async fn request_external_address(socket: &UdpSocket) -> Result<IpAddr> {
    let request = [0u8, OPCODE_EXTERNAL_ADDRESS];
    let response = send_with_retry(socket, &request, 12).await?;

    if response[1] != 0x80 | OPCODE_EXTERNAL_ADDRESS {
        return Err(NetError::PortMapping("unexpected NAT-PMP opcode in response".to_string()));
    }
    check_result_code(&response)?;

    Ok(IpAddr::V4(Ipv4Addr::new(
        response[8],
        response[9],
        response[10],
        response[11],
    )))
}

async fn request_mapping(socket: &UdpSocket, internal_port: u16, external_port: u16) -> Result<u16> {
    let mut request = [0u8; 12];
    request[0] = 0;
    request[1] = OPCODE_MAP_TCP;
    request[4..6].copy_from_slice(&internal_port.to_be_bytes());
    request[6..8].copy_from_slice(&external_port.to_be_bytes());
    request[8..12].copy_from_slice(&MAPPING_LIFETIME_SECS.to_be_bytes());

    let response = send_with_retry(socket, &request, 16).await?;

    if response[1] != 0x80 | OPCODE_MAP_TCP {
        return Err(NetError::PortMapping("unexpected NAT-PMP opcode in response".to_string()));
    }
    check_result_code(&response)?;

    Ok(u16::from_be_bytes([response[10], response[11]]))
}

fn check_result_code(response: &[u8]) -> Result<()> {
    let result_code = u16::from_be_bytes([response[2], response[3]]);
    if result_code != 0 {
        return Err(NetError::PortMapping(format!(
            "NAT-PMP request refused with result code {result_code}"
        )));
    }
    Ok(())
}

/// Send `request`, retrying with exponentially doubling timeouts per RFC
/// 6886 §3.1, up to `MAX_ATTEMPTS`. Fails fast and recognizably when the
/// gateway never answers (the common case on a router that doesn't speak
/// NAT-PMP at all).
async fn send_with_retry(socket: &UdpSocket, request: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut timeout = INITIAL_TIMEOUT;
    let mut last_err = None;

    for _ in 0..MAX_ATTEMPTS {
        socket
            .send(request)
            .await
            .map_err(|e| NetError::PortMapping(format!("failed to send NAT-PMP request: {e}")))?;

        let mut buf = vec![0u8; expected_len.max(16)];
        match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
            Ok(Ok(n)) if n >= expected_len => {
                buf.truncate(n);
                return Ok(buf);
            }
            Ok(Ok(_)) => {
                last_err = Some(NetError::PortMapping("NAT-PMP response truncated".to_string()));
            }
            Ok(Err(e)) => last_err = Some(NetError::PortMapping(format!("NAT-PMP recv failed: {e}"))),
            Err(_) => last_err = Some(NetError::PortMapping("NAT-PMP gateway did not respond".to_string())),
        }
        timeout *= 2;
    }

    Err(last_err.unwrap_or_else(|| NetError::PortMapping("NAT-PMP exhausted retries".to_string())))
}

fn default_gateway_guess(internal_addr: SocketAddr) -> Option<IpAddr> {
    match internal_addr.ip() {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            Some(IpAddr::V4(Ipv4Addr::new(o[0], o[1], o[2], 1)))
        }
        IpAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_result_code_accepts_zero() {
        let mut response = [0u8; 16];
        response[2] = 0;
        response[3] = 0;
        assert!(check_result_code(&response).is_ok());
    }

    #[test]
    fn check_result_code_rejects_nonzero() {
        let mut response = [0u8; 16];
        response[3] = 3; // "network failure"
        assert!(check_result_code(&response).is_err());
    }

    #[tokio::test]
    async fn send_with_retry_fails_fast_when_nothing_listens() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Port 1 is reserved and nothing answers NAT-PMP there; this should
        // exhaust retries rather than hang.
        socket.connect("127.0.0.1:1").await.unwrap();
        let result = send_with_retry(&socket, &[0, OPCODE_EXTERNAL_ADDRESS], 12).await;
        assert!(result.is_err());
    }
}
