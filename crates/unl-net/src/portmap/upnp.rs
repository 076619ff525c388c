//! UPnP/IGD port mapping.
//!
//! Uses `igd-next` for gateway discovery (SSDP M-SEARCH to
//! 239.255.255.250:1900) and the `AddPortMapping` SOAP call. When discovery
//! finds nothing within `reply_wait`, falls back to probing a short list of
//! well-known ports on the default gateway for a UPnP description document
//! before giving up, matching routers that answer HTTP directly but are
//! slow or unreliable over multicast.
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{ForwardedPort, ForwardingMethod};
use crate::error::{NetError, Result};

/// How long to wait for an SSDP M-SEARCH reply before falling back.
const REPLY_WAIT: Duration = Duration::from_secs(3);

/// Well-known ports routers sometimes serve a UPnP description document on
/// when SSDP discovery is unreliable.
const FALLBACK_PORTS: &[u16] = &[1900, 5000, 49152, 2869, 8080];

pub async fn forward(
    internal_addr: SocketAddr,
    external_port: u16,
    description: &str,
) -> Result<ForwardedPort> {
    let gateway = match tokio::time::timeout(REPLY_WAIT, igd_next::aio::tokio::search_gateway(Default::default())).await {
        Ok(Ok(gateway)) => gateway,
        Ok(Err(e)) => {
            if !probe_fallback_ports(internal_addr).await {
                return Err(NetError::PortMapping(format!("UPnP gateway not found: {e}")));
            }
            // A device answered on a well-known port but igd-next's SSDP
            // discovery still failed to produce a usable gateway handle;
            // there is nothing further we can do without re-implementing
            // its SOAP client, so surface the original error.
            return Err(NetError::PortMapping(format!(
                "UPnP device responded on a fallback port but gateway discovery failed: {e}"
            )));
        }
        Err(_) => {
            return Err(NetError::PortMapping(
                "UPnP discovery timed out waiting for an SSDP reply".to_string(),
            ));
        }
    };

    gateway
        .add_port(
            igd_next::PortMappingProtocol::TCP,
            external_port,
            internal_addr,
            0,
            description,
        )
        .await
        .map_err(|e| NetError::PortMapping(format!("UPnP AddPortMapping failed: {e}")))?;

    let external_ip = gateway
        .get_external_ip()
        .await
        .map_err(|e| NetError::PortMapping(format!("failed to read external IP: {e}")))?;

    Ok(ForwardedPort {
        external_addr: SocketAddr::new(external_ip, external_port),
        method: ForwardingMethod::Upnp,
    })
}

/// Remove a previously installed mapping.
pub async fn unforward(external_port: u16) -> Result<()> {
    let gateway = igd_next::aio::tokio::search_gateway(Default::default())
        .await
        .map_err(|e| NetError::PortMapping(format!("UPnP gateway not found: {e}")))?;

    gateway
        .remove_port(igd_next::PortMappingProtocol::TCP, external_port)
        .await
        .map_err(|e| NetError::PortMapping(format!("UPnP RemovePortMapping failed: {e}")))?;

    Ok(())
}

/// Probe the default gateway's IP on a short list of well-known ports for a
/// UPnP device description, returning whether anything answered. Used only
/// to decide whether to report a "nothing there at all" vs. "something is
/// there but igd-next couldn't use it" error.
async fn probe_fallback_ports(internal_addr: SocketAddr) -> bool {
    let gateway_ip = match default_gateway_guess(internal_addr) {
        Some(ip) => ip,
        None => return false,
    };

    for &port in FALLBACK_PORTS {
        if probe_description_xml(gateway_ip, port).await {
            return true;
        }
    }
    false
}

fn default_gateway_guess(internal_addr: SocketAddr) -> Option<std::net::IpAddr> {
    match internal_addr.ip() {
        std::net::IpAddr::V4(v4) => {
            let o = v4.octets();
            Some(std::net::IpAddr::V4(std::net::Ipv4Addr::new(o[0], o[1], o[2], 1)))
        }
        std::net::IpAddr::V6(_) => None,
    }
}

async fn probe_description_xml(ip: std::net::IpAddr, port: u16) -> bool {
    let addr = SocketAddr::new(ip, port);
    let connect = tokio::time::timeout(Duration::from_millis(500), TcpStream::connect(addr));
    let mut stream = match connect.await {
        Ok(Ok(s)) => s,
        _ => return false,
    };

    let request = format!("GET /description.xml HTTP/1.1\r\nHost: {ip}:{port}\r\nConnection: close\r\n\r\n");
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let mut body = Vec::new();
    let read = tokio::time::timeout(Duration::from_millis(500), stream.read_to_end(&mut body)).await;
    if read.is_err() {
        return false;
    }

    String::from_utf8_lossy(&body).contains("InternetGatewayDevice")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_guess_uses_dot_one_for_ipv4() {
        let addr: SocketAddr = "192.168.1.42:0".parse().unwrap();
        assert_eq!(default_gateway_guess(addr), Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn default_gateway_guess_none_for_ipv6() {
        let addr: SocketAddr = "[::1]:0".parse().unwrap();
        assert_eq!(default_gateway_guess(addr), None);
    }
}
