//! `SO_REUSEADDR` plumbing: binding a batch of consecutive local ports each
//! of which must later double as both an outbound connect source and an
//! accept target (the mechanism the Simultaneous-Open Engine depends on).

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{NetError, Result};

/// Bind `n` sockets to `n` consecutive local ports, retrying the whole
/// batch (unbounded, per `spec.md` §5's timeout table) from a fresh random
/// base port whenever any single bind in the run fails.
pub async fn sequential_bind(n: usize) -> Result<Vec<TcpListener>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    loop {
        if let Some(listeners) = try_bind_batch(n).await {
            return Ok(listeners);
        }
    }
}

async fn try_bind_batch(n: usize) -> Option<Vec<TcpListener>> {
    let base = random_base_port(n);
    let mut listeners = Vec::with_capacity(n);

    for offset in 0..n as u16 {
        let port = base + offset;
        if !port_is_free(port).await {
            return None;
        }
        match bind_reuseaddr_listener(port) {
            Ok(listener) => listeners.push(listener),
            Err(_) => return None,
        }
    }

    Some(listeners)
}

fn random_base_port(n: usize) -> u16 {
    let upper = 65535u32 - n as u32;
    rand::thread_rng().gen_range(1024..=upper) as u16
}

/// Probe whether `port` is already bound locally by attempting a quick
/// connect to it; a refused/failed connect means the port is free.
async fn port_is_free(port: u16) -> bool {
    let addr = format!("127.0.0.1:{port}");
    !matches!(
        tokio::time::timeout(Duration::from_millis(150), TcpStream::connect(&addr)).await,
        Ok(Ok(_))
    )
}

fn bind_reuseaddr_listener(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("valid loopback addr");
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Open an outbound connection to `target`, sourced from `local_port` via a
/// second `SO_REUSEADDR` socket distinct from the listener already bound to
/// that port -- this is how one local port serves as both connect-source
/// and accept-target.
pub async fn connect_from_local_port(local_port: u16, target: SocketAddr) -> Result<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetError::NatTraversal(format!("failed to create source socket: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NetError::NatTraversal(format!("failed to set SO_REUSEADDR: {e}")))?;
    let local: SocketAddr = format!("0.0.0.0:{local_port}").parse().expect("valid bind addr");
    socket
        .bind(&local.into())
        .map_err(|e| NetError::NatTraversal(format!("failed to bind source port {local_port}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetError::NatTraversal(format!("failed to set nonblocking: {e}")))?;

    match socket.connect(&target.into()) {
        Ok(()) => {}
        Err(e) if is_connect_in_progress(&e) => {}
        Err(e) => return Err(NetError::NatTraversal(format!("connect from port {local_port} failed: {e}"))),
    }

    let stream = TcpStream::from_std(socket.into())?;
    stream.writable().await?;
    if let Some(err) = stream.take_error()? {
        return Err(NetError::NatTraversal(format!("connect from port {local_port} failed: {err}")));
    }
    Ok(stream)
}

/// A nonblocking `connect()` reports "in progress" as `EINPROGRESS`, which
/// is a distinct errno from `EWOULDBLOCK`/`EAGAIN` and is not uniformly
/// mapped to `ErrorKind::WouldBlock` across platforms, so both are checked.
fn is_connect_in_progress(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc_like_einprogress())
}

/// `EINPROGRESS` on Linux/most Unix targets. Windows reports `WSAEWOULDBLOCK`
/// instead, which already maps to `ErrorKind::WouldBlock` above.
const fn libc_like_einprogress() -> i32 {
    115
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_base_port_leaves_room_for_n_consecutive_ports() {
        let base = random_base_port(5);
        assert!(base as u32 + 5 <= 65535);
        assert!(base >= 1024);
    }

    #[tokio::test]
    async fn sequential_bind_returns_n_consecutive_listeners() {
        let listeners = sequential_bind(3).await.unwrap();
        assert_eq!(listeners.len(), 3);
        let ports: Vec<u16> = listeners.iter().map(|l| l.local_addr().unwrap().port()).collect();
        assert_eq!(ports[1], ports[0] + 1);
        assert_eq!(ports[2], ports[0] + 2);
    }

    #[tokio::test]
    async fn port_is_free_reports_true_for_unbound_port() {
        // Bind nothing; an arbitrary high port should read as free.
        assert!(port_is_free(59123).await);
    }
}
