//! Non-blocking, CRLF-delimited framed socket.
//!
//! Mirrors the "line abstraction is atomic" contract: `send_line` always
//! drains fully (looping until every byte including the CRLF is written or
//! the timeout elapses), while reads that would suspend return empty rather
//! than blocking forever. Any socket error other than "would block" closes
//! the socket for good -- subsequent operations become no-ops.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{CHUNK_SIZE, MAX_BUF, MAX_CHUNKS};
use crate::error::{NetError, Result};

const CRLF: &[u8] = b"\r\n";

/// A line-delimited, CRLF-framed TCP socket.
///
/// `reply_filter`, when set, silently drops any popped line that fails the
/// predicate -- used to enforce duplicate-message suppression against a
/// shared [`SeenMessages`](super::SeenMessages) table.
pub struct FramedSocket {
    stream: Option<TcpStream>,
    recv_buf: BytesMut,
    connected: bool,
    reply_filter: Option<Box<dyn FnMut(&[u8]) -> bool + Send>>,
    peer_addr: Option<SocketAddr>,
}

impl FramedSocket {
    /// Wrap an already-established stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            stream: Some(stream),
            recv_buf: BytesMut::new(),
            connected: true,
            reply_filter: None,
            peer_addr,
        }
    }

    /// Connect to `host:port`. On failure the socket is left disconnected.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self::from_stream(stream))
    }

    /// Install a reply filter used to drop duplicate/unwanted lines silently.
    pub fn set_reply_filter<F>(&mut self, filter: F)
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        self.reply_filter = Some(Box::new(filter));
    }

    /// Whether the underlying socket is still usable.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Peer address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Local address of the underlying socket, if connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn mark_closed(&mut self) {
        self.connected = false;
        self.stream = None;
    }

    /// Send raw bytes. When `send_all` is true, loops until every byte is
    /// written; otherwise performs a single write attempt.
    pub async fn send(&mut self, bytes: &[u8], send_all: bool) -> Result<usize> {
        if !self.connected {
            return Ok(0);
        }
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(0),
        };

        if send_all {
            match stream.write_all(bytes).await {
                Ok(()) => Ok(bytes.len()),
                Err(e) if would_block(&e) => Ok(0),
                Err(e) => {
                    self.mark_closed();
                    Err(e.into())
                }
            }
        } else {
            match stream.write(bytes).await {
                Ok(n) => Ok(n),
                Err(e) if would_block(&e) => Ok(0),
                Err(e) => {
                    self.mark_closed();
                    Err(e.into())
                }
            }
        }
    }

    /// Send a CRLF-terminated line. Atomic: retries internally (via
    /// `write_all`) until the whole line is written or `timeout` elapses.
    pub async fn send_line(&mut self, line: &str, timeout: Duration) -> Result<bool> {
        if !self.connected {
            return Ok(false);
        }
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(CRLF);

        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(false),
        };

        match tokio::time::timeout(timeout, stream.write_all(&buf)).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                self.mark_closed();
                Err(e.into())
            }
            Err(_) => Err(NetError::Timeout),
        }
    }

    /// Receive up to `n` bytes. Non-blocking: a read that would suspend
    /// returns an empty vector rather than an error.
    pub async fn recv(&mut self, n: usize) -> Result<Vec<u8>> {
        if !self.connected {
            return Ok(Vec::new());
        }
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };

        let mut buf = vec![0u8; n];
        match stream.try_read(&mut buf) {
            Ok(0) => {
                self.mark_closed();
                Ok(Vec::new())
            }
            Ok(read) => {
                buf.truncate(read);
                Ok(buf)
            }
            Err(e) if would_block(&e) => Ok(Vec::new()),
            Err(e) => {
                self.mark_closed();
                Err(e.into())
            }
        }
    }

    /// Drain up to `MAX_CHUNKS` non-blocking 4 KiB reads into the receive
    /// buffer, bounding how much work an adversarially fragmented peer can
    /// force per call. Returns `true` if the peer closed the connection.
    fn drain_nonblocking(&mut self) -> Result<bool> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(true),
        };

        for _ in 0..MAX_CHUNKS {
            let mut chunk = [0u8; CHUNK_SIZE];
            match stream.try_read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(read) => {
                    if self.recv_buf.len() + read > MAX_BUF {
                        return Err(NetError::Protocol(
                            "receive buffer exceeded max_buf".to_string(),
                        ));
                    }
                    self.recv_buf.extend_from_slice(&chunk[..read]);
                }
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Pop the first complete CRLF-terminated line already buffered, if any,
    /// applying the reply filter.
    fn pop_buffered_line(&mut self) -> Option<Vec<u8>> {
        loop {
            let pos = self
                .recv_buf
                .windows(2)
                .position(|w| w == CRLF)?;
            let line = self.recv_buf[..pos].to_vec();
            self.recv_buf.advance(pos + 2);

            if let Some(filter) = self.reply_filter.as_mut() {
                if !filter(&line) {
                    continue;
                }
            }
            return Some(line);
        }
    }

    /// Receive a single line, blocking (via the supplied timeout) until one
    /// is available or the deadline passes. Returns an empty string on
    /// timeout or disconnect -- callers distinguish via `is_connected()`.
    pub async fn recv_line(&mut self, timeout: Duration) -> Result<String> {
        if let Some(line) = self.pop_buffered_line() {
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        if !self.connected {
            return Ok(String::new());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let closed = self.drain_nonblocking()?;
            if let Some(line) = self.pop_buffered_line() {
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if closed {
                self.mark_closed();
                return Ok(String::new());
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(String::new());
            }

            let stream = match self.stream.as_ref() {
                Some(s) => s,
                None => return Ok(String::new()),
            };
            let wait = std::cmp::min(remaining, Duration::from_millis(100));
            let _ = tokio::time::timeout(wait, stream.readable()).await;
        }
    }

    /// Drain and return every currently-parsable line without waiting for
    /// more data to arrive. Partial (non-CRLF-terminated) data is left in
    /// the buffer for a future call.
    pub fn drain_lines(&mut self) -> Result<Vec<String>> {
        let closed = self.drain_nonblocking()?;
        let mut lines = Vec::new();
        while let Some(line) = self.pop_buffered_line() {
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        if closed {
            self.mark_closed();
        }
        Ok(lines)
    }

    /// Close the socket. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.connected = false;
    }
}

/// Normalizes the platform's "would block"/`WouldBlock` signal. (SSL
/// transports, when present, must funnel their own "no data yet" signal
/// through the same check before reaching this point.)
fn would_block(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (FramedSocket, FramedSocket) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let client = client.await.unwrap();
        (FramedSocket::from_stream(client), FramedSocket::from_stream(server))
    }

    #[tokio::test]
    async fn send_line_round_trip() {
        let (mut a, mut b) = pair().await;
        assert!(a.send_line("BOOTSTRAP 5", Duration::from_secs(1)).await.unwrap());
        let line = b.recv_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "BOOTSTRAP 5");
    }

    #[tokio::test]
    async fn recv_line_times_out_on_partial_line() {
        let (mut a, mut b) = pair().await;
        a.send(b"no terminator yet", false).await.unwrap();
        let line = b.recv_line(Duration::from_millis(200)).await.unwrap();
        assert_eq!(line, "");
        assert!(b.is_connected());
    }

    #[tokio::test]
    async fn drain_lines_yields_multiple_at_once() {
        let (mut a, mut b) = pair().await;
        a.send(b"ONE\r\nTWO\r\nTHREE_PARTIAL", false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let lines = b.drain_lines().unwrap();
        assert_eq!(lines, vec!["ONE".to_string(), "TWO".to_string()]);
    }

    #[tokio::test]
    async fn reply_filter_drops_silently() {
        let (mut a, mut b) = pair().await;
        b.set_reply_filter(|line| line != b"DROP_ME");
        a.send_line("DROP_ME", Duration::from_secs(1)).await.unwrap();
        a.send_line("KEEP_ME", Duration::from_secs(1)).await.unwrap();
        let line = b.recv_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "KEEP_ME");
    }

    #[tokio::test]
    async fn close_marks_disconnected_and_noops() {
        let (mut a, mut b) = pair().await;
        a.close().await;
        drop(a);
        let line = b.recv_line(Duration::from_millis(200)).await.unwrap();
        assert_eq!(line, "");
        assert!(!b.is_connected());
        assert_eq!(b.recv(10).await.unwrap(), Vec::<u8>::new());
    }
}
