//! Line-delimited framed socket with bounded buffers and reply deduplication.

mod seen;
mod socket;

pub use seen::SeenMessages;
pub use socket::FramedSocket;

/// Receive buffer ceiling. An adversarial peer that never sends CRLF cannot
/// make us grow the buffer past this before we give up on the connection.
pub const MAX_BUF: usize = 1024 * 1024;

/// Per-wake chunk cap: at most this many 4 KiB reads are drained from the
/// socket in a single `recv_line`/poll pass, to bound how much adversarial
/// fragmentation can cost us per call.
pub const MAX_CHUNKS: usize = 1024;

/// Size of each read performed while draining the socket.
pub const CHUNK_SIZE: usize = 4096;
