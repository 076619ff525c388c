//! Process-wide-shaped, but explicitly owned, seen-messages table.
//!
//! Deduplicates retransmitted replies: a line is "old" once it has been
//! observed `max_retransmissions` times, or was last seen less than
//! `min_retransmit_interval` ago.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

/// Maximum times a line may be retransmitted before being treated as old.
pub const MAX_RETRANSMISSIONS: u32 = 1;

/// Minimum gap between retransmissions of the same line before it is
/// considered fresh again.
pub const MIN_RETRANSMIT_INTERVAL: Duration = Duration::from_secs(5);

struct SeenEntry {
    count: u32,
    last_seen: Instant,
}

/// Tracks fingerprints of recently-seen lines for duplicate suppression.
///
/// Owned explicitly by whichever component needs deduplication (the
/// Supervisor, per `spec.md` §3) rather than living as process-wide global
/// state.
#[derive(Default)]
pub struct SeenMessages {
    table: DashMap<[u8; 32], SeenEntry>,
}

impl SeenMessages {
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    fn fingerprint(line: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(line);
        hasher.finalize().into()
    }

    /// Record an observation of `line` and report whether it was already
    /// old (a duplicate that should be dropped) at the time of this call.
    pub fn observe(&self, line: &[u8]) -> bool {
        let fp = Self::fingerprint(line);
        let now = Instant::now();

        let mut entry = self.table.entry(fp).or_insert_with(|| SeenEntry {
            count: 0,
            last_seen: now,
        });

        let is_old = entry.count > 0
            && (entry.count >= MAX_RETRANSMISSIONS
                || now.duration_since(entry.last_seen) < MIN_RETRANSMIT_INTERVAL);

        entry.count += 1;
        entry.last_seen = now;

        is_old
    }

    /// Build a reply filter closure suitable for `FramedSocket::
    /// set_reply_filter`: returns `false` (drop) for lines that are old.
    pub fn as_filter(self: &std::sync::Arc<Self>) -> impl FnMut(&[u8]) -> bool + Send + 'static {
        let table = std::sync::Arc::clone(self);
        move |line: &[u8]| !table.observe(line)
    }

    /// Number of distinct fingerprints currently tracked.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_is_fresh() {
        let seen = SeenMessages::new();
        assert!(!seen.observe(b"hello"));
    }

    #[test]
    fn immediate_repeat_is_old() {
        let seen = SeenMessages::new();
        assert!(!seen.observe(b"hello"));
        assert!(seen.observe(b"hello"));
    }

    #[test]
    fn distinct_payloads_are_independent() {
        let seen = SeenMessages::new();
        assert!(!seen.observe(b"one"));
        assert!(!seen.observe(b"two"));
    }
}
