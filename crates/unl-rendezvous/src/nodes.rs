//! Passive/simultaneous node directory used to answer `BOOTSTRAP` and to
//! route `CHALLENGE`/`RECONNECT` notifications to a registered simultaneous
//! node's open connection.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::mpsc::UnboundedSender;
use unl_net::rendezvous::protocol::NodeEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCategory {
    Passive,
    Simultaneous,
}

struct NodeRecord {
    category: NodeCategory,
    port: u16,
    registered_at: Instant,
    /// Set only for `Simultaneous` nodes: the live connection's outbound
    /// channel, used to push `CHALLENGE`/`RECONNECT` asynchronously.
    notify: Option<UnboundedSender<String>>,
}

/// Registered passive/simultaneous nodes, keyed by their observed WAN IP.
pub struct NodeTable {
    table: DashMap<Ipv4Addr, NodeRecord>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self { table: DashMap::new() }
    }

    pub fn register_passive(&self, ip: Ipv4Addr, port: u16) {
        self.table.insert(
            ip,
            NodeRecord {
                category: NodeCategory::Passive,
                port,
                registered_at: Instant::now(),
                notify: None,
            },
        );
    }

    pub fn register_simultaneous(&self, ip: Ipv4Addr, notify: UnboundedSender<String>) {
        self.table.insert(
            ip,
            NodeRecord {
                category: NodeCategory::Simultaneous,
                port: 0,
                registered_at: Instant::now(),
                notify: Some(notify),
            },
        );
    }

    pub fn clear(&self, ip: Ipv4Addr) {
        self.table.remove(&ip);
    }

    /// Whether `ip` is registered as `Simultaneous` and its registration is
    /// still fresh (younger than `challenge_timeout`).
    pub fn is_fresh_simultaneous(&self, ip: Ipv4Addr, challenge_timeout: Duration) -> bool {
        self.table
            .get(&ip)
            .map(|r| r.category == NodeCategory::Simultaneous && r.registered_at.elapsed() < challenge_timeout)
            .unwrap_or(false)
    }

    pub fn is_registered_simultaneous(&self, ip: Ipv4Addr) -> bool {
        self.table.get(&ip).map(|r| r.category == NodeCategory::Simultaneous).unwrap_or(false)
    }

    /// Push a line to a registered simultaneous node's notification channel.
    /// Returns `false` if the node isn't registered or its channel is gone.
    pub fn notify_simultaneous(&self, ip: Ipv4Addr, line: String) -> bool {
        match self.table.get(&ip) {
            Some(record) if record.category == NodeCategory::Simultaneous => {
                record.notify.as_ref().map(|tx| tx.send(line).is_ok()).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Up to `n` random passive nodes, excluding `exclude` and the loopback
    /// address. Simultaneous nodes have no externally-dialable port and are
    /// never handed out as bootstrap candidates.
    pub fn random_sample(&self, n: u8, exclude: Ipv4Addr) -> Vec<NodeEntry> {
        let mut entries: Vec<NodeEntry> = self
            .table
            .iter()
            .filter(|entry| {
                entry.value().category == NodeCategory::Passive
                    && *entry.key() != exclude
                    && !entry.key().is_loopback()
            })
            .map(|entry| NodeEntry {
                passive: true,
                ip: *entry.key(),
                port: entry.value().port,
            })
            .collect();

        let mut rng = rand::thread_rng();
        entries.shuffle(&mut rng);
        entries.truncate(n as usize);
        entries
    }

    /// Drop registrations older than `max_age`. Returns the number dropped.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let before = self.table.len();
        self.table.retain(|_, record| record.registered_at.elapsed() < max_age);
        before - self.table.len()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_sample_excludes_requester_and_loopback() {
        let table = NodeTable::new();
        table.register_passive("203.0.113.1".parse().unwrap(), 40000);
        table.register_passive("127.0.0.1".parse().unwrap(), 40001);
        table.register_passive("203.0.113.2".parse().unwrap(), 40002);

        let sample = table.random_sample(10, "203.0.113.1".parse().unwrap());
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].ip, "203.0.113.2".parse().unwrap());
    }

    #[test]
    fn random_sample_excludes_simultaneous_nodes() {
        let table = NodeTable::new();
        table.register_passive("203.0.113.1".parse().unwrap(), 40000);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        table.register_simultaneous("203.0.113.2".parse().unwrap(), tx);

        let sample = table.random_sample(10, "198.51.100.1".parse().unwrap());
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].ip, "203.0.113.1".parse().unwrap());
    }

    #[test]
    fn sweep_drops_stale_entries() {
        let table = NodeTable::new();
        table.register_passive("203.0.113.1".parse().unwrap(), 40000);
        assert_eq!(table.sweep(Duration::from_secs(0)), 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn notify_simultaneous_requires_registration() {
        let table = NodeTable::new();
        assert!(!table.notify_simultaneous("203.0.113.1".parse().unwrap(), "CHALLENGE".to_string()));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        table.register_simultaneous("203.0.113.1".parse().unwrap(), tx);
        assert!(table.notify_simultaneous("203.0.113.1".parse().unwrap(), "CHALLENGE".to_string()));
        assert_eq!(rx.try_recv().unwrap(), "CHALLENGE");
    }

    #[test]
    fn is_fresh_simultaneous_respects_timeout() {
        let table = NodeTable::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let ip = "203.0.113.1".parse().unwrap();
        table.register_simultaneous(ip, tx);
        assert!(table.is_fresh_simultaneous(ip, Duration::from_secs(60)));
        assert!(!table.is_fresh_simultaneous(ip, Duration::from_secs(0)));
    }
}
