//! Per-target candidate queues for TCP simultaneous-open brokering.
//!
//! A `CANDIDATE` registers a node's predicted source ports against a
//! `target_ip`; once the target's simultaneous node is known to be
//! connected and fresh, the candidate is handed to it as a `CHALLENGE`.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Clone)]
pub struct Candidate {
    pub candidate_ip: Ipv4Addr,
    pub predictions: Vec<u16>,
    pub registered_at: Instant,
    pub propagated: bool,
    /// Notification channel of the connection that registered this
    /// candidate, used to deliver the eventual `FIGHT`.
    notify: UnboundedSender<String>,
}

/// Outcome of registering a new candidate.
pub enum RegisterOutcome {
    Registered,
    TargetFull,
}

/// Candidates queued against each `target_ip`.
pub struct CandidateTable {
    table: DashMap<Ipv4Addr, Vec<Candidate>>,
}

impl CandidateTable {
    pub fn new() -> Self {
        Self { table: DashMap::new() }
    }

    /// Register (or atomically replace) the candidate entry for
    /// `candidate_ip` against `target_ip`.
    pub fn register(
        &self,
        target_ip: Ipv4Addr,
        candidate_ip: Ipv4Addr,
        predictions: Vec<u16>,
        notify: UnboundedSender<String>,
        max_candidates: usize,
    ) -> RegisterOutcome {
        let mut bucket = self.table.entry(target_ip).or_default();
        if let Some(existing) = bucket.iter_mut().find(|c| c.candidate_ip == candidate_ip) {
            existing.predictions = predictions;
            existing.registered_at = Instant::now();
            existing.propagated = false;
            existing.notify = notify;
            return RegisterOutcome::Registered;
        }

        if bucket.len() >= max_candidates {
            return RegisterOutcome::TargetFull;
        }

        bucket.push(Candidate {
            candidate_ip,
            predictions,
            registered_at: Instant::now(),
            propagated: false,
            notify,
        });
        RegisterOutcome::Registered
    }

    /// Deliver `line` (a `FIGHT` relay) to the candidate connection and
    /// remove it from the queue -- a fight only happens once.
    pub fn deliver_and_remove(&self, target_ip: Ipv4Addr, candidate_ip: Ipv4Addr, line: String) -> bool {
        let Some(mut bucket) = self.table.get_mut(&target_ip) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|c| c.candidate_ip == candidate_ip) else {
            return false;
        };
        let candidate = bucket.remove(pos);
        candidate.notify.send(line).is_ok()
    }

    /// All not-yet-propagated candidates for `target_ip`, marking them
    /// propagated as they're returned.
    pub fn take_unpropagated(&self, target_ip: Ipv4Addr) -> Vec<Candidate> {
        let Some(mut bucket) = self.table.get_mut(&target_ip) else {
            return Vec::new();
        };
        let mut fresh = Vec::new();
        for candidate in bucket.iter_mut() {
            if !candidate.propagated {
                candidate.propagated = true;
                fresh.push(candidate.clone());
            }
        }
        fresh
    }

    /// Drop candidates older than `max_age` targeting a node that is no
    /// longer a fresh simultaneous node (per `target_is_live`), and drop
    /// any bucket left empty. Returns the number of candidates dropped.
    pub fn sweep(&self, max_age: Duration, target_is_live: impl Fn(Ipv4Addr) -> bool) -> usize {
        let mut dropped = 0;
        self.table.retain(|&target_ip, bucket| {
            if !target_is_live(target_ip) {
                bucket.retain(|c| {
                    let keep = c.registered_at.elapsed() < max_age;
                    if !keep {
                        dropped += 1;
                    }
                    keep
                });
            }
            !bucket.is_empty()
        });
        dropped
    }

    pub fn target_count(&self) -> usize {
        self.table.len()
    }
}

impl Default for CandidateTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> UnboundedSender<String> {
        tokio::sync::mpsc::unbounded_channel().0
    }

    #[test]
    fn register_replaces_same_source_candidate_atomically() {
        let table = CandidateTable::new();
        let target: Ipv4Addr = "203.0.113.1".parse().unwrap();
        let candidate: Ipv4Addr = "203.0.113.2".parse().unwrap();

        assert!(matches!(table.register(target, candidate, vec![1000], sink(), 10), RegisterOutcome::Registered));
        assert!(matches!(table.register(target, candidate, vec![1001, 1002], sink(), 10), RegisterOutcome::Registered));

        let unpropagated = table.take_unpropagated(target);
        assert_eq!(unpropagated.len(), 1);
        assert_eq!(unpropagated[0].predictions, vec![1001, 1002]);
    }

    #[test]
    fn register_rejects_past_max_candidates() {
        let table = CandidateTable::new();
        let target: Ipv4Addr = "203.0.113.1".parse().unwrap();
        for i in 0..3u8 {
            let ip = Ipv4Addr::new(203, 0, 113, 10 + i);
            assert!(matches!(table.register(target, ip, vec![1000], sink(), 3), RegisterOutcome::Registered));
        }
        let overflow = Ipv4Addr::new(203, 0, 113, 99);
        assert!(matches!(table.register(target, overflow, vec![1000], sink(), 3), RegisterOutcome::TargetFull));
    }

    #[test]
    fn take_unpropagated_only_returns_each_candidate_once() {
        let table = CandidateTable::new();
        let target: Ipv4Addr = "203.0.113.1".parse().unwrap();
        let candidate: Ipv4Addr = "203.0.113.2".parse().unwrap();
        table.register(target, candidate, vec![1000], sink(), 10);

        assert_eq!(table.take_unpropagated(target).len(), 1);
        assert_eq!(table.take_unpropagated(target).len(), 0);
    }

    #[test]
    fn sweep_drops_stale_candidates_for_dead_targets_only() {
        let table = CandidateTable::new();
        let live: Ipv4Addr = "203.0.113.1".parse().unwrap();
        let dead: Ipv4Addr = "203.0.113.2".parse().unwrap();
        let candidate: Ipv4Addr = "203.0.113.9".parse().unwrap();
        table.register(live, candidate, vec![1000], sink(), 10);
        table.register(dead, candidate, vec![1000], sink(), 10);

        let dropped = table.sweep(Duration::from_secs(0), |ip| ip == live);
        assert_eq!(dropped, 1);
        assert_eq!(table.target_count(), 1);
    }

    #[tokio::test]
    async fn deliver_and_remove_sends_then_drops_the_candidate() {
        let table = CandidateTable::new();
        let target: Ipv4Addr = "203.0.113.1".parse().unwrap();
        let candidate: Ipv4Addr = "203.0.113.2".parse().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        table.register(target, candidate, vec![1000], tx, 10);

        assert!(table.deliver_and_remove(target, candidate, "FIGHT 1.0 203.0.113.1 1000 TCP 1.0".to_string()));
        assert_eq!(rx.recv().await.unwrap(), "FIGHT 1.0 203.0.113.1 1000 TCP 1.0");
        assert!(!table.deliver_and_remove(target, candidate, "FIGHT again".to_string()));
    }
}
