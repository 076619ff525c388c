//! Periodic sweep that drops stale node registrations and candidate
//! queues, keeping the directory bounded under churn.

use std::sync::Arc;

use crate::server::ServerState;

/// Runs every `cleanup_interval_secs` until the process exits.
pub async fn run(state: Arc<ServerState>) {
    let interval = std::time::Duration::from_secs(state.config.cleanup_interval_secs);
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        ticker.tick().await;
        sweep_once(&state);
    }
}

fn sweep_once(state: &Arc<ServerState>) {
    let node_lifetime = state.node_lifetime();
    let dropped_nodes = state.nodes.sweep(node_lifetime);

    let candidate_max_age = state.challenge_timeout() * 5;
    let dropped_candidates = state
        .candidates
        .sweep(candidate_max_age, |target_ip| state.nodes.is_fresh_simultaneous(target_ip, state.challenge_timeout()));

    if dropped_nodes > 0 || dropped_candidates > 0 {
        tracing::info!(dropped_nodes, dropped_candidates, "cleanup sweep complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendezvousConfig;

    #[test]
    fn sweep_once_drops_stale_nodes_and_candidates() {
        let mut config = RendezvousConfig::default();
        config.node_lifetime_secs = 0;
        config.challenge_timeout_secs = 0;
        let state = Arc::new(ServerState::new(config));

        state.nodes.register_passive("203.0.113.1".parse().unwrap(), 40000);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state
            .candidates
            .register("203.0.113.2".parse().unwrap(), "203.0.113.3".parse().unwrap(), vec![1000], tx, 10);

        sweep_once(&state);
        assert_eq!(state.nodes.len(), 0);
        assert_eq!(state.candidates.target_count(), 0);
    }
}
