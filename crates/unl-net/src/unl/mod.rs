//! Universal Node Locator: wire codec plus the connection orchestrator.

mod codec;
mod orchestrator;

pub use codec::{construct, deconstruct, is_valid, NodeType, UnlFields, CURRENT_VERSION};
pub use orchestrator::{
    connection_id, hairpin_rewrite, is_master, plan_connection, relay_messages, select_strategy,
    validate_nonce, Orchestrator, PendingGuard, SimOpenGuard, Strategy,
};
