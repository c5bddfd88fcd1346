//! Lineage tracking: causal snapshots over a conversation.
//!
//! Pure functions over [`Conversation`]; the run loop stays the only owner
//! of the state they read.

use crate::session::{Conversation, Message};

/// Ids of every message in `state`, most-recent-first, skipping empty ids.
pub fn snapshot(state: &Conversation) -> Vec<String> {
    state
        .messages()
        .iter()
        .rev()
        .filter(|m| !m.id.is_empty())
        .map(|m| m.id.clone())
        .collect()
}

/// Attach a causal snapshot to an outgoing message.
pub fn stamp(message: &mut Message, snapshot: Vec<String>) {
    message.context_ids = snapshot;
}

/// A generation submitted at `expected_len` is stale once the conversation
/// length differs. Only the count matters: any new stimulus invalidates the
/// turn.
pub fn is_stale(state: &Conversation, expected_len: usize) -> bool {
    state.len() != expected_len
}
