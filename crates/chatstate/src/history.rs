//! History repair and windowing.
//!
//! Pure view transformations over an already-loaded history slice. Nothing
//! here touches storage: a repaired or windowed history is what the model
//! sees, the persisted log keeps every entry.

use std::collections::{HashMap, HashSet};

use crate::message::{ChatMessage, Role};
use crate::observability::StateEvent;

/// Enforce the provider contract that every `tool` message resolves a tool
/// call announced by a preceding `assistant` message.
///
/// Matching is by id: an announced tool-call id is pending until a `tool`
/// message carries it. Tool results with no pending announcement are
/// dropped. When a `user` message arrives with announcements still pending,
/// or the list ends that way, the announcing assistant messages and any of
/// their partial results are dropped too, so the view never contains a
/// half-resolved tool-calling step.
///
/// Idempotent: repairing a repaired history is a no-op.
pub fn repair_tool_call_pairing(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    // tool_call_id -> announcing assistant message_id, for every
    // announcement seen so far (never removed).
    let mut announced: HashMap<String, String> = HashMap::new();
    // tool_call_ids still waiting for a result.
    let mut pending: HashSet<String> = HashSet::new();
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            Role::User => {
                if !pending.is_empty() {
                    drop_unresolved_steps(&mut out, &announced, &pending);
                    pending.clear();
                }
                out.push(message);
            }
            Role::Assistant => {
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        announced.insert(call.id.clone(), message.message_id.clone());
                        pending.insert(call.id.clone());
                    }
                }
                out.push(message);
            }
            Role::Tool => {
                let resolves_pending = message
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| pending.remove(id));
                if resolves_pending {
                    out.push(message);
                } else {
                    tracing::debug!(
                        event = StateEvent::OrphanedToolResultSkipped.as_str(),
                        message_id = %message.message_id,
                        tool_call_id = message.tool_call_id.as_deref().unwrap_or(""),
                        "orphaned tool result dropped from history view"
                    );
                }
            }
        }
    }

    if !pending.is_empty() {
        drop_unresolved_steps(&mut out, &announced, &pending);
    }
    out
}

/// Remove every assistant message that still has a pending announcement,
/// together with all tool results belonging to those messages.
fn drop_unresolved_steps(
    out: &mut Vec<ChatMessage>,
    announced: &HashMap<String, String>,
    pending: &HashSet<String>,
) {
    let unresolved_announcers: HashSet<&String> = pending
        .iter()
        .filter_map(|call_id| announced.get(call_id))
        .collect();
    out.retain(|message| {
        let dropped = match message.role {
            Role::Assistant => unresolved_announcers.contains(&message.message_id),
            Role::Tool => message
                .tool_call_id
                .as_deref()
                .and_then(|id| announced.get(id))
                .is_some_and(|announcer| unresolved_announcers.contains(announcer)),
            Role::User => false,
        };
        if dropped {
            tracing::debug!(
                event = StateEvent::IncompleteToolCallRemoved.as_str(),
                message_id = %message.message_id,
                role = ?message.role,
                "unresolved tool-calling step dropped from history view"
            );
        }
        !dropped
    });
}

/// Keep only the last `k` turns, where a turn starts at each `user`
/// message. `k = 0` keeps every turn. Leading assistant/tool messages
/// that precede the first user message are dropped either way.
pub fn window_last_turns(messages: Vec<ChatMessage>, k: usize) -> Vec<ChatMessage> {
    let mut turns: Vec<Vec<ChatMessage>> = Vec::new();
    for message in messages {
        if message.role == Role::User {
            turns.push(vec![message]);
        } else if let Some(current) = turns.last_mut() {
            current.push(message);
        } else {
            tracing::debug!(
                event = StateEvent::OrphanedMessageSkipped.as_str(),
                message_id = %message.message_id,
                role = ?message.role,
                "message preceding the first user turn dropped"
            );
        }
    }
    if k > 0 {
        let skip = turns.len().saturating_sub(k);
        turns.drain(..skip);
    }
    turns.into_iter().flatten().collect()
}

/// Drop all tool traffic: `tool` messages and assistant messages that
/// announce tool calls. The plain-conversation view.
pub fn strip_tool_messages(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .filter(|message| message.role != Role::Tool && !message.has_tool_calls())
        .collect()
}

#[cfg(test)]
#[path = "../tests/unit/history.rs"]
mod tests;
