//! Turn metadata: what one user request is waiting on.

use std::collections::HashSet;

use crate::message::now_unix_ms;

/// Outcome of delivering one tool result to a turn.
///
/// Explicit data instead of errors-as-control-flow: callers branch on the
/// acknowledgement, and only `Completed` flips the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolResultAck {
    /// Accepted, and this result completed the turn.
    Completed,
    /// Accepted; more expected results outstanding.
    Pending,
    /// The id was already recorded; state unchanged.
    Duplicate,
    /// The id matches no expected tool call; state unchanged.
    Unexpected,
}

/// In-memory metadata for one conversation turn.
///
/// Invariant: `completed_tool_results ⊆ expected_tool_calls`. A turn is
/// complete iff the assistant replied with no tool calls, every expected
/// id has reported, or completion was forced.
#[derive(Debug, Clone)]
pub struct TurnMetadata {
    /// Turn id.
    pub turn_id: String,
    /// Id of the user message that opened the turn.
    pub user_message_id: String,
    /// Id of the assistant reply, once it arrives.
    pub assistant_message_id: Option<String>,
    /// Tool-call ids the assistant announced, in request order, first
    /// occurrence kept when the provider repeats an id.
    pub expected_tool_calls: Vec<String>,
    /// Tool-call ids that have reported a result.
    pub completed_tool_results: HashSet<String>,
    /// Completion flag; monotonic, flips at most once.
    pub is_complete: bool,
    /// Creation time, unix milliseconds.
    pub created_at_ms: u64,
    /// Completion time, unix milliseconds.
    pub completed_at_ms: Option<u64>,
}

impl TurnMetadata {
    /// Open a turn for a freshly persisted user message.
    pub fn new(turn_id: &str, user_message_id: &str) -> Self {
        Self {
            turn_id: turn_id.to_string(),
            user_message_id: user_message_id.to_string(),
            assistant_message_id: None,
            expected_tool_calls: Vec::new(),
            completed_tool_results: HashSet::new(),
            is_complete: false,
            created_at_ms: now_unix_ms(),
            completed_at_ms: None,
        }
    }

    /// Record the assistant reply. A reply with no tool calls completes the
    /// turn immediately; otherwise the expected set is installed and the
    /// turn stays open.
    ///
    /// Announced ids are deduplicated: completion counts distinct ids, so a
    /// provider repeating an id cannot leave the turn waiting on a result
    /// that can only ever arrive once.
    pub fn set_assistant_reply(&mut self, message_id: &str, expected_tool_calls: Vec<String>) {
        self.assistant_message_id = Some(message_id.to_string());
        if expected_tool_calls.is_empty() {
            self.mark_complete();
        } else {
            let mut seen = HashSet::new();
            self.expected_tool_calls = expected_tool_calls
                .into_iter()
                .filter(|id| seen.insert(id.clone()))
                .collect();
        }
    }

    /// Deliver one tool result by id.
    pub fn record_tool_result(&mut self, tool_call_id: &str) -> ToolResultAck {
        if !self.expected_tool_calls.iter().any(|id| id == tool_call_id) {
            return ToolResultAck::Unexpected;
        }
        if !self.completed_tool_results.insert(tool_call_id.to_string()) {
            return ToolResultAck::Duplicate;
        }
        if !self.is_complete
            && self.completed_tool_results.len() == self.expected_tool_calls.len()
        {
            self.mark_complete();
            return ToolResultAck::Completed;
        }
        ToolResultAck::Pending
    }

    /// Mark the turn complete; idempotent, keeps the first completion time.
    pub fn mark_complete(&mut self) {
        if !self.is_complete {
            self.is_complete = true;
            self.completed_at_ms = Some(now_unix_ms());
        }
    }

    /// Age of the turn relative to `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }
}

#[cfg(test)]
#[path = "../tests/unit/turn.rs"]
mod tests;
