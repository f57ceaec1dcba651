//! Error taxonomy for the conversation state engine.

use thiserror::Error;

/// Engine-specific errors.
///
/// Propagation policy: failures local to one tool call or one audit write
/// are absorbed and logged where they occur; lock and storage failures are
/// surfaced to the caller of the enclosing turn operation, which must
/// force-complete the turn before re-raising.
#[derive(Error, Debug)]
pub enum StateError {
    /// Distributed lock not acquired within its budget; the operation is
    /// aborted and the turn left open for a later cleanup sweep.
    #[error("failed to acquire lock {key} within {waited_ms}ms")]
    LockTimeout {
        /// Fully qualified lock key.
        key: String,
        /// Time spent waiting before giving up.
        waited_ms: u64,
    },

    /// Write referenced a turn absent from the in-memory index (already
    /// completed, swept, or never started).
    #[error("turn {turn_id} not found or already completed")]
    TurnNotFound {
        /// The unknown turn id.
        turn_id: String,
    },

    /// A tool result did not match any pending expectation for its turn.
    #[error("tool call id {tool_call_id} was not expected by this turn")]
    UnexpectedToolCallId {
        /// The unmatched tool call id.
        tool_call_id: String,
    },

    /// Connection or timeout against the storage backend, after retries.
    #[error("storage backend unavailable: {0}")]
    StorageUnavailable(String),

    /// Argument parse error or error raised inside a tool. Converted to a
    /// synthetic tool-result message by the executor; never crosses the
    /// conversation loop as an error.
    #[error("tool execution failed: {0}")]
    ToolExecutionFailure(String),

    /// Unparsable persisted entry; skipped during reads, never fatal.
    #[error("corrupted history entry: {0}")]
    HistoryCorruption(String),

    /// JSON encode failure on a write path.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, StateError>;
