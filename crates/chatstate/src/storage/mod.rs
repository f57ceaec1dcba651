//! Storage namespace: backend contract plus the Redis and in-memory backends.

mod memory;
mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{ChatMessage, ToolCallRecord};
use crate::state::ChatState;

pub use self::memory::MemoryStorage;
pub use self::redis::RedisStorage;

/// One operation in an atomic turn batch.
#[derive(Debug, Clone)]
pub enum TurnOperation {
    /// Append a message to the chat history log.
    AddMessage(ChatMessage),
    /// Append a record to the tool-call audit log.
    AddToolCall(ToolCallRecord),
    /// Replace the chat-state document.
    UpdateState(ChatState),
}

/// Backend health probe result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageHealth {
    /// Whether the backend answered the probe.
    pub healthy: bool,
    /// Round-trip latency of the probe, when healthy.
    pub latency_ms: Option<f64>,
    /// Failure detail, when unhealthy.
    pub detail: Option<String>,
}

/// Cheap per-chat counters and activity metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMetadata {
    /// Chat id.
    pub chat_id: String,
    /// Entries in the message log.
    pub message_count: usize,
    /// Entries in the tool-call audit log.
    pub tool_call_count: usize,
    /// Last state write, unix milliseconds.
    pub last_activity_ms: Option<u64>,
    /// Whether a state document exists.
    pub has_state: bool,
}

/// Durable chat storage: a state document, an append-only message log and
/// an append-only tool-call log per chat.
///
/// Writers against the same chat must be serialized by the backend (a
/// lease-based lock for anything shared across processes). Reads are not
/// locked and may observe a history concurrently being appended to.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch the chat-state document, if one exists.
    async fn get_chat_state(&self, chat_id: &str) -> Result<Option<ChatState>>;

    /// Persist the chat-state document, bumping its write metadata.
    async fn set_chat_state(&self, chat_id: &str, state: &ChatState) -> Result<()>;

    /// Read up to `limit` messages (0 = all), ordered by timestamp.
    /// Individually unparsable entries are skipped, never fatal.
    async fn get_chat_history(&self, chat_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;

    /// Append one message under the chat's write lock.
    ///
    /// Idempotent under at-least-once delivery: an entry with the same
    /// `message_id` already in the log makes this a no-op. The duplicate
    /// scan is linear in the log length; keep logs bounded via
    /// [`Self::trim_history`].
    async fn add_chat_message(&self, chat_id: &str, message: &ChatMessage) -> Result<()>;

    /// Read up to `limit` audit records (0 = all), ordered by timestamp.
    async fn get_tool_history(&self, chat_id: &str, limit: usize) -> Result<Vec<ToolCallRecord>>;

    /// Append one audit record, idempotent by `tool_call_id`.
    async fn add_tool_call(&self, chat_id: &str, record: &ToolCallRecord) -> Result<()>;

    /// Trim both logs to their last `limit` entries; 0 deletes everything.
    async fn trim_history(&self, chat_id: &str, limit: usize) -> Result<()>;

    /// Execute a batch of operations as one unit under the chat's lock.
    async fn atomic_turn_operation(&self, chat_id: &str, ops: Vec<TurnOperation>) -> Result<()>;

    /// Probe backend liveness.
    async fn health_check(&self) -> Result<StorageHealth>;

    /// Fetch per-chat counters and last-activity metadata.
    async fn get_chat_metadata(&self, chat_id: &str) -> Result<ChatMetadata>;
}
