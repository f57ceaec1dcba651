//! In-process storage backend with the same semantics as the Redis one.
//!
//! Single-process only: the in-process write lock stands in for the
//! distributed lease, and process lifetime stands in for the TTL.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::message::{ChatMessage, ToolCallRecord, now_unix_ms};
use crate::observability::StateEvent;
use crate::state::ChatState;

use super::{ChatMetadata, StorageBackend, StorageHealth, TurnOperation};

#[derive(Default)]
struct ChatRecord {
    state: Option<ChatState>,
    history: Vec<ChatMessage>,
    tool_history: Vec<ToolCallRecord>,
}

/// In-memory backend: chat id → state, message log, tool-call log.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<HashMap<String, ChatRecord>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_op(record: &mut ChatRecord, op: TurnOperation) {
        match op {
            TurnOperation::AddMessage(message) => record.history.push(message),
            TurnOperation::AddToolCall(tool_call) => record.tool_history.push(tool_call),
            TurnOperation::UpdateState(mut state) => {
                state.mark_written(now_unix_ms());
                record.state = Some(state);
            }
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get_chat_state(&self, chat_id: &str) -> Result<Option<ChatState>> {
        let g = self.inner.read().await;
        Ok(g.get(chat_id).and_then(|record| record.state.clone()))
    }

    async fn set_chat_state(&self, chat_id: &str, state: &ChatState) -> Result<()> {
        let mut g = self.inner.write().await;
        let record = g.entry(chat_id.to_string()).or_default();
        let mut state = state.clone();
        state.mark_written(now_unix_ms());
        record.state = Some(state);
        Ok(())
    }

    async fn get_chat_history(&self, chat_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let g = self.inner.read().await;
        let mut messages = g
            .get(chat_id)
            .map(|record| {
                let start = if limit == 0 {
                    0
                } else {
                    record.history.len().saturating_sub(limit)
                };
                record.history[start..].to_vec()
            })
            .unwrap_or_default();
        messages.sort_by_key(|message| message.timestamp_ms);
        Ok(messages)
    }

    async fn add_chat_message(&self, chat_id: &str, message: &ChatMessage) -> Result<()> {
        let mut g = self.inner.write().await;
        let record = g.entry(chat_id.to_string()).or_default();
        if record
            .history
            .iter()
            .any(|existing| existing.message_id == message.message_id)
        {
            tracing::debug!(
                event = StateEvent::DuplicateMessageSkipped.as_str(),
                chat_id,
                message_id = %message.message_id,
                backend = "memory",
                "duplicate message skipped"
            );
            return Ok(());
        }
        record.history.push(message.clone());
        tracing::debug!(
            event = StateEvent::MessageAppended.as_str(),
            chat_id,
            message_id = %message.message_id,
            backend = "memory",
            "chat message appended"
        );
        Ok(())
    }

    async fn get_tool_history(&self, chat_id: &str, limit: usize) -> Result<Vec<ToolCallRecord>> {
        let g = self.inner.read().await;
        let mut records = g
            .get(chat_id)
            .map(|record| {
                let start = if limit == 0 {
                    0
                } else {
                    record.tool_history.len().saturating_sub(limit)
                };
                record.tool_history[start..].to_vec()
            })
            .unwrap_or_default();
        records.sort_by_key(|record| record.timestamp_ms);
        Ok(records)
    }

    async fn add_tool_call(&self, chat_id: &str, tool_call: &ToolCallRecord) -> Result<()> {
        let mut g = self.inner.write().await;
        let record = g.entry(chat_id.to_string()).or_default();
        if record
            .tool_history
            .iter()
            .any(|existing| existing.tool_call_id == tool_call.tool_call_id)
        {
            tracing::debug!(
                event = StateEvent::DuplicateToolCallSkipped.as_str(),
                chat_id,
                tool_call_id = %tool_call.tool_call_id,
                backend = "memory",
                "duplicate tool call skipped"
            );
            return Ok(());
        }
        record.tool_history.push(tool_call.clone());
        Ok(())
    }

    async fn trim_history(&self, chat_id: &str, limit: usize) -> Result<()> {
        let mut g = self.inner.write().await;
        let Some(record) = g.get_mut(chat_id) else {
            return Ok(());
        };
        if limit == 0 {
            record.history.clear();
            record.tool_history.clear();
        } else {
            let drop = record.history.len().saturating_sub(limit);
            record.history.drain(..drop);
            let drop = record.tool_history.len().saturating_sub(limit);
            record.tool_history.drain(..drop);
        }
        tracing::debug!(
            event = StateEvent::HistoryTrimmed.as_str(),
            chat_id,
            limit,
            backend = "memory",
            "history trimmed"
        );
        Ok(())
    }

    async fn atomic_turn_operation(&self, chat_id: &str, ops: Vec<TurnOperation>) -> Result<()> {
        let mut g = self.inner.write().await;
        let record = g.entry(chat_id.to_string()).or_default();
        let op_count = ops.len();
        for op in ops {
            Self::apply_op(record, op);
        }
        tracing::debug!(
            event = StateEvent::AtomicTurnOperation.as_str(),
            chat_id,
            op_count,
            backend = "memory",
            "atomic turn operations applied"
        );
        Ok(())
    }

    async fn health_check(&self) -> Result<StorageHealth> {
        Ok(StorageHealth {
            healthy: true,
            latency_ms: Some(0.0),
            detail: None,
        })
    }

    async fn get_chat_metadata(&self, chat_id: &str) -> Result<ChatMetadata> {
        let g = self.inner.read().await;
        let record = g.get(chat_id);
        Ok(ChatMetadata {
            chat_id: chat_id.to_string(),
            message_count: record.map_or(0, |r| r.history.len()),
            tool_call_count: record.map_or(0, |r| r.tool_history.len()),
            last_activity_ms: record
                .and_then(|r| r.state.as_ref())
                .map(|state| state.updated_at_ms),
            has_state: record.is_some_and(|r| r.state.is_some()),
        })
    }
}
