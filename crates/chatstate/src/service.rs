//! Turn lifecycle manager and context API.
//!
//! One `ChatStateService` serves many chats concurrently. Turn metadata
//! lives in a sharded in-memory index; a chat's shard mutex is the
//! in-process half of the two-level lock (the storage backend holds the
//! distributed half) and the sole mutator of turn state. Storage or lock
//! failures inside a turn write force-complete the turn before the error
//! is surfaced, so no turn is left permanently open.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::{Result, StateError};
use crate::history::{repair_tool_call_pairing, strip_tool_messages, window_last_turns};
use crate::message::{ChatMessage, ToolCallOut, ToolCallRecord, new_turn_id, now_unix_ms};
use crate::observability::StateEvent;
use crate::state::ChatState;
use crate::storage::{ChatMetadata, StorageBackend, StorageHealth};
use crate::turn::{ToolResultAck, TurnMetadata};

const TURN_SHARD_COUNT: usize = 64;

/// Ids returned by [`ChatStateService::start_turn`], correlating the
/// subsequent assistant and tool writes of the turn.
#[derive(Debug, Clone)]
pub struct StartedTurn {
    /// The new turn's id.
    pub turn_id: String,
    /// Id of the persisted user message.
    pub user_message_id: String,
}

/// Result of one tool invocation, as delivered to a turn.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// Tool returned a JSON payload.
    Success(Value),
    /// Tool failed; human-readable error string.
    Failure(String),
}

impl ToolOutcome {
    /// Message content for the `tool` result message.
    pub fn content(&self) -> String {
        match self {
            Self::Success(value) => value.to_string(),
            Self::Failure(error) => error.clone(),
        }
    }

    /// Error string, when this outcome is a failure.
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Success(_) => None,
            Self::Failure(error) => Some(error.clone()),
        }
    }
}

/// Parameters for a history read.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Maximum messages returned; `None` uses the configured default,
    /// `Some(0)` reads everything.
    pub limit: Option<usize>,
    /// Keep only the last `k` turns; 0 keeps all turns.
    pub k_turns: usize,
    /// Include tool traffic; `None` uses the configured default.
    pub include_tool_calls: Option<bool>,
    /// Also fetch the tool-call audit log into a full-context read.
    /// Off by default; independent of `include_tool_calls`.
    pub include_tool_history: bool,
}

/// Everything a conversation loop needs to build the next model request.
#[derive(Debug, Clone)]
pub struct FullContext {
    /// The chat-state document (lazily created).
    pub chat_state: ChatState,
    /// Repaired, windowed chat history.
    pub chat_history: Vec<ChatMessage>,
    /// Recent audit records, when the query asks for them.
    pub tool_history: Option<Vec<ToolCallRecord>>,
}

/// Outcome of delivering one tool result through the service.
#[derive(Debug, Clone)]
pub struct ToolResultDelivery {
    /// Whether the result was accepted and its `tool` message persisted.
    pub accepted: bool,
    /// Whether this delivery completed the turn.
    pub turn_completed: bool,
    /// The persisted `tool` message, when accepted. Re-delivering this
    /// exact message hits the id-based duplicate skip in storage.
    pub message: Option<ChatMessage>,
}

impl ToolResultDelivery {
    fn rejected() -> Self {
        Self {
            accepted: false,
            turn_completed: false,
            message: None,
        }
    }
}

type TurnIndex = HashMap<String, HashMap<String, TurnMetadata>>;

/// Conversation state engine: turn lifecycle, history views and the
/// chat-state document, over a pluggable storage backend.
pub struct ChatStateService {
    storage: Arc<dyn StorageBackend>,
    config: EngineConfig,
    // Fixed shard table so the per-chat index cannot grow a lock per chat.
    turn_shards: Vec<Mutex<TurnIndex>>,
}

impl ChatStateService {
    /// Build a service over `storage`.
    pub fn new(storage: Arc<dyn StorageBackend>, config: EngineConfig) -> Self {
        Self {
            storage,
            config,
            turn_shards: (0..TURN_SHARD_COUNT).map(|_| Mutex::new(TurnIndex::new())).collect(),
        }
    }

    /// The engine configuration this service runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn shard_for(&self, chat_id: &str) -> &Mutex<TurnIndex> {
        let mut hasher = DefaultHasher::new();
        chat_id.hash(&mut hasher);
        &self.turn_shards[(hasher.finish() as usize) % TURN_SHARD_COUNT]
    }

    /// Open a turn: allocate ids, register metadata and durably append the
    /// user message. Concurrent calls for the same chat each open an
    /// independent turn.
    pub async fn start_turn(&self, chat_id: &str, user_text: &str) -> Result<StartedTurn> {
        let turn_id = new_turn_id();
        let message = ChatMessage::user(&turn_id, user_text);
        let user_message_id = message.message_id.clone();

        let mut shard = self.shard_for(chat_id).lock().await;
        shard
            .entry(chat_id.to_string())
            .or_default()
            .insert(turn_id.clone(), TurnMetadata::new(&turn_id, &user_message_id));
        if let Err(error) = self.storage.add_chat_message(chat_id, &message).await {
            self.remove_turn(&mut shard, chat_id, &turn_id);
            return Err(error);
        }
        drop(shard);

        tracing::info!(
            event = StateEvent::TurnStarted.as_str(),
            chat_id,
            turn_id = %turn_id,
            user_message_id = %user_message_id,
            "turn started"
        );
        Ok(StartedTurn {
            turn_id,
            user_message_id,
        })
    }

    /// Record the assistant reply for an open turn and persist it. A reply
    /// announcing tool calls leaves the turn open for their results; one
    /// without completes the turn.
    pub async fn add_assistant_message(
        &self,
        chat_id: &str,
        turn_id: &str,
        content: &str,
        tool_calls: Option<Vec<ToolCallOut>>,
    ) -> Result<String> {
        let message = ChatMessage::assistant(turn_id, content, tool_calls);
        let expected: Vec<String> = message
            .tool_calls
            .as_ref()
            .map(|calls| calls.iter().map(|call| call.id.clone()).collect())
            .unwrap_or_default();
        let message_id = message.message_id.clone();

        let mut shard = self.shard_for(chat_id).lock().await;
        if !turn_exists(&shard, chat_id, turn_id) {
            tracing::warn!(
                event = StateEvent::TurnNotFound.as_str(),
                chat_id,
                turn_id,
                "assistant message for unknown turn"
            );
            return Err(StateError::TurnNotFound {
                turn_id: turn_id.to_string(),
            });
        }
        if let Err(error) = self.storage.add_chat_message(chat_id, &message).await {
            self.force_complete_locked(&mut shard, chat_id, turn_id);
            return Err(error);
        }
        let completed = match shard
            .get_mut(chat_id)
            .and_then(|turns| turns.get_mut(turn_id))
        {
            Some(turn) => {
                turn.set_assistant_reply(&message_id, expected.clone());
                turn.is_complete
            }
            None => false,
        };
        if completed {
            self.remove_turn(&mut shard, chat_id, turn_id);
        }
        drop(shard);

        tracing::debug!(
            event = StateEvent::AssistantMessageAdded.as_str(),
            chat_id,
            turn_id,
            message_id = %message_id,
            expected_tool_calls = expected.len(),
            "assistant message added"
        );
        if completed {
            tracing::info!(
                event = StateEvent::TurnCompleted.as_str(),
                chat_id,
                turn_id,
                "turn completed without tool calls"
            );
        }
        Ok(message_id)
    }

    /// Deliver one tool result into an open turn and persist its `tool`
    /// message. The returned delivery carries the persisted message, so
    /// callers hand the canonical ids onward instead of rebuilding them.
    ///
    /// Stale deliveries are rejected as data, not errors: an unknown turn
    /// or an unexpected/duplicate tool-call id logs and returns a rejected
    /// delivery without touching storage.
    pub async fn add_tool_result(
        &self,
        chat_id: &str,
        turn_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        outcome: &ToolOutcome,
    ) -> Result<ToolResultDelivery> {
        let mut shard = self.shard_for(chat_id).lock().await;
        let ack = match shard
            .get_mut(chat_id)
            .and_then(|turns| turns.get_mut(turn_id))
        {
            Some(turn) => turn.record_tool_result(tool_call_id),
            None => {
                tracing::warn!(
                    event = StateEvent::TurnNotFound.as_str(),
                    chat_id,
                    turn_id,
                    tool_call_id,
                    "tool result for unknown turn dropped"
                );
                return Ok(ToolResultDelivery::rejected());
            }
        };
        match ack {
            ToolResultAck::Unexpected => {
                tracing::warn!(
                    event = StateEvent::UnexpectedToolResult.as_str(),
                    chat_id,
                    turn_id,
                    tool_call_id,
                    "unexpected tool result dropped"
                );
                return Ok(ToolResultDelivery::rejected());
            }
            ToolResultAck::Duplicate => {
                tracing::debug!(
                    event = StateEvent::ToolResultRecorded.as_str(),
                    chat_id,
                    turn_id,
                    tool_call_id,
                    duplicate = true,
                    "duplicate tool result ignored"
                );
                return Ok(ToolResultDelivery::rejected());
            }
            ToolResultAck::Pending | ToolResultAck::Completed => {}
        }

        let message = ChatMessage::tool(
            turn_id,
            tool_call_id,
            tool_name,
            outcome.content(),
            outcome.error(),
        );
        if let Err(error) = self.storage.add_chat_message(chat_id, &message).await {
            self.force_complete_locked(&mut shard, chat_id, turn_id);
            return Err(error);
        }
        let completed = ack == ToolResultAck::Completed;
        if completed {
            self.remove_turn(&mut shard, chat_id, turn_id);
        }
        drop(shard);

        tracing::debug!(
            event = StateEvent::ToolResultRecorded.as_str(),
            chat_id,
            turn_id,
            tool_call_id,
            completed,
            "tool result recorded"
        );
        if completed {
            tracing::info!(
                event = StateEvent::TurnCompleted.as_str(),
                chat_id,
                turn_id,
                "turn completed"
            );
        }
        Ok(ToolResultDelivery {
            accepted: true,
            turn_completed: completed,
            message: Some(message),
        })
    }

    /// Complete a turn regardless of outstanding tool calls. Returns
    /// whether the turn was still open. Idempotent.
    pub async fn force_complete_turn(&self, chat_id: &str, turn_id: &str) -> bool {
        let mut shard = self.shard_for(chat_id).lock().await;
        self.force_complete_locked(&mut shard, chat_id, turn_id)
    }

    fn force_complete_locked(&self, shard: &mut TurnIndex, chat_id: &str, turn_id: &str) -> bool {
        let Some(mut turn) = shard
            .get_mut(chat_id)
            .and_then(|turns| turns.remove(turn_id))
        else {
            return false;
        };
        turn.mark_complete();
        if shard.get(chat_id).is_some_and(HashMap::is_empty) {
            shard.remove(chat_id);
        }
        tracing::info!(
            event = StateEvent::TurnForceCompleted.as_str(),
            chat_id,
            turn_id,
            outstanding_tool_calls = turn
                .expected_tool_calls
                .len()
                .saturating_sub(turn.completed_tool_results.len()),
            "turn force completed"
        );
        true
    }

    fn remove_turn(&self, shard: &mut TurnIndex, chat_id: &str, turn_id: &str) {
        if let Some(turns) = shard.get_mut(chat_id) {
            turns.remove(turn_id);
        }
        if shard.get(chat_id).is_some_and(HashMap::is_empty) {
            shard.remove(chat_id);
        }
    }

    /// Force-complete turns older than `max_age`. Guards against clients
    /// that never deliver a final tool result. Returns the sweep count.
    pub async fn cleanup_active_turns(&self, chat_id: &str, max_age: Duration) -> usize {
        let now = now_unix_ms();
        let max_age_ms = max_age.as_millis() as u64;
        let mut shard = self.shard_for(chat_id).lock().await;
        let Some(turns) = shard.get_mut(chat_id) else {
            return 0;
        };
        let aged: Vec<String> = turns
            .iter()
            .filter(|(_, turn)| turn.age_ms(now) > max_age_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for turn_id in &aged {
            if let Some(mut turn) = turns.remove(turn_id) {
                turn.mark_complete();
                tracing::warn!(
                    event = StateEvent::OrphanedTurnCleaned.as_str(),
                    chat_id,
                    turn_id = %turn_id,
                    age_ms = turn.age_ms(now),
                    "aged-out turn force completed"
                );
            }
        }
        if turns.is_empty() {
            shard.remove(chat_id);
        }
        aged.len()
    }

    /// Number of turns currently open for a chat.
    pub async fn active_turn_count(&self, chat_id: &str) -> usize {
        let shard = self.shard_for(chat_id).lock().await;
        shard.get(chat_id).map_or(0, HashMap::len)
    }

    /// Read the history view handed to the model: sweep aged turns, fetch
    /// a raw slice, repair tool-call pairing, optionally strip tool
    /// traffic, window to the last `k` turns and apply the final limit.
    pub async fn get_chat_history(
        &self,
        chat_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<ChatMessage>> {
        self.cleanup_active_turns(chat_id, self.config.turn_max_age())
            .await;
        let limit = query.limit.unwrap_or(self.config.history_limit);
        let include_tool_calls = query
            .include_tool_calls
            .unwrap_or(self.config.include_tool_calls_in_history);

        // Over-fetch so repair drops do not shrink the view below `limit`.
        let fetch = limit.saturating_mul(2);
        let raw = self.storage.get_chat_history(chat_id, fetch).await?;
        let mut messages = repair_tool_call_pairing(raw);
        if !include_tool_calls {
            messages = strip_tool_messages(messages);
        }
        messages = window_last_turns(messages, query.k_turns);
        if limit > 0 && messages.len() > limit {
            let skip = messages.len() - limit;
            messages.drain(..skip);
        }
        Ok(messages)
    }

    /// Fetch the chat-state document, creating and persisting the default
    /// document on first access.
    pub async fn get_chat_state(&self, chat_id: &str) -> Result<ChatState> {
        if let Some(state) = self.storage.get_chat_state(chat_id).await? {
            return Ok(state);
        }
        let state = ChatState::create_default(chat_id);
        self.storage.set_chat_state(chat_id, &state).await?;
        tracing::debug!(
            event = StateEvent::ChatStateCreated.as_str(),
            chat_id,
            "default chat state created"
        );
        Ok(state)
    }

    /// Apply a shallow key/value patch to the chat-state document and
    /// persist it.
    pub async fn update_chat_state(&self, chat_id: &str, patch: Map<String, Value>) -> Result<()> {
        let mut state = self.get_chat_state(chat_id).await?;
        let patched_keys = patch.len();
        state.apply_patch(patch);
        self.storage.set_chat_state(chat_id, &state).await?;
        tracing::debug!(
            event = StateEvent::ChatStateUpdated.as_str(),
            chat_id,
            patched_keys,
            "chat state updated"
        );
        Ok(())
    }

    /// Fetch state plus history (and optionally the audit log) in one
    /// call. The audit log rides on `include_tool_history`, separate from
    /// the tool-traffic filter on the history view.
    pub async fn get_full_context(&self, chat_id: &str, query: &HistoryQuery) -> Result<FullContext> {
        let chat_state = self.get_chat_state(chat_id).await?;
        let chat_history = self.get_chat_history(chat_id, query).await?;
        let tool_history = if query.include_tool_history {
            Some(
                self.storage
                    .get_tool_history(chat_id, self.config.tool_history_limit)
                    .await?,
            )
        } else {
            None
        };
        Ok(FullContext {
            chat_state,
            chat_history,
            tool_history,
        })
    }

    /// Read the last `limit` audit records (0 = all).
    pub async fn get_tool_history(&self, chat_id: &str, limit: usize) -> Result<Vec<ToolCallRecord>> {
        self.storage.get_tool_history(chat_id, limit).await
    }

    /// Best-effort audit write: failures are absorbed and logged, and the
    /// logs are trimmed to the configured audit bound afterwards (which
    /// also bounds the idempotent-append duplicate scan).
    pub async fn record_tool_call(&self, chat_id: &str, record: &ToolCallRecord) {
        if !self.config.store_tool_history {
            return;
        }
        if let Err(error) = self.storage.add_tool_call(chat_id, record).await {
            tracing::warn!(
                event = StateEvent::AuditWriteFailed.as_str(),
                chat_id,
                tool_call_id = %record.tool_call_id,
                error = %error,
                "tool call audit write failed"
            );
            return;
        }
        if let Err(error) = self
            .storage
            .trim_history(chat_id, self.config.tool_history_limit)
            .await
        {
            tracing::warn!(
                event = StateEvent::AuditWriteFailed.as_str(),
                chat_id,
                error = %error,
                "post-audit history trim failed"
            );
        }
    }

    /// Reset one chat entirely: drop its open turns, delete both logs and
    /// reset the state document to the default.
    pub async fn clear_chat_data(&self, chat_id: &str) -> Result<()> {
        let mut shard = self.shard_for(chat_id).lock().await;
        shard.remove(chat_id);
        drop(shard);
        self.storage.trim_history(chat_id, 0).await?;
        self.storage
            .set_chat_state(chat_id, &ChatState::create_default(chat_id))
            .await?;
        tracing::info!(
            event = StateEvent::ChatDataCleared.as_str(),
            chat_id,
            "chat data cleared"
        );
        Ok(())
    }

    /// Probe the storage backend.
    pub async fn health_check(&self) -> Result<StorageHealth> {
        self.storage.health_check().await
    }

    /// Per-chat storage counters.
    pub async fn get_chat_metadata(&self, chat_id: &str) -> Result<ChatMetadata> {
        self.storage.get_chat_metadata(chat_id).await
    }
}

fn turn_exists(shard: &TurnIndex, chat_id: &str, turn_id: &str) -> bool {
    shard
        .get(chat_id)
        .is_some_and(|turns| turns.contains_key(turn_id))
}
