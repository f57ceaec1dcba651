//! Redis/Valkey storage backend for multi-instance deployments.
//!
//! Layout per chat: a JSON state document under a plain key and two
//! append-only JSON lists (message history and tool-call audit log). All
//! keys carry a sliding TTL refreshed on every write. Writers serialize
//! through a lease-based distributed lock; readers never lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use redis::FromRedisValue;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::RedisStorageConfig;
use crate::error::{Result, StateError};
use crate::message::{ChatMessage, ToolCallRecord, now_unix_ms};
use crate::observability::StateEvent;
use crate::state::ChatState;

use super::{ChatMetadata, StorageBackend, StorageHealth, TurnOperation};

static NEXT_LOCK_OWNER_SEQ: AtomicU64 = AtomicU64::new(1);

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

/// Redis/Valkey-backed [`StorageBackend`].
pub struct RedisStorage {
    core: Arc<RedisCore>,
}

struct RedisCore {
    client: redis::Client,
    cfg: RedisStorageConfig,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

/// Holds a distributed write lock; releases it on drop via a spawned task
/// (drop cannot await). The lease TTL equals the acquire budget, so a
/// crashed holder frees the lock without intervention.
struct WriteLockGuard {
    core: Arc<RedisCore>,
    lock_key: String,
    owner_token: String,
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let core = Arc::clone(&self.core);
        let lock_key = self.lock_key.clone();
        let owner_token = self.owner_token.clone();
        handle.spawn(async move {
            match core.release_lock(&lock_key, &owner_token).await {
                Ok(released) => {
                    tracing::debug!(
                        event = StateEvent::LockReleased.as_str(),
                        key = %lock_key,
                        released,
                        "write lock release attempted"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        event = StateEvent::LockReleased.as_str(),
                        key = %lock_key,
                        error = %error,
                        "write lock release failed; lease ttl will expire it"
                    );
                }
            }
        });
    }
}

impl RedisStorage {
    /// Open a client for the configured url. Does not connect; the first
    /// command establishes the connection lazily.
    pub fn new(cfg: RedisStorageConfig) -> Result<Self> {
        let client = redis::Client::open(cfg.url.as_str()).map_err(|err| {
            StateError::StorageUnavailable(format!("invalid redis url {}: {err}", cfg.url))
        })?;
        Ok(Self {
            core: Arc::new(RedisCore {
                client,
                cfg,
                connection: Mutex::new(None),
            }),
        })
    }

    /// Build from the environment; `None` when no url is configured.
    pub fn from_env() -> Option<Result<Self>> {
        RedisStorageConfig::from_env().map(Self::new)
    }
}

impl RedisCore {
    fn state_key(&self, chat_id: &str) -> String {
        format!("{}:state:{}", self.cfg.key_prefix, chat_id)
    }

    fn history_key(&self, chat_id: &str) -> String {
        format!("{}:history:{}", self.cfg.key_prefix, chat_id)
    }

    fn tools_key(&self, chat_id: &str) -> String {
        format!("{}:tools:{}", self.cfg.key_prefix, chat_id)
    }

    fn lock_key(&self, scope: &str, chat_id: &str) -> String {
        format!("{}:lock:{}:{}", self.cfg.key_prefix, scope, chat_id)
    }

    async fn ensure_connection(
        &self,
        connection: &mut Option<redis::aio::MultiplexedConnection>,
    ) -> Result<()> {
        if connection.is_some() {
            return Ok(());
        }
        *connection = Some(
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|err| {
                    StateError::StorageUnavailable(format!("failed to open redis connection: {err}"))
                })?,
        );
        tracing::debug!(
            event = StateEvent::StorageConnected.as_str(),
            key_prefix = %self.cfg.key_prefix,
            "redis storage backend connected"
        );
        Ok(())
    }

    async fn run_command<T, F>(&self, operation: &'static str, build: F) -> Result<T>
    where
        T: FromRedisValue + Send,
        F: Fn() -> redis::Cmd,
    {
        let attempts = self.cfg.max_retries.max(1);
        let mut last_err: Option<StateError> = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.cfg.retry_delay() * 2u32.pow(attempt - 1)).await;
            }
            let mut conn_guard = self.connection.lock().await;
            // A failed connection open spends a retry attempt like a
            // failed command does.
            if let Err(err) = self.ensure_connection(&mut conn_guard).await {
                tracing::warn!(
                    event = StateEvent::StorageCommandRetried.as_str(),
                    operation,
                    attempt = attempt + 1,
                    error = %err,
                    "redis connection attempt failed"
                );
                last_err = Some(err);
                continue;
            }
            let conn = conn_guard.as_mut().ok_or_else(|| {
                StateError::StorageUnavailable("redis connection unavailable".to_string())
            })?;
            let cmd = build();
            let result: redis::RedisResult<T> = cmd.query_async(conn).await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(
                        event = StateEvent::StorageCommandRetried.as_str(),
                        operation,
                        attempt = attempt + 1,
                        error = %err,
                        "redis command attempt failed; reconnecting"
                    );
                    *conn_guard = None;
                    last_err = Some(StateError::StorageUnavailable(format!(
                        "redis command {operation} failed: {err}"
                    )));
                }
            }
        }
        tracing::warn!(
            event = StateEvent::StorageCommandFailed.as_str(),
            operation,
            attempts,
            "redis command failed after retries"
        );
        Err(last_err.unwrap_or_else(|| {
            StateError::StorageUnavailable(format!("redis command {operation} failed"))
        }))
    }

    async fn run_pipeline<T, F>(&self, operation: &'static str, build: F) -> Result<T>
    where
        T: FromRedisValue + Send,
        F: Fn() -> redis::Pipeline,
    {
        let attempts = self.cfg.max_retries.max(1);
        let mut last_err: Option<StateError> = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.cfg.retry_delay() * 2u32.pow(attempt - 1)).await;
            }
            let mut conn_guard = self.connection.lock().await;
            if let Err(err) = self.ensure_connection(&mut conn_guard).await {
                tracing::warn!(
                    event = StateEvent::StorageCommandRetried.as_str(),
                    operation,
                    attempt = attempt + 1,
                    error = %err,
                    "redis connection attempt failed"
                );
                last_err = Some(err);
                continue;
            }
            let conn = conn_guard.as_mut().ok_or_else(|| {
                StateError::StorageUnavailable("redis connection unavailable".to_string())
            })?;
            let pipe = build();
            let result: redis::RedisResult<T> = pipe.query_async(conn).await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(
                        event = StateEvent::StorageCommandRetried.as_str(),
                        operation,
                        attempt = attempt + 1,
                        error = %err,
                        "redis pipeline attempt failed; reconnecting"
                    );
                    *conn_guard = None;
                    last_err = Some(StateError::StorageUnavailable(format!(
                        "redis pipeline {operation} failed: {err}"
                    )));
                }
            }
        }
        tracing::warn!(
            event = StateEvent::StorageCommandFailed.as_str(),
            operation,
            attempts,
            "redis pipeline failed after retries"
        );
        Err(last_err.unwrap_or_else(|| {
            StateError::StorageUnavailable(format!("redis pipeline {operation} failed"))
        }))
    }

    /// Acquire the write lock for `scope`/`chat_id`, waiting up to the
    /// configured timeout. The lease TTL equals the timeout, so an
    /// abandoned lock self-expires before a competing waiter gives up.
    async fn acquire_lock(self: &Arc<Self>, scope: &str, chat_id: &str) -> Result<WriteLockGuard> {
        let lock_key = self.lock_key(scope, chat_id);
        let owner_token = next_lock_owner_token();
        let lease_ttl_ms = self.cfg.lock_timeout_secs.saturating_mul(1000);
        let started = Instant::now();
        loop {
            let acquired = self
                .run_command::<Option<String>, _>("lock_try_acquire", || {
                    let mut cmd = redis::cmd("SET");
                    cmd.arg(&lock_key)
                        .arg(&owner_token)
                        .arg("NX")
                        .arg("PX")
                        .arg(lease_ttl_ms);
                    cmd
                })
                .await?;
            if acquired.is_some() {
                break;
            }
            if started.elapsed() >= self.cfg.lock_timeout() {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(
                    event = StateEvent::LockTimeout.as_str(),
                    key = %lock_key,
                    waited_ms,
                    "timed out waiting for write lock"
                );
                return Err(StateError::LockTimeout {
                    key: lock_key,
                    waited_ms,
                });
            }
            tokio::time::sleep(self.cfg.lock_retry_interval()).await;
        }
        tracing::debug!(
            event = StateEvent::LockAcquired.as_str(),
            key = %lock_key,
            wait_ms = started.elapsed().as_millis() as u64,
            lease_ttl_ms,
            "write lock acquired"
        );
        Ok(WriteLockGuard {
            core: Arc::clone(self),
            lock_key,
            owner_token,
        })
    }

    async fn release_lock(&self, lock_key: &str, owner_token: &str) -> Result<bool> {
        let released = self
            .run_command::<i64, _>("lock_release", || {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(RELEASE_LOCK_SCRIPT)
                    .arg(1)
                    .arg(lock_key)
                    .arg(owner_token);
                cmd
            })
            .await?;
        Ok(released == 1)
    }

    async fn read_list(&self, operation: &'static str, key: &str, limit: usize) -> Result<Vec<String>> {
        let start = if limit == 0 { 0 } else { -(limit as i64) };
        self.run_command::<Vec<String>, _>(operation, || {
            let mut cmd = redis::cmd("LRANGE");
            cmd.arg(key).arg(start).arg(-1);
            cmd
        })
        .await
    }

    /// Whether any entry in the list carries `id` under `id_field`.
    /// Unparsable entries never match; reads skip them the same way.
    async fn list_contains_id(
        &self,
        operation: &'static str,
        key: &str,
        id_field: &str,
        id: &str,
    ) -> Result<bool> {
        let payloads = self.read_list(operation, key, 0).await?;
        Ok(payloads.iter().any(|payload| {
            serde_json::from_str::<serde_json::Value>(payload)
                .ok()
                .and_then(|value| {
                    value
                        .get(id_field)
                        .and_then(|v| v.as_str().map(|s| s == id))
                })
                .unwrap_or(false)
        }))
    }
}

#[async_trait]
impl StorageBackend for RedisStorage {
    async fn get_chat_state(&self, chat_id: &str) -> Result<Option<ChatState>> {
        let key = self.core.state_key(chat_id);
        let payload = self
            .core
            .run_command::<Option<String>, _>("get_chat_state", || {
                let mut cmd = redis::cmd("GET");
                cmd.arg(&key);
                cmd
            })
            .await?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        match serde_json::from_str::<ChatState>(&payload) {
            Ok(state) => Ok(Some(state)),
            Err(error) => {
                tracing::warn!(
                    event = StateEvent::CorruptedEntrySkipped.as_str(),
                    chat_id,
                    error = %error,
                    "unparsable chat state document; treating as absent"
                );
                Ok(None)
            }
        }
    }

    async fn set_chat_state(&self, chat_id: &str, state: &ChatState) -> Result<()> {
        let mut state = state.clone();
        state.mark_written(now_unix_ms());
        let key = self.core.state_key(chat_id);
        let payload = serde_json::to_string(&state)?;
        let ttl = self.core.cfg.ttl_secs;
        self.core
            .run_command::<(), _>("set_chat_state", || {
                let mut cmd = redis::cmd("SET");
                cmd.arg(&key).arg(&payload).arg("EX").arg(ttl);
                cmd
            })
            .await
    }

    async fn get_chat_history(&self, chat_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let key = self.core.history_key(chat_id);
        let payloads = self.core.read_list("get_chat_history", &key, limit).await?;
        let mut messages = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<ChatMessage>(&payload) {
                Ok(message) => messages.push(message),
                Err(error) => {
                    tracing::warn!(
                        event = StateEvent::CorruptedEntrySkipped.as_str(),
                        chat_id,
                        error = %error,
                        "unparsable chat message entry skipped"
                    );
                }
            }
        }
        messages.sort_by_key(|message| message.timestamp_ms);
        Ok(messages)
    }

    async fn add_chat_message(&self, chat_id: &str, message: &ChatMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let key = self.core.history_key(chat_id);
        let ttl = self.core.cfg.ttl_secs;
        let _guard = self.core.acquire_lock("chat_write", chat_id).await?;
        if self
            .core
            .list_contains_id("add_chat_message_scan", &key, "message_id", &message.message_id)
            .await?
        {
            tracing::debug!(
                event = StateEvent::DuplicateMessageSkipped.as_str(),
                chat_id,
                message_id = %message.message_id,
                "duplicate message skipped"
            );
            return Ok(());
        }
        self.core
            .run_pipeline::<(), _>("add_chat_message", || {
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.cmd("RPUSH").arg(&key).arg(&payload).ignore();
                pipe.cmd("EXPIRE").arg(&key).arg(ttl).ignore();
                pipe
            })
            .await?;
        tracing::debug!(
            event = StateEvent::MessageAppended.as_str(),
            chat_id,
            message_id = %message.message_id,
            ttl_secs = ttl,
            "chat message appended"
        );
        Ok(())
    }

    async fn get_tool_history(&self, chat_id: &str, limit: usize) -> Result<Vec<ToolCallRecord>> {
        let key = self.core.tools_key(chat_id);
        let payloads = self.core.read_list("get_tool_history", &key, limit).await?;
        let mut records = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<ToolCallRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(error) => {
                    tracing::warn!(
                        event = StateEvent::CorruptedEntrySkipped.as_str(),
                        chat_id,
                        error = %error,
                        "unparsable tool call record skipped"
                    );
                }
            }
        }
        records.sort_by_key(|record| record.timestamp_ms);
        Ok(records)
    }

    async fn add_tool_call(&self, chat_id: &str, record: &ToolCallRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let key = self.core.tools_key(chat_id);
        let ttl = self.core.cfg.ttl_secs;
        let _guard = self.core.acquire_lock("tool_write", chat_id).await?;
        if self
            .core
            .list_contains_id(
                "add_tool_call_scan",
                &key,
                "tool_call_id",
                &record.tool_call_id,
            )
            .await?
        {
            tracing::debug!(
                event = StateEvent::DuplicateToolCallSkipped.as_str(),
                chat_id,
                tool_call_id = %record.tool_call_id,
                "duplicate tool call skipped"
            );
            return Ok(());
        }
        self.core
            .run_pipeline::<(), _>("add_tool_call", || {
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.cmd("RPUSH").arg(&key).arg(&payload).ignore();
                pipe.cmd("EXPIRE").arg(&key).arg(ttl).ignore();
                pipe
            })
            .await
    }

    async fn trim_history(&self, chat_id: &str, limit: usize) -> Result<()> {
        let history_key = self.core.history_key(chat_id);
        let tools_key = self.core.tools_key(chat_id);
        let ttl = self.core.cfg.ttl_secs;
        let _guard = self.core.acquire_lock("trim", chat_id).await?;
        if limit == 0 {
            self.core
                .run_pipeline::<(), _>("trim_history_clear", || {
                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    pipe.cmd("DEL").arg(&history_key).ignore();
                    pipe.cmd("DEL").arg(&tools_key).ignore();
                    pipe
                })
                .await?;
        } else {
            let keep = -(limit as i64);
            self.core
                .run_pipeline::<(), _>("trim_history", || {
                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    pipe.cmd("LTRIM").arg(&history_key).arg(keep).arg(-1).ignore();
                    pipe.cmd("LTRIM").arg(&tools_key).arg(keep).arg(-1).ignore();
                    pipe.cmd("EXPIRE").arg(&history_key).arg(ttl).ignore();
                    pipe.cmd("EXPIRE").arg(&tools_key).arg(ttl).ignore();
                    pipe
                })
                .await?;
        }
        tracing::debug!(
            event = StateEvent::HistoryTrimmed.as_str(),
            chat_id,
            limit,
            "history trimmed"
        );
        Ok(())
    }

    async fn atomic_turn_operation(&self, chat_id: &str, ops: Vec<TurnOperation>) -> Result<()> {
        enum Step {
            History(String),
            Tools(String),
            State(String),
        }
        let mut steps = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TurnOperation::AddMessage(message) => {
                    steps.push(Step::History(serde_json::to_string(&message)?));
                }
                TurnOperation::AddToolCall(record) => {
                    steps.push(Step::Tools(serde_json::to_string(&record)?));
                }
                TurnOperation::UpdateState(mut state) => {
                    state.mark_written(now_unix_ms());
                    steps.push(Step::State(serde_json::to_string(&state)?));
                }
            }
        }
        let state_key = self.core.state_key(chat_id);
        let history_key = self.core.history_key(chat_id);
        let tools_key = self.core.tools_key(chat_id);
        let ttl = self.core.cfg.ttl_secs;
        let op_count = steps.len();
        let _guard = self.core.acquire_lock("turn", chat_id).await?;
        self.core
            .run_pipeline::<(), _>("atomic_turn_operation", || {
                let mut pipe = redis::pipe();
                pipe.atomic();
                for step in &steps {
                    match step {
                        Step::History(payload) => {
                            pipe.cmd("RPUSH").arg(&history_key).arg(payload).ignore();
                        }
                        Step::Tools(payload) => {
                            pipe.cmd("RPUSH").arg(&tools_key).arg(payload).ignore();
                        }
                        Step::State(payload) => {
                            pipe.cmd("SET").arg(&state_key).arg(payload).arg("EX").arg(ttl).ignore();
                        }
                    }
                }
                pipe.cmd("EXPIRE").arg(&history_key).arg(ttl).ignore();
                pipe.cmd("EXPIRE").arg(&tools_key).arg(ttl).ignore();
                pipe
            })
            .await?;
        tracing::debug!(
            event = StateEvent::AtomicTurnOperation.as_str(),
            chat_id,
            op_count,
            "atomic turn operations applied"
        );
        Ok(())
    }

    async fn health_check(&self) -> Result<StorageHealth> {
        let started = Instant::now();
        let ping = self
            .core
            .run_command::<String, _>("health_check", || redis::cmd("PING"))
            .await;
        match ping {
            Ok(_) => Ok(StorageHealth {
                healthy: true,
                latency_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
                detail: None,
            }),
            Err(error) => Ok(StorageHealth {
                healthy: false,
                latency_ms: None,
                detail: Some(error.to_string()),
            }),
        }
    }

    async fn get_chat_metadata(&self, chat_id: &str) -> Result<ChatMetadata> {
        let state_key = self.core.state_key(chat_id);
        let history_key = self.core.history_key(chat_id);
        let tools_key = self.core.tools_key(chat_id);
        let (message_count, tool_call_count, state_payload) = self
            .core
            .run_pipeline::<(usize, usize, Option<String>), _>("get_chat_metadata", || {
                let mut pipe = redis::pipe();
                pipe.cmd("LLEN").arg(&history_key);
                pipe.cmd("LLEN").arg(&tools_key);
                pipe.cmd("GET").arg(&state_key);
                pipe
            })
            .await?;
        let state = state_payload
            .as_deref()
            .and_then(|payload| serde_json::from_str::<ChatState>(payload).ok());
        Ok(ChatMetadata {
            chat_id: chat_id.to_string(),
            message_count,
            tool_call_count,
            last_activity_ms: state.as_ref().map(|s| s.updated_at_ms),
            has_state: state_payload.is_some(),
        })
    }
}

/// Globally unique owner token so one holder's release can never delete
/// another holder's lock.
fn next_lock_owner_token() -> String {
    let seq = NEXT_LOCK_OWNER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}:{}:{seq}",
        Uuid::new_v4().simple(),
        std::process::id()
    )
}

#[cfg(test)]
#[path = "../../tests/unit/storage_redis.rs"]
mod tests;
