//! Concurrent tool-call executor.
//!
//! Runs every tool call of one assistant turn-step concurrently, each with
//! its own timeout and retry budget, and converts every failure into a
//! synthetic `role=tool` result message. The conversation loop never
//! special-cases a failed tool: it always receives one result message per
//! requested call, in request order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::task::JoinSet;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::message::{ChatMessage, ToolCallOut, ToolCallRecord};
use crate::observability::StateEvent;
use crate::service::{ChatStateService, ToolOutcome};

/// A callable capability: takes a keyword/value argument map, returns a
/// JSON-serializable result or an error.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Invoke the tool with parsed arguments.
    async fn invoke(&self, args: &Map<String, Value>) -> anyhow::Result<Value>;
}

/// Registered capabilities, name to tool. Populated at construction;
/// lookups at dispatch time are read-only.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, tool: Arc<dyn Tool>) {
        self.tools.insert(name.into(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }
}

/// Combined result of executing all tool calls of one turn-step.
#[derive(Debug)]
pub struct ToolPassOutcome {
    /// One `role=tool` message per requested call, in request order.
    /// Synthetic failure messages included.
    pub messages: Vec<ChatMessage>,
    /// Whether delivering these results completed the turn.
    pub turn_completed: bool,
}

/// One attempt at invoking a tool. Retry logic branches on this value;
/// no error type doubles as control flow.
enum CallAttempt {
    Ok(Value),
    TimedOut,
    Failed(String),
}

struct CallResult {
    tool_name: String,
    tool_call_id: String,
    arguments: Value,
    outcome: ToolOutcome,
    duration_ms: u64,
}

/// Executes the tool calls an assistant message announced, delivering each
/// result into the turn via the state service.
pub struct ToolCallExecutor {
    service: Arc<ChatStateService>,
    registry: Arc<ToolRegistry>,
}

impl ToolCallExecutor {
    /// Build an executor over a service and a fixed tool registry.
    pub fn new(service: Arc<ChatStateService>, registry: Arc<ToolRegistry>) -> Self {
        Self { service, registry }
    }

    /// Execute `calls` concurrently and deliver every result into the
    /// turn. Tool failures become synthetic result messages; only a
    /// storage or lock failure surfaces as `Err`, after force-completing
    /// the turn so it is not left open.
    pub async fn execute_calls(
        &self,
        chat_id: &str,
        turn_id: &str,
        calls: &[ToolCallOut],
    ) -> Result<ToolPassOutcome> {
        if calls.is_empty() {
            return Ok(ToolPassOutcome {
                messages: Vec::new(),
                turn_completed: false,
            });
        }

        let mut join_set: JoinSet<(usize, CallResult)> = JoinSet::new();
        let mut index_by_task = HashMap::new();
        for (index, call) in calls.iter().enumerate() {
            let registry = Arc::clone(&self.registry);
            let config = self.service.config().clone();
            let call = call.clone();
            let handle = join_set.spawn(async move {
                let result = run_single_call(&registry, &config, &call).await;
                (index, result)
            });
            index_by_task.insert(handle.id(), index);
        }

        // Reassemble in request order; a panicked task becomes a synthetic
        // failure for its slot like any other error.
        let mut slots: Vec<Option<CallResult>> = calls.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((_, (index, result))) => {
                    slots[index] = Some(result);
                }
                Err(join_error) => {
                    let Some(&index) = index_by_task.get(&join_error.id()) else {
                        continue;
                    };
                    let call = &calls[index];
                    tracing::warn!(
                        event = StateEvent::ToolCallFailed.as_str(),
                        chat_id,
                        turn_id,
                        tool_call_id = %call.id,
                        tool_name = %call.function.name,
                        error = %join_error,
                        "tool call task panicked"
                    );
                    slots[index] = Some(CallResult {
                        tool_name: call.function.name.clone(),
                        tool_call_id: call.id.clone(),
                        arguments: Value::String(call.function.arguments.clone()),
                        outcome: ToolOutcome::Failure(format!(
                            "Tool call failed: internal error in tool '{}'",
                            call.function.name
                        )),
                        duration_ms: 0,
                    });
                }
            }
        }

        let mut messages = Vec::with_capacity(calls.len());
        let mut turn_completed = false;
        for slot in slots {
            let Some(result) = slot else {
                continue;
            };
            let record = match &result.outcome {
                ToolOutcome::Success(value) => ToolCallRecord::success(
                    &result.tool_call_id,
                    &result.tool_name,
                    result.arguments.clone(),
                    value.clone(),
                    result.duration_ms,
                ),
                ToolOutcome::Failure(error) => ToolCallRecord::failure(
                    &result.tool_call_id,
                    &result.tool_name,
                    result.arguments.clone(),
                    error.clone(),
                    result.duration_ms,
                ),
            };
            self.service.record_tool_call(chat_id, &record).await;

            let delivered = self
                .service
                .add_tool_result(
                    chat_id,
                    turn_id,
                    &result.tool_call_id,
                    &result.tool_name,
                    &result.outcome,
                )
                .await;
            match delivered {
                Ok(delivery) => {
                    turn_completed |= delivery.turn_completed;
                    // The persisted message carries the canonical id; a
                    // rejected (stale) delivery still yields a message so
                    // every requested call gets a result.
                    let message = delivery.message.unwrap_or_else(|| {
                        ChatMessage::tool(
                            turn_id,
                            &result.tool_call_id,
                            &result.tool_name,
                            result.outcome.content(),
                            result.outcome.error(),
                        )
                    });
                    messages.push(message);
                }
                Err(error) => {
                    self.service.force_complete_turn(chat_id, turn_id).await;
                    return Err(error);
                }
            }
        }
        Ok(ToolPassOutcome {
            messages,
            turn_completed,
        })
    }
}

/// Run one tool call to its final outcome: parse arguments, then invoke
/// under a per-attempt timeout with bounded retries. Unknown tools and
/// unparsable arguments are terminal; timeouts and invocation errors are
/// retried identically.
async fn run_single_call(
    registry: &ToolRegistry,
    config: &EngineConfig,
    call: &ToolCallOut,
) -> CallResult {
    let tool_name = call.function.name.clone();
    let tool_call_id = call.id.clone();
    let started = Instant::now();

    let Some(tool) = registry.get(&tool_name) else {
        tracing::warn!(
            event = StateEvent::ToolCallFailed.as_str(),
            tool_call_id = %tool_call_id,
            tool_name = %tool_name,
            "tool not registered"
        );
        return CallResult {
            tool_name: tool_name.clone(),
            tool_call_id,
            arguments: Value::String(call.function.arguments.clone()),
            outcome: ToolOutcome::Failure(format!("Tool '{tool_name}' is not registered")),
            duration_ms: 0,
        };
    };

    let args = match parse_arguments(&call.function.arguments) {
        Ok(args) => args,
        Err(error) => {
            tracing::warn!(
                event = StateEvent::ToolCallFailed.as_str(),
                tool_call_id = %tool_call_id,
                tool_name = %tool_name,
                error = %error,
                "unparsable tool arguments"
            );
            return CallResult {
                tool_name,
                tool_call_id,
                arguments: Value::String(call.function.arguments.clone()),
                outcome: ToolOutcome::Failure(format!("Invalid tool arguments: {error}")),
                duration_ms: 0,
            };
        }
    };
    let arguments = Value::Object(args.clone());

    let attempts = config.tool_retry_attempts.max(1);
    let mut last_failure = String::new();
    for attempt in 1..=attempts {
        let attempt_result =
            match tokio::time::timeout(config.tool_timeout(), tool.invoke(&args)).await {
                Ok(Ok(value)) => CallAttempt::Ok(value),
                Ok(Err(error)) => CallAttempt::Failed(error.to_string()),
                Err(_) => CallAttempt::TimedOut,
            };
        match attempt_result {
            CallAttempt::Ok(value) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(
                    event = StateEvent::ToolCallSucceeded.as_str(),
                    tool_call_id = %tool_call_id,
                    tool_name = %tool_name,
                    attempt,
                    duration_ms,
                    "tool call succeeded"
                );
                return CallResult {
                    tool_name,
                    tool_call_id,
                    arguments,
                    outcome: ToolOutcome::Success(value),
                    duration_ms,
                };
            }
            CallAttempt::TimedOut => {
                last_failure = format!("Tool call timed out after {}s", config.tool_timeout_secs);
            }
            CallAttempt::Failed(error) => {
                last_failure = format!("Tool call failed after {attempts} attempts: {error}");
            }
        }
        if attempt < attempts {
            tracing::warn!(
                event = StateEvent::ToolCallRetried.as_str(),
                tool_call_id = %tool_call_id,
                tool_name = %tool_name,
                attempt,
                attempts,
                "tool call attempt failed; retrying"
            );
            tokio::time::sleep(config.tool_retry_base_delay() * 2u32.pow(attempt - 1)).await;
        }
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    tracing::warn!(
        event = StateEvent::ToolCallFailed.as_str(),
        tool_call_id = %tool_call_id,
        tool_name = %tool_name,
        attempts,
        duration_ms,
        error = %last_failure,
        "tool call failed; emitting synthetic result"
    );
    CallResult {
        tool_name,
        tool_call_id,
        arguments,
        outcome: ToolOutcome::Failure(last_failure),
        duration_ms,
    }
}

/// Parse the LLM-supplied argument string. An empty string means no
/// arguments; anything else must be a JSON object.
fn parse_arguments(raw: &str) -> std::result::Result<Map<String, Value>, serde_json::Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str::<Map<String, Value>>(trimmed)
}
