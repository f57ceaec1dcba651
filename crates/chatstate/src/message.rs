//! Message and tool-call types (OpenAI-compatible wire shapes).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current wall-clock time as unix milliseconds.
pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn new_message_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("msg_{}", &hex[..12])
}

pub(crate) fn new_turn_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("turn_{}", &hex[..12])
}

/// Message role within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End-user request.
    User,
    /// Model reply, possibly announcing tool calls.
    Assistant,
    /// Result of one tool call, resolving an announced tool-call id.
    Tool,
}

/// One message in the chat-scoped, append-only history log.
///
/// Created once and immutable thereafter; a `tool` message's `tool_call_id`
/// must reference a call announced by an earlier `assistant` message in the
/// same turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique id, used for idempotent appends.
    pub message_id: String,
    /// Owning turn, when written through the turn lifecycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    /// Role: user, assistant or tool.
    pub role: Role,
    /// Text content (may be absent when `tool_calls` is present).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls announced by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallOut>>,
    /// Tool call id this message resolves (tool role only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name (tool role only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Error string when the tool call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation time, unix milliseconds; history reads order by this.
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl ChatMessage {
    /// Build a user message opening a turn.
    pub fn user(turn_id: &str, content: impl Into<String>) -> Self {
        Self {
            message_id: new_message_id(),
            turn_id: Some(turn_id.to_string()),
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            error: None,
            timestamp_ms: now_unix_ms(),
        }
    }

    /// Build an assistant message, optionally announcing tool calls.
    pub fn assistant(
        turn_id: &str,
        content: impl Into<String>,
        tool_calls: Option<Vec<ToolCallOut>>,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            turn_id: Some(turn_id.to_string()),
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: tool_calls.filter(|calls| !calls.is_empty()),
            tool_call_id: None,
            name: None,
            error: None,
            timestamp_ms: now_unix_ms(),
        }
    }

    /// Build a tool result message resolving `tool_call_id`.
    pub fn tool(
        turn_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        content: impl Into<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            turn_id: Some(turn_id.to_string()),
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
            name: Some(tool_name.to_string()),
            error,
            timestamp_ms: now_unix_ms(),
        }
    }

    /// Whether this assistant message announces at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

/// Tool call announced by an assistant message (OpenAI format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallOut {
    /// Unique id for this tool call.
    pub id: String,
    /// Type (e.g. "function").
    #[serde(rename = "type")]
    pub typ: String,
    /// Function name and arguments.
    pub function: FunctionCall,
}

impl ToolCallOut {
    /// Build a function-typed tool call.
    pub fn function(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            id: id.to_string(),
            typ: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }
}

/// Function call payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Tool/function name.
    pub name: String,
    /// JSON string of arguments.
    pub arguments: String,
}

/// One executed tool invocation, recorded in the chat-scoped audit log.
///
/// Non-authoritative: the conversational `tool` message is the source of
/// truth; this log exists for analytics and is separately trimmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Tool call id this record belongs to; used for idempotent appends.
    pub tool_call_id: String,
    /// Tool name.
    pub tool_name: String,
    /// Parsed arguments the tool was invoked with.
    #[serde(default)]
    pub arguments: serde_json::Value,
    /// Successful result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error string when the invocation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Record time, unix milliseconds.
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl ToolCallRecord {
    /// Build a success record.
    pub fn success(
        tool_call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        result: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments,
            result: Some(result),
            error: None,
            duration_ms: Some(duration_ms),
            timestamp_ms: now_unix_ms(),
        }
    }

    /// Build a failure record.
    pub fn failure(
        tool_call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments,
            result: None,
            error: Some(error.into()),
            duration_ms: Some(duration_ms),
            timestamp_ms: now_unix_ms(),
        }
    }
}
