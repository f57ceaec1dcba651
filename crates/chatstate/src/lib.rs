//! Turn-based conversation state engine for tool-calling LLM agents.
//!
//! A chat advances in turns: a user message opens the turn, an assistant
//! reply optionally announces tool calls, and the turn completes once
//! every announced call has reported a result (or completion is forced).
//! The engine persists per-chat state documents, an append-only message
//! log and a tool-call audit log behind the [`storage::StorageBackend`]
//! trait, with a Redis/Valkey backend for multi-instance deployments and
//! an in-memory backend for tests and single-process use.
//!
//! The main entry points are [`service::ChatStateService`] for the turn
//! lifecycle and context reads, and [`executor::ToolCallExecutor`] for
//! running announced tool calls concurrently with timeout, retry and
//! synthetic-failure semantics.

pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod message;
pub mod observability;
pub mod service;
pub mod state;
pub mod storage;
pub mod turn;

pub use config::{EngineConfig, RedisStorageConfig};
pub use error::{Result, StateError};
pub use executor::{Tool, ToolCallExecutor, ToolPassOutcome, ToolRegistry};
pub use message::{ChatMessage, FunctionCall, Role, ToolCallOut, ToolCallRecord};
pub use service::{
    ChatStateService, FullContext, HistoryQuery, StartedTurn, ToolOutcome, ToolResultDelivery,
};
pub use state::ChatState;
pub use storage::{
    ChatMetadata, MemoryStorage, RedisStorage, StorageBackend, StorageHealth, TurnOperation,
};
pub use turn::{ToolResultAck, TurnMetadata};
