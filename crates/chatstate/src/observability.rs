//! Stable event names for structured tracing fields.

/// Engine lifecycle events, logged as `event = StateEvent::X.as_str()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// Storage backend connection established.
    StorageConnected,
    /// Storage command attempt failed; reconnecting/retrying.
    StorageCommandRetried,
    /// Storage command failed after exhausting retries.
    StorageCommandFailed,
    /// Distributed lock acquired.
    LockAcquired,
    /// Distributed lock not acquired within the timeout.
    LockTimeout,
    /// Distributed lock released (or release attempted).
    LockReleased,
    /// Message appended to the chat history log.
    MessageAppended,
    /// Append skipped: a message with the same id already exists.
    DuplicateMessageSkipped,
    /// Audit append skipped: a record with the same tool-call id exists.
    DuplicateToolCallSkipped,
    /// Unparsable persisted entry skipped during a read.
    CorruptedEntrySkipped,
    /// History logs trimmed.
    HistoryTrimmed,
    /// Batched turn operations executed atomically.
    AtomicTurnOperation,
    /// New turn opened.
    TurnStarted,
    /// Assistant message recorded into a turn.
    AssistantMessageAdded,
    /// Tool result accepted into a turn.
    ToolResultRecorded,
    /// Turn reached completion.
    TurnCompleted,
    /// Turn completed by force (error, timeout or cleanup).
    TurnForceCompleted,
    /// Write referenced an unknown or already-completed turn.
    TurnNotFound,
    /// Tool result dropped: id not expected by the turn.
    UnexpectedToolResult,
    /// Aged-out in-memory turn swept and force-completed.
    OrphanedTurnCleaned,
    /// Orphaned tool result dropped during history repair.
    OrphanedToolResultSkipped,
    /// Unresolved tool-calling step dropped during history repair.
    IncompleteToolCallRemoved,
    /// Leading assistant/tool message without a user turn dropped.
    OrphanedMessageSkipped,
    /// Default chat-state document lazily created.
    ChatStateCreated,
    /// Chat-state document patched.
    ChatStateUpdated,
    /// All persisted data for a chat reset.
    ChatDataCleared,
    /// Tool call attempt failed; retrying.
    ToolCallRetried,
    /// Tool call failed terminally; synthetic result emitted.
    ToolCallFailed,
    /// Tool call succeeded.
    ToolCallSucceeded,
    /// Audit-log write failed (absorbed, best-effort).
    AuditWriteFailed,
}

impl StateEvent {
    /// Stable dotted event name for log pipelines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StorageConnected => "storage.connected",
            Self::StorageCommandRetried => "storage.command.retried",
            Self::StorageCommandFailed => "storage.command.failed",
            Self::LockAcquired => "storage.lock.acquired",
            Self::LockTimeout => "storage.lock.timeout",
            Self::LockReleased => "storage.lock.released",
            Self::MessageAppended => "history.message.appended",
            Self::DuplicateMessageSkipped => "history.message.duplicate_skipped",
            Self::DuplicateToolCallSkipped => "audit.tool_call.duplicate_skipped",
            Self::CorruptedEntrySkipped => "history.entry.corrupted_skipped",
            Self::HistoryTrimmed => "history.trimmed",
            Self::AtomicTurnOperation => "storage.turn_operation.applied",
            Self::TurnStarted => "turn.started",
            Self::AssistantMessageAdded => "turn.assistant_message.added",
            Self::ToolResultRecorded => "turn.tool_result.recorded",
            Self::TurnCompleted => "turn.completed",
            Self::TurnForceCompleted => "turn.force_completed",
            Self::TurnNotFound => "turn.not_found",
            Self::UnexpectedToolResult => "turn.tool_result.unexpected",
            Self::OrphanedTurnCleaned => "turn.orphan.cleaned",
            Self::OrphanedToolResultSkipped => "repair.tool_result.orphan_skipped",
            Self::IncompleteToolCallRemoved => "repair.tool_call.incomplete_removed",
            Self::OrphanedMessageSkipped => "repair.message.orphan_skipped",
            Self::ChatStateCreated => "state.created",
            Self::ChatStateUpdated => "state.updated",
            Self::ChatDataCleared => "state.cleared",
            Self::ToolCallRetried => "executor.tool_call.retried",
            Self::ToolCallFailed => "executor.tool_call.failed",
            Self::ToolCallSucceeded => "executor.tool_call.succeeded",
            Self::AuditWriteFailed => "executor.audit.write_failed",
        }
    }
}
