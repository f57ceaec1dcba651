#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chatstate::{
    ChatStateService, EngineConfig, HistoryQuery, MemoryStorage, Role, StateError, ToolCallOut,
    ToolOutcome,
};
use serde_json::json;

fn service() -> ChatStateService {
    ChatStateService::new(Arc::new(MemoryStorage::new()), EngineConfig::default())
}

fn patch(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

#[tokio::test]
async fn turn_with_tool_call_completes_on_last_result() -> Result<()> {
    let service = service();
    let started = service.start_turn("chat1", "Hi").await?;
    assert_eq!(service.active_turn_count("chat1").await, 1);

    service
        .add_assistant_message(
            "chat1",
            &started.turn_id,
            "",
            Some(vec![ToolCallOut::function("call_1", "faq", "{}")]),
        )
        .await?;
    assert_eq!(service.active_turn_count("chat1").await, 1);

    let delivery = service
        .add_tool_result(
            "chat1",
            &started.turn_id,
            "call_1",
            "faq",
            &ToolOutcome::Success(json!({"answer": "42"})),
        )
        .await?;
    assert!(delivery.accepted);
    assert!(delivery.turn_completed);
    assert_eq!(service.active_turn_count("chat1").await, 0);

    let history = service
        .get_chat_history("chat1", &HistoryQuery::default())
        .await?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[2].role, Role::Tool);
    assert_eq!(history[2].tool_call_id.as_deref(), Some("call_1"));
    // The delivery hands back the message as persisted.
    assert_eq!(
        delivery.message.map(|m| m.message_id),
        Some(history[2].message_id.clone())
    );
    Ok(())
}

#[tokio::test]
async fn duplicate_announced_ids_do_not_wedge_the_turn() -> Result<()> {
    let service = service();
    let started = service.start_turn("chat1", "Hi").await?;
    service
        .add_assistant_message(
            "chat1",
            &started.turn_id,
            "",
            Some(vec![
                ToolCallOut::function("call_1", "faq", "{}"),
                ToolCallOut::function("call_1", "faq", "{}"),
            ]),
        )
        .await?;

    // One result for the one distinct id must complete the turn.
    let delivery = service
        .add_tool_result(
            "chat1",
            &started.turn_id,
            "call_1",
            "faq",
            &ToolOutcome::Success(json!({})),
        )
        .await?;
    assert!(delivery.turn_completed);
    assert_eq!(service.active_turn_count("chat1").await, 0);
    Ok(())
}

#[tokio::test]
async fn turn_without_tool_calls_completes_immediately() -> Result<()> {
    let service = service();
    let started = service.start_turn("chat1", "Hi").await?;
    service
        .add_assistant_message("chat1", &started.turn_id, "Hello!", None)
        .await?;
    assert_eq!(service.active_turn_count("chat1").await, 0);
    Ok(())
}

#[tokio::test]
async fn assistant_message_for_unknown_turn_is_an_error() {
    let service = service();
    let result = service
        .add_assistant_message("chat1", "turn_missing", "Hello!", None)
        .await;
    assert!(matches!(result, Err(StateError::TurnNotFound { .. })));
}

#[tokio::test]
async fn stale_and_duplicate_tool_results_are_rejected_as_data() -> Result<()> {
    let service = service();

    // Unknown turn: logged, rejected, nothing persisted.
    let delivered = service
        .add_tool_result(
            "chat1",
            "turn_missing",
            "call_1",
            "faq",
            &ToolOutcome::Success(json!({})),
        )
        .await?;
    assert!(!delivered.accepted);
    assert!(delivered.message.is_none());

    let started = service.start_turn("chat1", "Hi").await?;
    service
        .add_assistant_message(
            "chat1",
            &started.turn_id,
            "",
            Some(vec![
                ToolCallOut::function("call_1", "faq", "{}"),
                ToolCallOut::function("call_2", "faq", "{}"),
            ]),
        )
        .await?;

    // Unexpected id.
    let delivered = service
        .add_tool_result(
            "chat1",
            &started.turn_id,
            "call_9",
            "faq",
            &ToolOutcome::Success(json!({})),
        )
        .await?;
    assert!(!delivered.accepted);

    // First delivery pending, duplicate ignored, last one completes.
    let outcome = ToolOutcome::Success(json!({"ok": true}));
    let first = service
        .add_tool_result("chat1", &started.turn_id, "call_1", "faq", &outcome)
        .await?;
    assert!(first.accepted);
    assert!(!first.turn_completed);
    let duplicate = service
        .add_tool_result("chat1", &started.turn_id, "call_1", "faq", &outcome)
        .await?;
    assert!(!duplicate.accepted);
    let last = service
        .add_tool_result("chat1", &started.turn_id, "call_2", "faq", &outcome)
        .await?;
    assert!(last.turn_completed);

    // The duplicate delivery must not have persisted a second message.
    let history = service
        .get_chat_history("chat1", &HistoryQuery::default())
        .await?;
    let call_1_results = history
        .iter()
        .filter(|m| m.tool_call_id.as_deref() == Some("call_1"))
        .count();
    assert_eq!(call_1_results, 1);
    Ok(())
}

#[tokio::test]
async fn force_complete_turn_is_idempotent() -> Result<()> {
    let service = service();
    let started = service.start_turn("chat1", "Hi").await?;
    assert!(service.force_complete_turn("chat1", &started.turn_id).await);
    assert!(!service.force_complete_turn("chat1", &started.turn_id).await);
    assert_eq!(service.active_turn_count("chat1").await, 0);
    Ok(())
}

#[tokio::test]
async fn cleanup_sweeps_aged_turns() -> Result<()> {
    let service = service();
    service.start_turn("chat1", "Hi").await?;
    service.start_turn("chat1", "Hi again").await?;
    assert_eq!(service.active_turn_count("chat1").await, 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let swept = service
        .cleanup_active_turns("chat1", Duration::from_millis(1))
        .await;
    assert_eq!(swept, 2);
    assert_eq!(service.active_turn_count("chat1").await, 0);

    // Fresh turns survive a generous max age.
    service.start_turn("chat1", "Hi once more").await?;
    let swept = service
        .cleanup_active_turns("chat1", Duration::from_secs(3600))
        .await;
    assert_eq!(swept, 0);
    assert_eq!(service.active_turn_count("chat1").await, 1);
    Ok(())
}

#[tokio::test]
async fn chat_state_is_lazily_created_and_patchable() -> Result<()> {
    let service = service();
    let state = service.get_chat_state("chat1").await?;
    assert_eq!(state.chat_id, "chat1");
    assert!(state.user_preferences.is_empty());

    service
        .update_chat_state("chat1", patch(json!({"user_preferences": {"lang": "en"}})))
        .await?;
    let state = service.get_chat_state("chat1").await?;
    assert_eq!(state.user_preferences["lang"], json!("en"));
    assert!(state.version >= 2);
    Ok(())
}

#[tokio::test]
async fn history_view_repairs_unresolved_steps_and_windows() -> Result<()> {
    let service = service();

    let first = service.start_turn("chat1", "first").await?;
    service
        .add_assistant_message("chat1", &first.turn_id, "first answer", None)
        .await?;

    // Second turn announces a call that never resolves.
    let second = service.start_turn("chat1", "second").await?;
    service
        .add_assistant_message(
            "chat1",
            &second.turn_id,
            "",
            Some(vec![ToolCallOut::function("call_1", "faq", "{}")]),
        )
        .await?;

    let history = service
        .get_chat_history("chat1", &HistoryQuery::default())
        .await?;
    // The unresolved announcement is dropped from the view.
    assert!(history.iter().all(|m| !m.has_tool_calls()));
    assert_eq!(history.len(), 3);

    let windowed = service
        .get_chat_history(
            "chat1",
            &HistoryQuery {
                k_turns: 1,
                ..HistoryQuery::default()
            },
        )
        .await?;
    assert_eq!(windowed.len(), 1);
    assert_eq!(windowed[0].content.as_deref(), Some("second"));
    Ok(())
}

#[tokio::test]
async fn full_context_optionally_includes_tool_history() -> Result<()> {
    let service = service();
    let started = service.start_turn("chat1", "Hi").await?;
    service
        .add_assistant_message(
            "chat1",
            &started.turn_id,
            "",
            Some(vec![ToolCallOut::function("call_1", "faq", "{}")]),
        )
        .await?;
    service
        .add_tool_result(
            "chat1",
            &started.turn_id,
            "call_1",
            "faq",
            &ToolOutcome::Success(json!({"answer": "42"})),
        )
        .await?;
    service
        .record_tool_call(
            "chat1",
            &chatstate::ToolCallRecord::success("call_1", "faq", json!({}), json!({"answer": "42"}), 5),
        )
        .await;

    // Default: tool messages stay in the history view, the audit log is
    // not fetched.
    let default_context = service
        .get_full_context("chat1", &HistoryQuery::default())
        .await?;
    assert_eq!(default_context.chat_state.chat_id, "chat1");
    assert!(default_context.tool_history.is_none());
    assert_eq!(default_context.chat_history.len(), 3);
    assert!(default_context.chat_history.iter().any(|m| m.role == Role::Tool));

    let with_audit = service
        .get_full_context(
            "chat1",
            &HistoryQuery {
                include_tool_history: true,
                ..HistoryQuery::default()
            },
        )
        .await?;
    assert_eq!(with_audit.tool_history.as_ref().map(Vec::len), Some(1));

    // The two knobs are independent: audit log without tool traffic.
    let audit_only = service
        .get_full_context(
            "chat1",
            &HistoryQuery {
                include_tool_calls: Some(false),
                include_tool_history: true,
                ..HistoryQuery::default()
            },
        )
        .await?;
    assert_eq!(audit_only.tool_history.as_ref().map(Vec::len), Some(1));
    assert!(audit_only.chat_history.iter().all(|m| m.role != Role::Tool));
    Ok(())
}

#[tokio::test]
async fn clear_chat_data_resets_everything() -> Result<()> {
    let service = service();
    let started = service.start_turn("chat1", "Hi").await?;
    service
        .update_chat_state("chat1", patch(json!({"conversation_context": {"topic": "x"}})))
        .await?;

    service.clear_chat_data("chat1").await?;
    assert_eq!(service.active_turn_count("chat1").await, 0);
    assert!(
        service
            .get_chat_history("chat1", &HistoryQuery::default())
            .await?
            .is_empty()
    );
    let state = service.get_chat_state("chat1").await?;
    assert!(state.conversation_context.is_empty());

    // The cleared turn is gone for good: late deliveries are rejected.
    let delivered = service
        .add_tool_result(
            "chat1",
            &started.turn_id,
            "call_1",
            "faq",
            &ToolOutcome::Success(json!({})),
        )
        .await?;
    assert!(!delivered.accepted);
    Ok(())
}

#[tokio::test]
async fn concurrent_turns_for_one_chat_are_independent() -> Result<()> {
    let service = Arc::new(service());
    let a = service.start_turn("chat1", "question a").await?;
    let b = service.start_turn("chat1", "question b").await?;
    assert_ne!(a.turn_id, b.turn_id);
    assert_eq!(service.active_turn_count("chat1").await, 2);

    service
        .add_assistant_message("chat1", &a.turn_id, "answer a", None)
        .await?;
    assert_eq!(service.active_turn_count("chat1").await, 1);
    service
        .add_assistant_message("chat1", &b.turn_id, "answer b", None)
        .await?;
    assert_eq!(service.active_turn_count("chat1").await, 0);
    Ok(())
}
