use super::*;

use crate::message::ToolCallOut;

fn user(text: &str) -> ChatMessage {
    ChatMessage::user("turn_1", text)
}

fn assistant(text: &str) -> ChatMessage {
    ChatMessage::assistant("turn_1", text, None)
}

fn assistant_calling(call_ids: &[&str]) -> ChatMessage {
    let calls = call_ids
        .iter()
        .map(|id| ToolCallOut::function(id, "faq", "{}"))
        .collect();
    ChatMessage::assistant("turn_1", "", Some(calls))
}

fn tool_result(call_id: &str) -> ChatMessage {
    ChatMessage::tool("turn_1", call_id, "faq", "ok", None)
}

fn ids(messages: &[ChatMessage]) -> Vec<String> {
    messages.iter().map(|m| m.message_id.clone()).collect()
}

#[test]
fn valid_history_passes_through_unchanged() {
    let history = vec![
        user("hi"),
        assistant_calling(&["call_1"]),
        tool_result("call_1"),
        assistant("done"),
    ];
    let expected = ids(&history);
    let repaired = repair_tool_call_pairing(history);
    assert_eq!(ids(&repaired), expected);
}

#[test]
fn orphaned_tool_result_is_dropped() {
    let history = vec![user("hi"), tool_result("call_ghost"), assistant("done")];
    let repaired = repair_tool_call_pairing(history);
    assert_eq!(repaired.len(), 2);
    assert!(repaired.iter().all(|m| m.role != Role::Tool));
}

#[test]
fn unresolved_step_at_end_is_dropped_with_partial_results() {
    // Two announced calls, one resolved: both the announcement and the
    // partial result must go.
    let history = vec![assistant_calling(&["call_1", "call_2"]), tool_result("call_1")];
    let repaired = repair_tool_call_pairing(history);
    assert!(repaired.is_empty());
}

#[test]
fn unresolved_step_is_dropped_when_next_user_message_arrives() {
    let next_user = user("second question");
    let next_user_id = next_user.message_id.clone();
    let history = vec![
        user("first question"),
        assistant_calling(&["call_1", "call_2"]),
        tool_result("call_1"),
        next_user,
        assistant("answer to the second"),
    ];
    let repaired = repair_tool_call_pairing(history);
    assert_eq!(repaired.len(), 3);
    assert_eq!(repaired[1].message_id, next_user_id);
    assert!(repaired.iter().all(|m| !m.has_tool_calls()));
}

#[test]
fn repair_is_idempotent() {
    let history = vec![
        user("hi"),
        assistant_calling(&["call_1", "call_2"]),
        tool_result("call_1"),
        user("again"),
        assistant_calling(&["call_3"]),
        tool_result("call_3"),
        assistant("done"),
    ];
    let once = repair_tool_call_pairing(history);
    let twice = repair_tool_call_pairing(once.clone());
    assert_eq!(ids(&once), ids(&twice));
}

#[test]
fn windowing_keeps_only_the_last_k_turns_in_order() {
    let mut history = Vec::new();
    for i in 0..5 {
        history.push(user(&format!("question {i}")));
        if i % 2 == 0 {
            history.push(assistant_calling(&[&format!("call_{i}")]));
            history.push(tool_result(&format!("call_{i}")));
        }
        history.push(assistant(&format!("answer {i}")));
    }
    let expected: Vec<String> = ids(&history[history.len() - 6..]);
    let windowed = window_last_turns(history, 2);
    // Turn 3: user + assistant. Turn 4: user + assistant(call) + tool + assistant.
    assert_eq!(ids(&windowed), expected);
}

#[test]
fn windowing_drops_leading_orphans() {
    let history = vec![assistant("dangling"), tool_result("call_0"), user("hi"), assistant("yo")];
    let windowed = window_last_turns(history, 10);
    assert_eq!(windowed.len(), 2);
    assert_eq!(windowed[0].role, Role::User);
}

#[test]
fn windowing_with_zero_keeps_all_turns_but_drops_leading_orphans() {
    let history = vec![assistant("dangling"), user("hi"), assistant("yo"), user("more"), assistant("sure")];
    let expected = ids(&history)[1..].to_vec();
    assert_eq!(ids(&window_last_turns(history, 0)), expected);
}

#[test]
fn strip_tool_messages_removes_all_tool_traffic() {
    let history = vec![
        user("hi"),
        assistant_calling(&["call_1"]),
        tool_result("call_1"),
        assistant("done"),
    ];
    let stripped = strip_tool_messages(history);
    assert_eq!(stripped.len(), 2);
    assert_eq!(stripped[0].role, Role::User);
    assert_eq!(stripped[1].role, Role::Assistant);
    assert!(!stripped[1].has_tool_calls());
}
