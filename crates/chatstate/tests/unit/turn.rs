use super::*;

fn open_turn_with_calls(calls: &[&str]) -> TurnMetadata {
    let mut turn = TurnMetadata::new("turn_1", "msg_user");
    turn.set_assistant_reply(
        "msg_assistant",
        calls.iter().map(ToString::to_string).collect(),
    );
    turn
}

#[test]
fn reply_without_tool_calls_completes_immediately() {
    let mut turn = TurnMetadata::new("turn_1", "msg_user");
    assert!(!turn.is_complete);
    turn.set_assistant_reply("msg_assistant", Vec::new());
    assert!(turn.is_complete);
    assert!(turn.completed_at_ms.is_some());
}

#[test]
fn completion_flips_exactly_once_at_the_last_result() {
    let mut turn = open_turn_with_calls(&["call_1", "call_2"]);
    assert_eq!(turn.record_tool_result("call_1"), ToolResultAck::Pending);
    assert!(!turn.is_complete);
    assert_eq!(turn.record_tool_result("call_2"), ToolResultAck::Completed);
    assert!(turn.is_complete);
    // Later deliveries never report completion again.
    assert_eq!(turn.record_tool_result("call_2"), ToolResultAck::Duplicate);
    assert!(turn.is_complete);
}

#[test]
fn repeated_announced_ids_count_once_toward_completion() {
    let mut turn = open_turn_with_calls(&["call_1", "call_1", "call_2"]);
    assert_eq!(turn.expected_tool_calls, vec!["call_1", "call_2"]);
    assert_eq!(turn.record_tool_result("call_1"), ToolResultAck::Pending);
    assert_eq!(turn.record_tool_result("call_2"), ToolResultAck::Completed);
    assert!(turn.is_complete);
}

#[test]
fn unexpected_id_is_rejected_without_mutation() {
    let mut turn = open_turn_with_calls(&["call_1"]);
    assert_eq!(turn.record_tool_result("call_9"), ToolResultAck::Unexpected);
    assert!(turn.completed_tool_results.is_empty());
    assert!(!turn.is_complete);
}

#[test]
fn duplicate_result_is_acknowledged_but_not_recounted() {
    let mut turn = open_turn_with_calls(&["call_1", "call_2"]);
    assert_eq!(turn.record_tool_result("call_1"), ToolResultAck::Pending);
    assert_eq!(turn.record_tool_result("call_1"), ToolResultAck::Duplicate);
    assert_eq!(turn.completed_tool_results.len(), 1);
    assert!(!turn.is_complete);
}

#[test]
fn mark_complete_is_idempotent_and_keeps_first_timestamp() {
    let mut turn = open_turn_with_calls(&["call_1"]);
    turn.mark_complete();
    let first = turn.completed_at_ms;
    turn.mark_complete();
    assert_eq!(turn.completed_at_ms, first);
    assert!(turn.is_complete);
}

#[test]
fn age_is_relative_and_saturating() {
    let turn = TurnMetadata::new("turn_1", "msg_user");
    assert_eq!(turn.age_ms(turn.created_at_ms), 0);
    assert_eq!(turn.age_ms(turn.created_at_ms + 500), 500);
    // A clock running backwards never yields a huge age.
    assert_eq!(turn.age_ms(turn.created_at_ms.saturating_sub(100)), 0);
}
