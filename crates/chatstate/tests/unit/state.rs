use serde_json::{Map, Value, json};

use super::*;

fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

#[test]
fn default_document_starts_at_version_zero() {
    let state = ChatState::create_default("chat1");
    assert_eq!(state.chat_id, "chat1");
    assert_eq!(state.version, 0);
    assert_eq!(state.created_at_ms, state.updated_at_ms);
    assert!(state.user_preferences.is_empty());
    assert!(state.conversation_context.is_empty());
    assert!(state.extra.is_empty());
}

#[test]
fn patch_replaces_known_maps_wholesale() {
    let mut state = ChatState::create_default("chat1");
    state.apply_patch(obj(json!({
        "user_preferences": {"lang": "en", "tone": "formal"},
    })));
    assert_eq!(state.user_preferences.len(), 2);

    state.apply_patch(obj(json!({
        "user_preferences": {"lang": "de"},
    })));
    assert_eq!(state.user_preferences.len(), 1);
    assert_eq!(state.user_preferences["lang"], json!("de"));
}

#[test]
fn patch_ignores_engine_owned_keys() {
    let mut state = ChatState::create_default("chat1");
    let created = state.created_at_ms;
    state.apply_patch(obj(json!({
        "chat_id": "evil",
        "created_at_ms": 1,
        "updated_at_ms": 2,
        "version": 99,
    })));
    assert_eq!(state.chat_id, "chat1");
    assert_eq!(state.created_at_ms, created);
    assert_eq!(state.version, 0);
    assert!(state.extra.is_empty());
}

#[test]
fn patch_keeps_unknown_keys_in_extra() {
    let mut state = ChatState::create_default("chat1");
    state.apply_patch(obj(json!({
        "conversation_context": {"topic": "billing"},
        "pinned": true,
    })));
    assert_eq!(state.conversation_context["topic"], json!("billing"));
    assert_eq!(state.extra["pinned"], json!(true));
}

#[test]
fn patch_with_non_object_known_field_is_ignored() {
    let mut state = ChatState::create_default("chat1");
    state.apply_patch(obj(json!({"user_preferences": "not a map"})));
    assert!(state.user_preferences.is_empty());
}

#[test]
fn mark_written_bumps_version_and_timestamp() {
    let mut state = ChatState::create_default("chat1");
    state.mark_written(state.updated_at_ms + 10);
    assert_eq!(state.version, 1);
    state.mark_written(state.updated_at_ms + 10);
    assert_eq!(state.version, 2);
    assert!(state.updated_at_ms > state.created_at_ms);
}

#[test]
fn foreign_document_round_trips_through_extra() {
    let payload = json!({
        "chat_id": "chat1",
        "created_at_ms": 1,
        "updated_at_ms": 2,
        "version": 3,
        "user_preferences": {},
        "conversation_context": {},
        "custom_field": {"nested": [1, 2, 3]},
    });
    let state: ChatState = serde_json::from_value(payload.clone()).expect("decode");
    assert_eq!(state.extra["custom_field"], payload["custom_field"]);
    let back = serde_json::to_value(&state).expect("encode");
    assert_eq!(back["custom_field"], payload["custom_field"]);
}
