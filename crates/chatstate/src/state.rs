//! Mutable per-chat state document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::now_unix_ms;

/// Freeform per-chat document: preferences and conversation context the
/// agent maintains across turns, versioned by a monotonically increasing
/// counter bumped on every persisted write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatState {
    /// Owning chat id.
    pub chat_id: String,
    /// Creation time, unix milliseconds.
    pub created_at_ms: u64,
    /// Last persisted write, unix milliseconds.
    pub updated_at_ms: u64,
    /// Write counter; bumped by the storage backend on every set.
    #[serde(default)]
    pub version: u64,
    /// Arbitrary user preference key/values.
    #[serde(default)]
    pub user_preferences: Map<String, Value>,
    /// Arbitrary conversation context key/values.
    #[serde(default)]
    pub conversation_context: Map<String, Value>,
    /// Any other top-level keys written by patches; kept so foreign
    /// documents round-trip unchanged.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatState {
    /// Fresh default document for a chat.
    pub fn create_default(chat_id: &str) -> Self {
        let now = now_unix_ms();
        Self {
            chat_id: chat_id.to_string(),
            created_at_ms: now,
            updated_at_ms: now,
            version: 0,
            user_preferences: Map::new(),
            conversation_context: Map::new(),
            extra: Map::new(),
        }
    }

    /// Shallow top-level merge of an arbitrary key/value patch.
    ///
    /// Known map fields are replaced wholesale when the patch value is an
    /// object; unknown keys land in `extra`.
    pub fn apply_patch(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            match key.as_str() {
                "user_preferences" => {
                    if let Value::Object(map) = value {
                        self.user_preferences = map;
                    }
                }
                "conversation_context" => {
                    if let Value::Object(map) = value {
                        self.conversation_context = map;
                    }
                }
                // Identity and bookkeeping fields are owned by the engine.
                "chat_id" | "created_at_ms" | "updated_at_ms" | "version" => {}
                _ => {
                    self.extra.insert(key, value);
                }
            }
        }
    }

    /// Bump write metadata; called by storage backends before persisting.
    pub(crate) fn mark_written(&mut self, now_ms: u64) {
        self.version += 1;
        self.updated_at_ms = now_ms;
    }
}

#[cfg(test)]
#[path = "../tests/unit/state.rs"]
mod tests;
