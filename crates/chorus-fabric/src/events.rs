use serde::{Deserialize, Serialize};
use serde_json::Value;

use chorus_core::types::now_rfc3339;

/// Every event the core emits toward transport clients.
///
/// Wire format is `{"type": "<snake_case tag>", ...}`; the tag names are
/// load-bearing — clients dispatch on them — and are pinned by the tests
/// in `tests/event_wire.rs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        timestamp: String,
    },
    Registered {
        user_id: String,
        timestamp: String,
    },
    NewMessage {
        message_id: String,
        session_id: String,
        sender_id: String,
        content: String,
        content_type: String,
        timestamp: String,
    },
    MessageRead {
        message_id: String,
        session_id: String,
        reader_id: String,
        timestamp: String,
    },
    Typing {
        session_id: String,
        user_id: String,
        timestamp: String,
    },
    PresenceChange {
        user_id: String,
        status: String,
        timestamp: String,
    },
    SessionCreated {
        session_id: String,
        title: Option<String>,
        creator_id: String,
        participants: Vec<String>,
        is_group: bool,
        timestamp: String,
    },
    SessionUpdate {
        session_id: String,
        detail: Value,
        timestamp: String,
    },
    Notification {
        content: String,
        priority: String,
        timestamp: String,
    },
    ProactiveExpression {
        session_id: Option<String>,
        user_id: String,
        expression_type: String,
        content: String,
        priority: f64,
        relationship_stage: String,
        timestamp: String,
    },
    OfflineNotificationsSummary {
        count: usize,
        timestamp: String,
    },
    Batch {
        messages: Vec<Value>,
        count: usize,
        timestamp: String,
    },
    Error {
        code: String,
        message: String,
        timestamp: String,
    },
}

impl ServerEvent {
    /// The wire tag, e.g. `"new_message"`.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::Registered { .. } => "registered",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::MessageRead { .. } => "message_read",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::PresenceChange { .. } => "presence_change",
            ServerEvent::SessionCreated { .. } => "session_created",
            ServerEvent::SessionUpdate { .. } => "session_update",
            ServerEvent::Notification { .. } => "notification",
            ServerEvent::ProactiveExpression { .. } => "proactive_expression",
            ServerEvent::OfflineNotificationsSummary { .. } => "offline_notifications_summary",
            ServerEvent::Batch { .. } => "batch",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Kinds that must never sit in an outbound batch queue.
    pub fn bypasses_batching(&self) -> bool {
        matches!(
            self,
            ServerEvent::Typing { .. }
                | ServerEvent::PresenceChange { .. }
                | ServerEvent::Error { .. }
        )
    }

    pub fn typing(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        ServerEvent::Typing {
            session_id: session_id.into(),
            user_id: user_id.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn presence_change(user_id: impl Into<String>, online: bool) -> Self {
        ServerEvent::PresenceChange {
            user_id: user_id.into(),
            status: if online { "online" } else { "offline" }.to_string(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn summary(count: usize) -> Self {
        ServerEvent::OfflineNotificationsSummary {
            count,
            timestamp: now_rfc3339(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tags_are_snake_case() {
        let ev = ServerEvent::typing("s1", "alice");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"typing""#));
        assert!(json.contains(r#""session_id":"s1""#));

        let ev = ServerEvent::summary(3);
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"offline_notifications_summary""#));
        assert!(json.contains(r#""count":3"#));
    }

    #[test]
    fn bypass_set_is_exactly_three_kinds() {
        assert!(ServerEvent::typing("s", "u").bypasses_batching());
        assert!(ServerEvent::presence_change("u", true).bypasses_batching());
        assert!(ServerEvent::Error {
            code: "X".into(),
            message: "y".into(),
            timestamp: now_rfc3339(),
        }
        .bypasses_batching());
        assert!(!ServerEvent::summary(1).bypasses_batching());
    }
}
