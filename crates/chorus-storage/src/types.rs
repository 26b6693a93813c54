use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use chorus_core::types::{DialogueType, MessageType, Role};

use crate::error::{Result, StorageError};

/// Structured session metadata: the known fields every session carries plus
/// an opaque extension map for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub dialogue_type: DialogueType,
    /// Ordered participant ids. The creator is always `participants[0]` and
    /// duplicates are forbidden.
    pub participants: Vec<String>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

fn default_status() -> String {
    "active".to_string()
}

impl SessionMetadata {
    pub fn new(dialogue_type: DialogueType, participants: Vec<String>) -> Self {
        Self {
            dialogue_type,
            participants,
            status: default_status(),
            extra: Map::new(),
        }
    }

    /// Validate the invariants enforced on every write:
    /// participants non-empty, duplicate-free, creator at index 0.
    pub fn validate(&self, creator: &str) -> Result<()> {
        if self.participants.is_empty() {
            return Err(StorageError::InvalidInput(
                "participants must not be empty".to_string(),
            ));
        }
        if self.participants[0] != creator {
            return Err(StorageError::InvalidInput(format!(
                "creator {creator} must be the first participant"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.participants {
            if !seen.insert(p.as_str()) {
                return Err(StorageError::InvalidInput(format!(
                    "duplicate participant: {p}"
                )));
            }
        }
        Ok(())
    }

    /// Decode from a stored JSON document, tolerating legacy wrapper shapes
    /// and the legacy dialogue-type spelling. A missing dialogue type
    /// defaults to `human_ai_private`.
    pub fn from_stored_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let doc = crate::shape::normalize_single(value).unwrap_or(Value::Object(Map::new()));
        let Value::Object(mut obj) = doc else {
            return Err(StorageError::InvalidInput(
                "session metadata is not an object".to_string(),
            ));
        };

        let dialogue_type = match obj.remove("dialogue_type") {
            Some(Value::String(s)) => s
                .parse::<DialogueType>()
                .map_err(StorageError::InvalidInput)?,
            _ => DialogueType::HumanAiPrivate,
        };
        let participants = match obj.remove("participants") {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        let status = match obj.remove("status") {
            Some(Value::String(s)) => s,
            _ => default_status(),
        };

        Ok(Self {
            dialogue_type,
            participants,
            status,
            extra: obj,
        })
    }

    pub fn to_stored_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A durable conversation container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Creator of the session; immutable once written.
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub last_activity: String,
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.metadata.participants.iter().any(|p| p == user_id)
    }
}

/// Structured turn metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TurnMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub human_chat: bool,
    /// user_id → RFC3339 read timestamp. Keys are only ever added.
    #[serde(default)]
    pub read_at: BTreeMap<String, String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// A single utterance within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
    pub metadata: TurnMetadata,
}

/// Partial session update. Absent fields are left untouched;
/// `dialogue_type` and the creator are not patchable at all.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub status: Option<String>,
    pub last_activity: Option<String>,
    /// Replacement participant list; the creator must stay at index 0.
    pub participants: Option<Vec<String>>,
    /// Keys merged into `metadata.extra`.
    pub extra: Map<String, Value>,
}

impl SessionPatch {
    pub fn touch() -> Self {
        Self::default()
    }

    pub fn with_last_activity(ts: impl Into<String>) -> Self {
        Self {
            last_activity: Some(ts.into()),
            ..Self::default()
        }
    }
}

/// Turn update. Turns are mutated only by read-receipt additions and
/// extension-map merges; nothing else about a turn ever changes.
#[derive(Debug, Clone, Default)]
pub struct TurnPatch {
    /// (user_id, RFC3339 timestamp) pairs. A user already present in
    /// `read_at` keeps the original timestamp, making repeated
    /// mark-as-read calls idempotent.
    pub add_read_at: Vec<(String, String)>,
    pub extra: Map<String, Value>,
}

impl TurnPatch {
    pub fn read_receipt(user_id: impl Into<String>, ts: impl Into<String>) -> Self {
        Self {
            add_read_at: vec![(user_id.into(), ts.into())],
            extra: Map::new(),
        }
    }
}

/// Equality filters for session listing. All present fields must match.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub user_id: Option<String>,
    pub dialogue_type: Option<DialogueType>,
    pub status: Option<String>,
    /// Matches sessions whose participant list contains this user.
    pub participant: Option<String>,
}

/// Equality filters for turn listing.
#[derive(Debug, Clone, Default)]
pub struct TurnFilter {
    pub human_chat: Option<bool>,
    pub sender_id: Option<String>,
    pub role: Option<Role>,
}

impl TurnFilter {
    pub fn human_chat_only() -> Self {
        Self {
            human_chat: Some(true),
            ..Self::default()
        }
    }

    pub fn matches(&self, turn: &Turn) -> bool {
        if let Some(hc) = self.human_chat {
            if turn.metadata.human_chat != hc {
                return false;
            }
        }
        if let Some(ref sender) = self.sender_id {
            if turn.metadata.sender_id.as_deref() != Some(sender.as_str()) {
                return false;
            }
        }
        if let Some(role) = self.role {
            if turn.role != role {
                return false;
            }
        }
        true
    }
}

/// A persisted proactive utterance, stored for later analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionRecord {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub expression_type: String,
    pub content: String,
    pub priority_score: f64,
    pub relationship_stage: String,
    pub timestamp: String,
}

/// Per-user profile consumed by the expression planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub name: Option<String>,
    pub interaction_count: u64,
    #[serde(default)]
    pub preferences: Map<String, Value>,
    #[serde(default)]
    pub topics_of_interest: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl UserProfile {
    /// Default profile used when a user has never been seen.
    pub fn placeholder(user_id: &str) -> Self {
        let now = chorus_core::types::now_rfc3339();
        Self {
            user_id: user_id.to_string(),
            name: None,
            interaction_count: 0,
            preferences: Map::new(),
            topics_of_interest: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Storage health report returned by the ping check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHealth {
    pub status: HealthStatus,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_validation_rejects_duplicates() {
        let meta = SessionMetadata::new(
            DialogueType::HumanHumanGroup,
            vec!["alice".into(), "bob".into(), "bob".into()],
        );
        assert!(meta.validate("alice").is_err());
    }

    #[test]
    fn metadata_validation_pins_creator_first() {
        let meta = SessionMetadata::new(
            DialogueType::HumanHumanPrivate,
            vec!["alice".into(), "bob".into()],
        );
        assert!(meta.validate("alice").is_ok());
        assert!(meta.validate("bob").is_err());
    }

    #[test]
    fn stored_metadata_defaults_dialogue_type() {
        let meta = SessionMetadata::from_stored_json(r#"{"participants":["u1"]}"#).unwrap();
        assert_eq!(meta.dialogue_type, DialogueType::HumanAiPrivate);
        assert_eq!(meta.participants, vec!["u1".to_string()]);
    }

    #[test]
    fn stored_metadata_accepts_result_wrapper() {
        let raw = r#"{"result":{"dialogue_type":"human_human_group","participants":["a","b"],"status":"active"}}"#;
        let meta = SessionMetadata::from_stored_json(raw).unwrap();
        assert_eq!(meta.dialogue_type, DialogueType::HumanHumanGroup);
        assert_eq!(meta.participants.len(), 2);
    }

    #[test]
    fn stored_metadata_keeps_unknown_fields_in_extra() {
        let raw = r#"{"dialogue_type":"human_ai_private","participants":["a"],"theme":"dark"}"#;
        let meta = SessionMetadata::from_stored_json(raw).unwrap();
        assert_eq!(meta.extra.get("theme").and_then(|v| v.as_str()), Some("dark"));
    }

    #[test]
    fn turn_filter_matching() {
        let turn = Turn {
            id: "t1".into(),
            session_id: "s1".into(),
            role: chorus_core::types::Role::Human,
            content: "hi".into(),
            created_at: chorus_core::types::now_rfc3339(),
            metadata: TurnMetadata {
                sender_id: Some("alice".into()),
                human_chat: true,
                ..TurnMetadata::default()
            },
        };
        assert!(TurnFilter::human_chat_only().matches(&turn));
        assert!(!TurnFilter {
            sender_id: Some("bob".into()),
            ..TurnFilter::default()
        }
        .matches(&turn));
    }
}
