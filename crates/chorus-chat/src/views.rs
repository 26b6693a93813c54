use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use chorus_storage::Turn;

/// One row of a user's session list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: Option<String>,
    pub is_group: bool,
    pub participants: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    pub last_message: Option<LastMessage>,
    pub unread_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessage {
    pub id: String,
    pub content: String,
    pub sender_id: Option<String>,
    pub created_at: String,
}

impl LastMessage {
    pub fn from_turn(turn: &Turn) -> Self {
        Self {
            id: turn.id.clone(),
            content: turn.content.clone(),
            sender_id: turn.metadata.sender_id.clone(),
            created_at: turn.created_at.clone(),
        }
    }
}

/// Client-facing rendering of a chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: String,
    pub session_id: String,
    pub sender_id: Option<String>,
    pub content: String,
    pub content_type: String,
    pub created_at: String,
    /// user_id → read timestamp.
    pub read_by: BTreeMap<String, String>,
    /// Extension metadata, with the well-known delivery fields removed.
    pub metadata: Map<String, Value>,
}

impl MessageView {
    pub fn from_turn(turn: &Turn) -> Self {
        Self {
            id: turn.id.clone(),
            session_id: turn.session_id.clone(),
            sender_id: turn.metadata.sender_id.clone(),
            content: turn.content.clone(),
            content_type: turn.metadata.message_type.as_str().to_string(),
            created_at: turn.created_at.clone(),
            read_by: turn.metadata.read_at.clone(),
            metadata: turn.metadata.extra.clone(),
        }
    }
}
