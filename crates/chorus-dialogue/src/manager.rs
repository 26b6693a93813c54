use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use chorus_core::types::{now_rfc3339, DialogueType, MessageType, RelationshipStage, Role};
use chorus_storage::{
    Session, SessionMetadata, Storage, StorageError, Turn, TurnFilter, TurnMetadata,
};

use crate::client::chat_with_retry;
use crate::error::{DialogueError, Result};
use crate::provider::{ChatMessage, ChatRequest, LlmProvider};

/// Turns of history loaded for prompt assembly.
const HISTORY_LIMIT: usize = 40;

/// Composed result of one `process_input` call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessResult {
    pub id: String,
    pub input: String,
    pub response: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub timestamp: String,
    pub metadata: Map<String, Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-turn processing for the AI-bearing dialogue topologies.
///
/// Persists the user turn, dispatches on the session's dialogue type to
/// build the LLM context, persists the AI turn, and bumps the acting
/// user's interaction counter.
pub struct DialogueManager {
    storage: Arc<Storage>,
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: f64,
    max_tokens: u32,
    retry_attempts: u32,
    /// Set when the frequency integrator is wired up; AI turns then carry
    /// `frequency_aware` and the user's relationship stage.
    frequency_attached: AtomicBool,
}

impl DialogueManager {
    pub fn new(
        storage: Arc<Storage>,
        provider: Arc<dyn LlmProvider>,
        model: String,
        temperature: f64,
        max_tokens: u32,
        retry_attempts: u32,
    ) -> Self {
        Self {
            storage,
            provider,
            model,
            temperature,
            max_tokens,
            retry_attempts,
            frequency_attached: AtomicBool::new(false),
        }
    }

    /// Mark the frequency integrator as attached.
    pub fn attach_frequency_awareness(&self) {
        self.frequency_attached.store(true, Ordering::Relaxed);
    }

    /// Create a session of any dialogue type. The creator is always a
    /// participant.
    #[instrument(skip(self, participants), fields(user_id, dialogue_type = %dialogue_type))]
    pub async fn create_session(
        &self,
        user_id: &str,
        dialogue_type: DialogueType,
        title: Option<&str>,
        participants: Option<Vec<String>>,
    ) -> Result<Session> {
        let mut participants = participants.unwrap_or_default();
        match participants.iter().position(|p| p == user_id) {
            Some(0) => {}
            Some(pos) => {
                participants.remove(pos);
                participants.insert(0, user_id.to_string());
            }
            None => participants.insert(0, user_id.to_string()),
        }

        let default_title = format!(
            "Conversation {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        let title = title.unwrap_or(&default_title);
        let metadata = SessionMetadata::new(dialogue_type, participants);
        Ok(self
            .storage
            .create_session(user_id, Some(title), metadata, None)
            .await?)
    }

    /// Persist a turn directly (used by the proactive path and tests).
    pub async fn create_turn(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        extra: Map<String, Value>,
    ) -> Result<Turn> {
        Ok(self
            .storage
            .create_turn(
                session_id,
                role,
                content,
                TurnMetadata {
                    extra,
                    ..TurnMetadata::default()
                },
            )
            .await?)
    }

    /// Process one user input and produce the AI reply.
    ///
    /// `session_id` must be the session id string — callers holding a
    /// session object pass its `id`.
    ///
    /// On LLM failure a fallback reply is synthesized (`model:
    /// "fallback"`, `error` set) and still persisted so the dialogue
    /// history stays well-formed; storage failures propagate.
    /// Cancellation is honored between stages: after the user turn is
    /// durable, a cancelled request stops before calling the LLM or
    /// delivering anything.
    #[instrument(skip(self, content, extra, cancel), fields(session_id, user_id))]
    pub async fn process_input(
        &self,
        session_id: &str,
        user_id: &str,
        content: &str,
        input_type: &str,
        extra: Map<String, Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<ProcessResult> {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(DialogueError::Cancelled);
        }

        // 1. Persist the user turn. Fails with NotFound for an unknown
        //    session, before any LLM work.
        let message_type: MessageType = input_type.parse().unwrap_or_default();
        self.storage
            .create_turn(
                session_id,
                Role::Human,
                content,
                TurnMetadata {
                    sender_id: Some(user_id.to_string()),
                    message_type,
                    human_chat: false,
                    read_at: Default::default(),
                    extra: extra.clone(),
                },
            )
            .await?;

        // 2. Session → dialogue type (missing metadata defaults to
        //    human_ai_private inside the decoder).
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("session {session_id}")))?;
        let dialogue_type = session.metadata.dialogue_type;

        // 3. Bounded recent history, oldest first for prompt assembly.
        //    The just-persisted user turn is excluded; dispatchers append
        //    the current input themselves.
        let mut history = self
            .storage
            .list_turns(session_id, TurnFilter::default(), HISTORY_LIMIT, None)
            .await?;
        history.reverse();
        if let Some(last) = history.last() {
            if last.role == Role::Human && last.content == content {
                history.pop();
            }
        }

        // The user turn is durable; a cancelled request stops here rather
        // than spend an LLM call.
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(DialogueError::Cancelled);
        }

        // 4. Dispatch.
        let outcome = self
            .dispatch(dialogue_type, &session, user_id, content, &history, &extra)
            .await;

        let (response_content, mut response_meta, error) = match outcome {
            Dispatched::Replied { content, metadata } => (content, metadata, None),
            Dispatched::Fallback { content, metadata, error } => {
                (content, metadata, Some(error))
            }
            Dispatched::Unsupported { content, metadata } => (content, metadata, None),
        };

        if self.frequency_attached.load(Ordering::Relaxed) {
            let stage = self.relationship_stage_of(user_id).await;
            response_meta.insert("frequency_aware".to_string(), Value::Bool(true));
            response_meta.insert(
                "relationship_stage".to_string(),
                Value::String(stage.as_str().to_string()),
            );
        }

        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(DialogueError::Cancelled);
        }

        // 5. Persist the AI turn (also on fallback, so history stays
        //    well-formed).
        self.storage
            .create_turn(
                session_id,
                Role::Ai,
                &response_content,
                TurnMetadata {
                    extra: response_meta.clone(),
                    ..TurnMetadata::default()
                },
            )
            .await?;

        // 6. Interaction count, best effort.
        if let Err(e) = self.storage.bump_interaction_count(user_id).await {
            warn!(user_id, error = %e, "interaction count bump failed");
        }

        info!(session_id, dialogue_type = %dialogue_type, fallback = error.is_some(), "input processed");

        // 7. Composed response object.
        Ok(ProcessResult {
            id: Uuid::new_v4().to_string(),
            input: content.to_string(),
            response: response_content,
            session_id: session_id.to_string(),
            timestamp: now_rfc3339(),
            metadata: response_meta,
            success: error.is_none(),
            error,
        })
    }

    async fn dispatch(
        &self,
        dialogue_type: DialogueType,
        session: &Session,
        user_id: &str,
        content: &str,
        history: &[Turn],
        extra: &Map<String, Value>,
    ) -> Dispatched {
        let mut metadata = base_metadata(dialogue_type, &self.model);

        let messages = match dialogue_type {
            DialogueType::HumanAiPrivate => {
                self.private_context(user_id, content, history).await
            }
            DialogueType::AiSelfReflection => reflection_context(content, history),
            DialogueType::HumanAiGroup | DialogueType::AiMultiHuman => group_context(
                dialogue_type,
                &session.metadata.participants,
                user_id,
                content,
                history,
            ),
            DialogueType::AiAiDialogue => {
                let (messages, next_role, roles) = ai_ai_context(content, history, extra);
                metadata.insert("ai_role".to_string(), Value::String(next_role.clone()));
                metadata.insert(
                    "ai_roles".to_string(),
                    Value::Array(roles.iter().cloned().map(Value::String).collect()),
                );
                let reply = self.call_llm(messages).await;
                return match reply {
                    Ok(raw) => Dispatched::Replied {
                        content: strip_role_prefix(&raw, &roles),
                        metadata,
                    },
                    Err(e) => fallback_reply(content, metadata, e),
                };
            }
            DialogueType::HumanHumanPrivate | DialogueType::HumanHumanGroup => {
                metadata.insert("model".to_string(), Value::String("none".to_string()));
                return Dispatched::Unsupported {
                    content: format!(
                        "This is a {dialogue_type} conversation; it has no AI participant to reply."
                    ),
                    metadata,
                };
            }
        };

        match self.call_llm(messages).await {
            Ok(reply) => Dispatched::Replied {
                content: reply,
                metadata,
            },
            Err(e) => fallback_reply(content, metadata, e),
        }
    }

    async fn call_llm(&self, messages: Vec<ChatMessage>) -> std::result::Result<String, String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        chat_with_retry(self.provider.as_ref(), &request, self.retry_attempts)
            .await
            .map(|r| r.content)
            .map_err(|e| e.to_string())
    }

    /// System preamble + profile context + history + current input.
    async fn private_context(
        &self,
        user_id: &str,
        content: &str,
        history: &[Turn],
    ) -> Vec<ChatMessage> {
        let mut preamble = String::from(
            "You are a helpful, attentive assistant in a private conversation. \
             Answer naturally and concisely.",
        );
        // Known profile facts enrich the preamble.
        if let Ok(Some(profile)) = self.storage.get_user_profile(user_id).await {
            if let Some(name) = &profile.name {
                preamble.push_str(&format!(" The user's name is {name}."));
            }
            if !profile.topics_of_interest.is_empty() {
                preamble.push_str(&format!(
                    " Topics they care about: {}.",
                    profile.topics_of_interest.join(", ")
                ));
            }
        }

        let mut messages = vec![ChatMessage::system(preamble)];
        messages.extend(history.iter().filter_map(turn_to_message));
        messages.push(ChatMessage::user(content));
        messages
    }

    async fn relationship_stage_of(&self, user_id: &str) -> RelationshipStage {
        let count = self
            .storage
            .get_user_profile(user_id)
            .await
            .ok()
            .flatten()
            .map(|p| p.interaction_count)
            .unwrap_or(0);
        RelationshipStage::from_interaction_count(count)
    }
}

enum Dispatched {
    Replied {
        content: String,
        metadata: Map<String, Value>,
    },
    Fallback {
        content: String,
        metadata: Map<String, Value>,
        error: String,
    },
    Unsupported {
        content: String,
        metadata: Map<String, Value>,
    },
}

fn base_metadata(dialogue_type: DialogueType, model: &str) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("processed_at".to_string(), Value::String(now_rfc3339()));
    meta.insert(
        "dialogue_type".to_string(),
        Value::String(dialogue_type.as_str().to_string()),
    );
    meta.insert("model".to_string(), Value::String(model.to_string()));
    meta.insert("tools_used".to_string(), Value::Array(Vec::new()));
    meta
}

fn fallback_reply(content: &str, mut metadata: Map<String, Value>, error: String) -> Dispatched {
    metadata.insert("model".to_string(), Value::String("fallback".to_string()));
    metadata.insert("error".to_string(), Value::String(error.clone()));
    Dispatched::Fallback {
        content: format!(
            "I cannot generate a smart reply right now, but I received: '{content}'"
        ),
        metadata,
        error,
    }
}

fn turn_to_message(turn: &Turn) -> Option<ChatMessage> {
    match turn.role {
        Role::Human => Some(ChatMessage::user(turn.content.clone())),
        Role::Ai => Some(ChatMessage::assistant(turn.content.clone())),
        Role::System => None,
    }
}

/// Self-critique framing: the full prior dialogue recast as user/assistant
/// under a reflection preamble, closed by the reflective prompt.
fn reflection_context(content: &str, history: &[Turn]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(
        "You are reflecting on your own prior replies. Assess their accuracy, \
         completeness, and usefulness, and propose concrete improvements.",
    )];
    messages.extend(history.iter().filter_map(turn_to_message));
    messages.push(ChatMessage::user(format!(
        "Reflect on the conversation above: {content}"
    )));
    messages
}

/// Group framing: participants enumerated in the preamble, every human
/// turn prefixed with its sender.
fn group_context(
    dialogue_type: DialogueType,
    participants: &[String],
    user_id: &str,
    content: &str,
    history: &[Turn],
) -> Vec<ChatMessage> {
    let roster = participants.join(", ");
    let preamble = if dialogue_type == DialogueType::HumanAiGroup {
        format!(
            "This is a group conversation between several humans and you, the AI. \
             Participants: {roster}. Reply appropriately for the whole group, \
             taking note of who said what."
        )
    } else {
        format!(
            "You are the single AI assistant talking with several humans. \
             Participants: {roster}. Reply appropriately, taking note of who \
             said what."
        )
    };

    let mut messages = vec![ChatMessage::system(preamble)];
    for turn in history {
        match turn.role {
            Role::Human => {
                let sender = turn.metadata.sender_id.as_deref().unwrap_or("unknown");
                messages.push(ChatMessage::user(format!("[{sender}]: {}", turn.content)));
            }
            Role::Ai => messages.push(ChatMessage::assistant(turn.content.clone())),
            Role::System => {}
        }
    }
    messages.push(ChatMessage::user(format!("[{user_id}]: {content}")));
    messages
}

/// AI↔AI framing: two named AI roles alternate; the role that did not just
/// speak produces the next turn.
fn ai_ai_context(
    content: &str,
    history: &[Turn],
    extra: &Map<String, Value>,
) -> (Vec<ChatMessage>, String, Vec<String>) {
    let roles: Vec<String> = extra
        .get("ai_roles")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .filter(|v: &Vec<String>| v.len() == 2)
        .unwrap_or_else(|| vec!["Assistant A".to_string(), "Assistant B".to_string()]);

    let current = extra
        .get("current_ai")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| roles[0].clone());
    let next = if current == roles[0] {
        roles[1].clone()
    } else {
        roles[0].clone()
    };

    let mut messages = vec![ChatMessage::system(format!(
        "This is a dialogue between two AIs. You are playing {next}, in \
         conversation with {current}. Continue the exchange in character."
    ))];
    // Alternate user/assistant so the transcript stays well-formed for the
    // completion API regardless of who actually spoke.
    for turn in history {
        let speaker = turn
            .metadata
            .extra
            .get("ai_role")
            .and_then(|v| v.as_str())
            .unwrap_or(roles[0].as_str());
        let line = format!("[{speaker}]: {}", turn.content);
        if messages.len() % 2 == 1 {
            messages.push(ChatMessage::user(line));
        } else {
            messages.push(ChatMessage::assistant(line));
        }
    }
    let line = format!("[{current}]: {content}");
    if messages.len() % 2 == 1 {
        messages.push(ChatMessage::user(line));
    } else {
        messages.push(ChatMessage::assistant(line));
    }

    (messages, next, roles)
}

/// Remove a leading `[role]: ` echo the model sometimes produces.
fn strip_role_prefix(response: &str, roles: &[String]) -> String {
    let mut out = response.trim();
    for role in roles {
        let prefix = format!("[{role}]: ");
        if let Some(rest) = out.strip_prefix(&prefix) {
            out = rest;
            break;
        }
    }
    out.to_string()
}
