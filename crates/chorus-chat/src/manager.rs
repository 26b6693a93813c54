use std::sync::Arc;

use serde_json::Map;
use tracing::{info, instrument, warn};

use chorus_cache::ChatCaches;
use chorus_core::types::{now_rfc3339, DialogueType, MessageType, Role};
use chorus_fabric::{MessageRouter, NotificationService, ServerEvent, WsOptimizer};
use chorus_storage::{
    batch, Session, SessionFilter, SessionMetadata, SessionPatch, Storage, Turn, TurnFilter,
    TurnMetadata, TurnPatch,
};

use crate::error::{ChatError, Result};
use crate::views::{LastMessage, MessageView, SessionSummary};

/// Bound on the per-session scan used for unread counts and last-message
/// lookups.
const SESSION_SCAN_LIMIT: usize = 500;

/// Orchestrates human↔human chat: session lifecycle, sends, read
/// receipts, typing, and list queries across storage, cache, and the
/// realtime fabric.
pub struct ChatManager {
    storage: Arc<Storage>,
    caches: Arc<ChatCaches>,
    router: Arc<MessageRouter>,
    optimizer: Arc<WsOptimizer>,
    notifications: Arc<NotificationService>,
}

impl ChatManager {
    pub fn new(
        storage: Arc<Storage>,
        caches: Arc<ChatCaches>,
        router: Arc<MessageRouter>,
        optimizer: Arc<WsOptimizer>,
        notifications: Arc<NotificationService>,
    ) -> Self {
        Self {
            storage,
            caches,
            router,
            optimizer,
            notifications,
        }
    }

    /// Create a two-person private chat. A user cannot chat with
    /// themselves.
    #[instrument(skip(self), fields(creator_id, recipient_id))]
    pub async fn create_private_chat(
        &self,
        creator_id: &str,
        recipient_id: &str,
        title: Option<&str>,
    ) -> Result<Session> {
        if creator_id == recipient_id {
            return Err(ChatError::InvalidInput(
                "cannot open a private chat with yourself".to_string(),
            ));
        }

        let default_title = format!("Chat with {recipient_id}");
        let title = title.unwrap_or(&default_title);
        let metadata = SessionMetadata::new(
            DialogueType::HumanHumanPrivate,
            vec![creator_id.to_string(), recipient_id.to_string()],
        );
        let session = self
            .storage
            .create_session(creator_id, Some(title), metadata, None)
            .await?;

        info!(session_id = %session.id, "private chat created");
        self.notifications.notify_session_created(
            &session.id,
            session.title.as_deref(),
            creator_id,
            &session.metadata.participants,
        );
        self.caches
            .invalidate_for_write(&session.id, &session.metadata.participants);
        Ok(session)
    }

    /// Create a group chat. Members are deduplicated and the creator is
    /// always included (first).
    #[instrument(skip(self, member_ids), fields(creator_id))]
    pub async fn create_group_chat(
        &self,
        creator_id: &str,
        member_ids: &[String],
        title: Option<&str>,
    ) -> Result<Session> {
        let mut participants = vec![creator_id.to_string()];
        for member in member_ids {
            if !participants.contains(member) {
                participants.push(member.clone());
            }
        }
        if participants.len() < 2 {
            return Err(ChatError::InvalidInput(
                "a group chat needs at least one member besides the creator".to_string(),
            ));
        }

        let default_title = format!(
            "Group chat {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M")
        );
        let title = title.unwrap_or(&default_title);
        let metadata = SessionMetadata::new(DialogueType::HumanHumanGroup, participants);
        let session = self
            .storage
            .create_session(creator_id, Some(title), metadata, None)
            .await?;

        info!(session_id = %session.id, members = session.metadata.participants.len(), "group chat created");
        self.notifications.notify_session_created(
            &session.id,
            session.title.as_deref(),
            creator_id,
            &session.metadata.participants,
        );
        self.caches
            .invalidate_for_write(&session.id, &session.metadata.participants);
        Ok(session)
    }

    /// Persist and fan out one message.
    ///
    /// Per-recipient delivery failures never fail the send: once the turn
    /// is persisted the send has succeeded.
    #[instrument(skip(self, content, extra), fields(session_id, sender_id))]
    pub async fn send_message(
        &self,
        session_id: &str,
        sender_id: &str,
        content: &str,
        message_type: MessageType,
        extra: Map<String, serde_json::Value>,
    ) -> Result<Turn> {
        let session = self.load_session(session_id).await?;
        self.require_participant(&session, sender_id)?;

        let turn = self
            .storage
            .create_turn(
                session_id,
                Role::Human,
                content,
                TurnMetadata {
                    sender_id: Some(sender_id.to_string()),
                    message_type,
                    human_chat: true,
                    read_at: Default::default(),
                    extra,
                },
            )
            .await?;

        // Bump session activity so list ordering stays current.
        self.storage
            .update_session(session_id, SessionPatch::with_last_activity(now_rfc3339()))
            .await?;

        let event = ServerEvent::NewMessage {
            message_id: turn.id.clone(),
            session_id: session_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            content_type: message_type.as_str().to_string(),
            timestamp: turn.created_at.clone(),
        };

        for recipient in session
            .metadata
            .participants
            .iter()
            .filter(|p| p.as_str() != sender_id)
        {
            if self.optimizer.is_active(recipient) {
                if let Err(e) = self.optimizer.queue_event(recipient, event.clone()) {
                    warn!(recipient, error = %e, "enqueue failed, falling back to router");
                    self.router.deliver_to_user(recipient, event.clone());
                } else if message_type.wants_immediate_flush() {
                    self.optimizer.flush_user(recipient);
                }
            } else {
                // Not on the optimized path (offline or plain transport):
                // the router delivers live or spools.
                self.router.deliver_to_user(recipient, event.clone());
            }
        }

        self.caches
            .invalidate_for_write(session_id, &session.metadata.participants);
        Ok(turn)
    }

    /// Record a read receipt. Idempotent: a second read by the same user
    /// leaves the original timestamp in place.
    #[instrument(skip(self), fields(message_id, reader_id))]
    pub async fn mark_as_read(&self, message_id: &str, reader_id: &str) -> Result<Turn> {
        let turn = self
            .storage
            .get_turn(message_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;
        let session = self.load_session(&turn.session_id).await?;
        self.require_participant(&session, reader_id)?;

        let already_read = turn.metadata.read_at.contains_key(reader_id);
        let updated = self
            .storage
            .update_turn(message_id, TurnPatch::read_receipt(reader_id, now_rfc3339()))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;
        self.caches.turns.invalidate(message_id);

        // Notify the sender once, on the first read only.
        if !already_read {
            if let Some(sender_id) = updated.metadata.sender_id.as_deref() {
                if sender_id != reader_id {
                    self.notifications.notify_message_read(
                        message_id,
                        &turn.session_id,
                        reader_id,
                        sender_id,
                    );
                }
            }
        }
        Ok(updated)
    }

    /// Fan a typing indicator out to the other participants, immediately.
    pub async fn notify_typing(&self, session_id: &str, user_id: &str) -> Result<()> {
        let session = self.load_session(session_id).await?;
        self.require_participant(&session, user_id)?;

        let event = ServerEvent::typing(session_id, user_id);
        for recipient in session
            .metadata
            .participants
            .iter()
            .filter(|p| p.as_str() != user_id)
        {
            if self.optimizer.is_active(recipient) {
                // typing bypasses batching inside the optimizer
                let _ = self.optimizer.queue_event(recipient, event.clone());
            } else {
                self.router.deliver_to_user(recipient, event.clone());
            }
        }
        Ok(())
    }

    /// All human-chat sessions the user participates in, most recently
    /// updated first, with last message and unread count.
    pub async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>> {
        if let Some(cached) = self.caches.user_sessions.get(user_id) {
            if let Ok(parsed) = serde_json::from_str::<Vec<SessionSummary>>(&cached) {
                return Ok(parsed);
            }
        }

        let sessions = self
            .storage
            .list_sessions(
                SessionFilter {
                    participant: Some(user_id.to_string()),
                    ..SessionFilter::default()
                },
                SESSION_SCAN_LIMIT,
                0,
            )
            .await?;

        let mut summaries = Vec::new();
        for session in sessions
            .iter()
            .filter(|s| s.metadata.dialogue_type.is_human_only())
        {
            let turns = self
                .storage
                .list_turns(
                    &session.id,
                    TurnFilter::human_chat_only(),
                    SESSION_SCAN_LIMIT,
                    None,
                )
                .await?;
            let last_message = turns.first().map(LastMessage::from_turn);
            let unread_count = turns
                .iter()
                .filter(|t| {
                    t.metadata.sender_id.as_deref() != Some(user_id)
                        && !t.metadata.read_at.contains_key(user_id)
                })
                .count();

            summaries.push(SessionSummary {
                id: session.id.clone(),
                title: session.title.clone(),
                is_group: session.metadata.dialogue_type == DialogueType::HumanHumanGroup,
                participants: session.metadata.participants.clone(),
                created_at: session.created_at.clone(),
                updated_at: session.updated_at.clone(),
                last_message,
                unread_count,
            });
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        if let Ok(rendered) = serde_json::to_string(&summaries) {
            self.caches.user_sessions.insert(user_id, rendered);
        }
        Ok(summaries)
    }

    /// Paged message history, oldest-first within the returned window.
    ///
    /// Only the unpaged head query is cached; cursor queries always hit
    /// storage so invalidation stays exact.
    pub async fn get_session_messages(
        &self,
        session_id: &str,
        user_id: &str,
        limit: usize,
        before_id: Option<&str>,
    ) -> Result<Vec<MessageView>> {
        let session = self.load_session(session_id).await?;
        self.require_participant(&session, user_id)?;

        if before_id.is_none() {
            if let Some(cached) = self.caches.session_turns.get(session_id) {
                if let Ok(parsed) = serde_json::from_str::<Vec<MessageView>>(&cached) {
                    return Ok(parsed.into_iter().take(limit).collect());
                }
            }
        }

        let turns =
            batch::list_human_turns(&self.storage, session_id, limit, before_id).await?;
        let mut views: Vec<MessageView> = turns.iter().map(MessageView::from_turn).collect();
        // storage returns newest-first; clients read top-down
        views.reverse();

        if before_id.is_none() {
            if let Ok(rendered) = serde_json::to_string(&views) {
                self.caches.session_turns.insert(session_id, rendered);
            }
        }
        Ok(views)
    }

    /// Unread count for one (session, user) pair.
    pub async fn count_unread(&self, session_id: &str, user_id: &str) -> Result<usize> {
        let turns = self
            .storage
            .list_turns(
                session_id,
                TurnFilter::human_chat_only(),
                SESSION_SCAN_LIMIT,
                None,
            )
            .await?;
        Ok(turns
            .iter()
            .filter(|t| {
                t.metadata.sender_id.as_deref() != Some(user_id)
                    && !t.metadata.read_at.contains_key(user_id)
            })
            .count())
    }

    async fn load_session(&self, session_id: &str) -> Result<Session> {
        if let Some(session) = self.caches.sessions.get(session_id) {
            return Ok(session);
        }
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("session {session_id}")))?;
        self.caches.sessions.insert(session_id, session.clone());
        Ok(session)
    }

    fn require_participant(&self, session: &Session, user_id: &str) -> Result<()> {
        if session.is_participant(user_id) {
            Ok(())
        } else {
            Err(ChatError::Forbidden(format!(
                "user {user_id} is not a participant of session {}",
                session.id
            )))
        }
    }
}
