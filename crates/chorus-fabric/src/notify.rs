use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};

use chorus_core::types::now_rfc3339;

use crate::events::ServerEvent;
use crate::router::MessageRouter;

/// Maximum notifications delivered per second while draining a
/// reconnected user's backlog.
const DRAIN_RATE_PER_SEC: u64 = 20;

/// Typed, room-scoped notification fan-out with offline accumulation.
///
/// Sits above the router: callers describe the semantic event and the
/// participant set, this service excludes the actor, stamps timestamps,
/// and parks notifications for offline recipients (bounded per user).
pub struct NotificationService {
    router: Arc<MessageRouter>,
    offline: DashMap<String, VecDeque<ServerEvent>>,
    max_offline_per_user: usize,
}

impl NotificationService {
    pub fn new(router: Arc<MessageRouter>, max_offline_per_user: usize) -> Arc<Self> {
        Arc::new(Self {
            router,
            offline: DashMap::new(),
            max_offline_per_user,
        })
    }

    pub fn pending_count(&self, user_id: &str) -> usize {
        self.offline.get(user_id).map(|q| q.len()).unwrap_or(0)
    }

    /// Deliver one notification, accumulating it when the user is offline.
    pub fn send(&self, user_id: &str, event: ServerEvent) -> bool {
        if self.router.is_connected(user_id) && self.router.deliver_to_user(user_id, event.clone())
        {
            return true;
        }
        let mut queue = self.offline.entry(user_id.to_string()).or_default();
        if queue.len() >= self.max_offline_per_user {
            queue.pop_front();
        }
        queue.push_back(event);
        debug!(user_id, "notification stored for offline user");
        false
    }

    pub fn broadcast(&self, user_ids: &[String], event: &ServerEvent) {
        for user_id in user_ids {
            self.send(user_id, event.clone());
        }
    }

    /// `session_created` to every participant except the creator.
    pub fn notify_session_created(
        &self,
        session_id: &str,
        title: Option<&str>,
        creator_id: &str,
        participants: &[String],
    ) {
        let event = ServerEvent::SessionCreated {
            session_id: session_id.to_string(),
            title: title.map(str::to_string),
            creator_id: creator_id.to_string(),
            participants: participants.to_vec(),
            is_group: participants.len() > 2,
            timestamp: now_rfc3339(),
        };
        let recipients: Vec<String> = participants
            .iter()
            .filter(|p| p.as_str() != creator_id)
            .cloned()
            .collect();
        self.broadcast(&recipients, &event);
    }

    /// `message_read` to the original sender only.
    pub fn notify_message_read(&self, message_id: &str, session_id: &str, reader_id: &str, sender_id: &str) {
        let event = ServerEvent::MessageRead {
            message_id: message_id.to_string(),
            session_id: session_id.to_string(),
            reader_id: reader_id.to_string(),
            timestamp: now_rfc3339(),
        };
        self.send(sender_id, event);
    }

    /// `typing` to every participant except the typist.
    pub fn notify_user_typing(&self, session_id: &str, user_id: &str, participants: &[String]) {
        let event = ServerEvent::typing(session_id, user_id);
        let recipients: Vec<String> = participants
            .iter()
            .filter(|p| p.as_str() != user_id)
            .cloned()
            .collect();
        self.broadcast(&recipients, &event);
    }

    /// `session_update` to every participant except the actor.
    pub fn notify_session_update(
        &self,
        session_id: &str,
        actor_id: &str,
        participants: &[String],
        detail: Value,
    ) {
        let event = ServerEvent::SessionUpdate {
            session_id: session_id.to_string(),
            detail,
            timestamp: now_rfc3339(),
        };
        let recipients: Vec<String> = participants
            .iter()
            .filter(|p| p.as_str() != actor_id)
            .cloned()
            .collect();
        self.broadcast(&recipients, &event);
    }

    /// Replay accumulated notifications to a freshly connected user: a
    /// summary first, then the backlog at a bounded rate so a client
    /// returning from a long absence is not overwhelmed.
    pub async fn drain_offline(&self, user_id: &str) {
        let backlog: Vec<ServerEvent> = self
            .offline
            .remove(user_id)
            .map(|(_, q)| q.into_iter().collect())
            .unwrap_or_default();
        if backlog.is_empty() {
            return;
        }

        info!(user_id, count = backlog.len(), "replaying offline notifications");
        self.router
            .deliver_to_user(user_id, ServerEvent::summary(backlog.len()));
        let pause = Duration::from_millis(1000 / DRAIN_RATE_PER_SEC);
        for event in backlog {
            self.router.deliver_to_user(user_id, event);
            tokio::time::sleep(pause).await;
        }
    }
}
