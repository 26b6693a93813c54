use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use chorus_core::types::{now_rfc3339, Role};

use crate::error::{Result, StorageError};
use crate::sqlite::{apply_session_patch, apply_turn_patch};
use crate::store::DialogueStore;
use crate::types::*;

/// In-memory dialogue store.
///
/// Serves two purposes: the degraded fallback when the primary database
/// cannot be opened, and a fast hermetic backend for tests. Semantics match
/// [`crate::SqliteStore`] exactly.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// When true, records created here carry an `error` note in their
    /// extension map so callers can see they were written while degraded.
    degraded: bool,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    /// Insertion-ordered turn ids per session (insertion order is creation
    /// order, which backs the cursor semantics).
    session_turns: HashMap<String, Vec<String>>,
    turns: HashMap<String, Turn>,
    expressions: Vec<ExpressionRecord>,
    profiles: HashMap<String, UserProfile>,
    nonces: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            degraded: false,
        }
    }

    /// Fallback mode: created records are annotated with an error note.
    pub fn degraded() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            degraded: true,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

const DEGRADED_NOTE: &str = "primary store unavailable; record held in memory only";

impl DialogueStore for MemoryStore {
    fn create_session(
        &self,
        user_id: &str,
        title: Option<&str>,
        mut metadata: SessionMetadata,
        client_nonce: Option<&str>,
    ) -> Result<Session> {
        metadata.validate(user_id)?;

        let mut inner = self.inner.lock().unwrap();
        if let Some(nonce) = client_nonce {
            if let Some(existing_id) = inner.nonces.get(nonce) {
                if let Some(existing) = inner.sessions.get(existing_id) {
                    return Ok(existing.clone());
                }
            }
        }

        if self.degraded {
            metadata
                .extra
                .insert("error".to_string(), Value::String(DEGRADED_NOTE.to_string()));
        }

        let now = now_rfc3339();
        let session = Session {
            id: Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            title: title.map(str::to_string),
            created_at: now.clone(),
            updated_at: now.clone(),
            last_activity: now,
            metadata,
        };
        if let Some(nonce) = client_nonce {
            inner.nonces.insert(nonce.to_string(), session.id.clone());
        }
        inner.sessions.insert(session.id.clone(), session.clone());
        debug!(session_id = %session.id, "session created in memory store");
        Ok(session)
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.inner.lock().unwrap().sessions.get(id).cloned())
    }

    fn update_session(&self, id: &str, patch: &SessionPatch) -> Result<Option<Session>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(existing) = inner.sessions.get(id).cloned() else {
            return Ok(None);
        };
        let mut merged = apply_session_patch(existing, patch)?;
        merged.updated_at = now_rfc3339();
        inner.sessions.insert(id.to_string(), merged.clone());
        Ok(Some(merged))
    }

    fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>> {
        let inner = self.inner.lock().unwrap();
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| {
                filter
                    .user_id
                    .as_ref()
                    .map_or(true, |u| &s.user_id == u)
                    && filter
                        .dialogue_type
                        .map_or(true, |dt| s.metadata.dialogue_type == dt)
                    && filter
                        .status
                        .as_ref()
                        .map_or(true, |st| &s.metadata.status == st)
                    && filter
                        .participant
                        .as_ref()
                        .map_or(true, |p| s.is_participant(p))
            })
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    fn create_turn(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        mut metadata: TurnMetadata,
    ) -> Result<Turn> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.sessions.contains_key(session_id) {
            return Err(StorageError::NotFound(format!("session {session_id}")));
        }

        let now = now_rfc3339();
        if let Some(sender) = metadata.sender_id.clone() {
            metadata.read_at.entry(sender).or_insert_with(|| now.clone());
        }
        if self.degraded {
            metadata
                .extra
                .insert("error".to_string(), Value::String(DEGRADED_NOTE.to_string()));
        }

        let turn = Turn {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
            metadata,
        };
        inner
            .session_turns
            .entry(session_id.to_string())
            .or_default()
            .push(turn.id.clone());
        inner.turns.insert(turn.id.clone(), turn.clone());
        Ok(turn)
    }

    fn get_turn(&self, id: &str) -> Result<Option<Turn>> {
        Ok(self.inner.lock().unwrap().turns.get(id).cloned())
    }

    fn update_turn(&self, id: &str, patch: &TurnPatch) -> Result<Option<Turn>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(turn) = inner.turns.get_mut(id) else {
            return Ok(None);
        };
        apply_turn_patch(&mut turn.metadata, patch);
        Ok(Some(turn.clone()))
    }

    fn list_turns(
        &self,
        session_id: &str,
        filter: &TurnFilter,
        limit: usize,
        before_id: Option<&str>,
    ) -> Result<Vec<Turn>> {
        let inner = self.inner.lock().unwrap();
        let ids = inner
            .session_turns
            .get(session_id)
            .cloned()
            .unwrap_or_default();

        // Newest first; insertion order is creation order.
        let mut newest_first: Vec<&Turn> = ids
            .iter()
            .rev()
            .filter_map(|id| inner.turns.get(id))
            .collect();

        if let Some(bid) = before_id {
            let Some(pos) = newest_first.iter().position(|t| t.id == bid) else {
                return Ok(Vec::new());
            };
            newest_first = newest_first.split_off(pos + 1);
        }

        Ok(newest_first
            .into_iter()
            .filter(|t| filter.matches(t))
            .take(limit)
            .cloned()
            .collect())
    }

    fn record_expression(&self, record: &ExpressionRecord) -> Result<()> {
        self.inner.lock().unwrap().expressions.push(record.clone());
        Ok(())
    }

    fn list_expressions(&self, user_id: &str, limit: usize) -> Result<Vec<ExpressionRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<ExpressionRecord> = inner
            .expressions
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        Ok(records)
    }

    fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.inner.lock().unwrap().profiles.get(user_id).cloned())
    }

    fn upsert_user_profile(&self, profile: &UserProfile) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .profiles
            .entry(profile.user_id.clone())
            .or_insert_with(|| UserProfile::placeholder(&profile.user_id));
        entry.name = profile.name.clone();
        entry.preferences = profile.preferences.clone();
        entry.topics_of_interest = profile.topics_of_interest.clone();
        // monotonic counter: never decrease
        entry.interaction_count = entry.interaction_count.max(profile.interaction_count);
        entry.updated_at = now_rfc3339();
        Ok(())
    }

    fn bump_interaction_count(&self, user_id: &str) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .profiles
            .entry(user_id.to_string())
            .or_insert_with(|| UserProfile::placeholder(user_id));
        entry.interaction_count += 1;
        entry.updated_at = now_rfc3339();
        Ok(entry.interaction_count)
    }

    fn health(&self) -> StoreHealth {
        StoreHealth {
            status: if self.degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            detail: if self.degraded {
                "in-memory fallback active".to_string()
            } else {
                "in-memory store".to_string()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::DialogueType;

    fn meta(creator: &str, other: &str) -> SessionMetadata {
        SessionMetadata::new(
            DialogueType::HumanHumanPrivate,
            vec![creator.to_string(), other.to_string()],
        )
    }

    #[test]
    fn degraded_records_carry_error_note() {
        let s = MemoryStore::degraded();
        let session = s
            .create_session("alice", None, meta("alice", "bob"), None)
            .unwrap();
        assert!(session.metadata.extra.contains_key("error"));
        let turn = s
            .create_turn(
                &session.id,
                chorus_core::Role::Human,
                "hi",
                TurnMetadata::default(),
            )
            .unwrap();
        assert!(turn.metadata.extra.contains_key("error"));
        assert_eq!(s.health().status, HealthStatus::Degraded);
    }

    #[test]
    fn healthy_store_leaves_records_clean() {
        let s = MemoryStore::new();
        let session = s
            .create_session("alice", None, meta("alice", "bob"), None)
            .unwrap();
        assert!(!session.metadata.extra.contains_key("error"));
    }

    #[test]
    fn cursor_semantics_match_sqlite() {
        let s = MemoryStore::new();
        let session = s
            .create_session("alice", None, meta("alice", "bob"), None)
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(
                s.create_turn(
                    &session.id,
                    chorus_core::Role::Human,
                    &format!("m{i}"),
                    TurnMetadata::default(),
                )
                .unwrap()
                .id,
            );
        }
        let older = s
            .list_turns(&session.id, &TurnFilter::default(), 10, Some(&ids[2]))
            .unwrap();
        assert_eq!(
            older.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec![ids[1].as_str(), ids[0].as_str()]
        );
        assert!(s
            .list_turns(&session.id, &TurnFilter::default(), 10, Some("missing"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn nonce_dedupes_in_memory_too() {
        let s = MemoryStore::new();
        let a = s
            .create_session("alice", None, meta("alice", "bob"), Some("k"))
            .unwrap();
        let b = s
            .create_session("alice", None, meta("alice", "bob"), Some("k"))
            .unwrap();
        assert_eq!(a.id, b.id);
    }
}
