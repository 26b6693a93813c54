use std::sync::Mutex;

use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use chorus_core::types::{now_rfc3339, Role};

use crate::db::init_db;
use crate::error::{Result, StorageError};
use crate::store::DialogueStore;
use crate::types::*;

/// SQLite-backed dialogue store.
///
/// Wraps a single connection in a `Mutex`; every statement is
/// parameterized. The lock is never held across I/O outside SQLite itself.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and initialise the schema.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Unavailable {
                    detail: format!("cannot create database directory: {e}"),
                    degraded: false,
                })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Fresh in-memory database (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

const SESSION_COLUMNS: &str = "id, user_id, title, dialogue_type, participants, status, extra,
             created_at, updated_at, last_activity";
const TURN_COLUMNS: &str = "id, session_id, role, content, sender_id, message_type, human_chat,
             read_at, extra, created_at";

impl DialogueStore for SqliteStore {
    #[instrument(skip(self, metadata), fields(user_id))]
    fn create_session(
        &self,
        user_id: &str,
        title: Option<&str>,
        metadata: SessionMetadata,
        client_nonce: Option<&str>,
    ) -> Result<Session> {
        metadata.validate(user_id)?;

        let id = Uuid::now_v7().to_string();
        let now = now_rfc3339();
        let participants = serde_json::to_string(&metadata.participants)?;
        let extra = serde_json::to_string(&Value::Object(metadata.extra.clone()))?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO sessions
             (id, client_nonce, user_id, title, dialogue_type, participants, status, extra,
              created_at, updated_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?9)",
            rusqlite::params![
                id,
                client_nonce,
                user_id,
                title,
                metadata.dialogue_type.as_str(),
                participants,
                metadata.status,
                extra,
                now,
            ],
        )?;

        // Read back. With a nonce this resolves the race where two writers
        // insert the same logical session: the first insert wins and both
        // callers observe it.
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE ");
        let session = match client_nonce {
            Some(nonce) => db.query_row(
                &format!("{sql}client_nonce = ?1"),
                rusqlite::params![nonce],
                row_to_session,
            )?,
            None => db.query_row(
                &format!("{sql}id = ?1"),
                rusqlite::params![id],
                row_to_session,
            )?,
        };
        debug!(session_id = %session.id, "session created");
        Ok(session)
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            rusqlite::params![id],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StorageError::Database(e)),
        }
    }

    #[instrument(skip(self, patch), fields(session_id = id))]
    fn update_session(&self, id: &str, patch: &SessionPatch) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        let existing = match db.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            rusqlite::params![id],
            row_to_session,
        ) {
            Ok(s) => s,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(StorageError::Database(e)),
        };

        let merged = apply_session_patch(existing, patch)?;
        let now = now_rfc3339();
        let participants = serde_json::to_string(&merged.metadata.participants)?;
        let extra = serde_json::to_string(&Value::Object(merged.metadata.extra.clone()))?;

        db.execute(
            "UPDATE sessions
             SET title = ?1, status = ?2, participants = ?3, extra = ?4,
                 updated_at = ?5, last_activity = ?6
             WHERE id = ?7",
            rusqlite::params![
                merged.title,
                merged.metadata.status,
                participants,
                extra,
                now,
                merged.last_activity,
                id,
            ],
        )?;

        Ok(Some(Session {
            updated_at: now,
            ..merged
        }))
    }

    fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>> {
        let mut sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE 1=1");
        let mut params: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(ref user_id) = filter.user_id {
            params.push(user_id.clone().into());
            sql.push_str(&format!(" AND user_id = ?{}", params.len()));
        }
        if let Some(dt) = filter.dialogue_type {
            params.push(dt.as_str().to_string().into());
            sql.push_str(&format!(" AND dialogue_type = ?{}", params.len()));
        }
        if let Some(ref status) = filter.status {
            params.push(status.clone().into());
            sql.push_str(&format!(" AND status = ?{}", params.len()));
        }
        if let Some(ref participant) = filter.participant {
            // participants is a JSON array of strings; membership reduces to
            // a quoted substring match on the bound pattern.
            params.push(format!("%\"{}\"%", participant).into());
            sql.push_str(&format!(" AND participants LIKE ?{}", params.len()));
        }

        params.push((limit.min(i64::MAX as usize) as i64).into());
        sql.push_str(&format!(" ORDER BY updated_at DESC LIMIT ?{}", params.len()));
        params.push((offset as i64).into());
        sql.push_str(&format!(" OFFSET ?{}", params.len()));

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), row_to_session)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    #[instrument(skip(self, content, metadata), fields(session_id))]
    fn create_turn(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        mut metadata: TurnMetadata,
    ) -> Result<Turn> {
        let now = now_rfc3339();
        // The sender has, by definition, read their own message.
        if let Some(sender) = metadata.sender_id.clone() {
            metadata.read_at.entry(sender).or_insert_with(|| now.clone());
        }

        let id = Uuid::new_v4().to_string();
        let read_at = serde_json::to_string(&metadata.read_at)?;
        let extra = serde_json::to_string(&Value::Object(metadata.extra.clone()))?;

        let db = self.db.lock().unwrap();
        let session_exists: bool = db
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                rusqlite::params![session_id],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if !session_exists {
            return Err(StorageError::NotFound(format!("session {session_id}")));
        }

        db.execute(
            "INSERT INTO turns
             (id, session_id, role, content, sender_id, message_type, human_chat,
              read_at, extra, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                id,
                session_id,
                role.as_str(),
                content,
                metadata.sender_id,
                metadata.message_type.as_str(),
                metadata.human_chat as i64,
                read_at,
                extra,
                now,
            ],
        )?;

        Ok(Turn {
            id,
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
            metadata,
        })
    }

    fn get_turn(&self, id: &str) -> Result<Option<Turn>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?1"),
            rusqlite::params![id],
            row_to_turn,
        ) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StorageError::Database(e)),
        }
    }

    fn update_turn(&self, id: &str, patch: &TurnPatch) -> Result<Option<Turn>> {
        let db = self.db.lock().unwrap();
        let mut turn = match db.query_row(
            &format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?1"),
            rusqlite::params![id],
            row_to_turn,
        ) {
            Ok(t) => t,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(StorageError::Database(e)),
        };

        apply_turn_patch(&mut turn.metadata, patch);
        let read_at = serde_json::to_string(&turn.metadata.read_at)?;
        let extra = serde_json::to_string(&Value::Object(turn.metadata.extra.clone()))?;
        db.execute(
            "UPDATE turns SET read_at = ?1, extra = ?2 WHERE id = ?3",
            rusqlite::params![read_at, extra, id],
        )?;

        Ok(Some(turn))
    }

    fn list_turns(
        &self,
        session_id: &str,
        filter: &TurnFilter,
        limit: usize,
        before_id: Option<&str>,
    ) -> Result<Vec<Turn>> {
        let db = self.db.lock().unwrap();

        // Resolve the cursor first; an unknown before_id yields an empty
        // window rather than an error.
        let cursor: Option<(String, i64)> = match before_id {
            Some(bid) => {
                match db.query_row(
                    "SELECT created_at, rowid FROM turns WHERE id = ?1 AND session_id = ?2",
                    rusqlite::params![bid, session_id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                ) {
                    Ok(c) => Some(c),
                    Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(Vec::new()),
                    Err(e) => return Err(StorageError::Database(e)),
                }
            }
            None => None,
        };

        let mut sql = format!("SELECT {TURN_COLUMNS} FROM turns WHERE session_id = ?1");
        let mut params: Vec<rusqlite::types::Value> =
            vec![session_id.to_string().into()];

        if let Some(hc) = filter.human_chat {
            params.push((hc as i64).into());
            sql.push_str(&format!(" AND human_chat = ?{}", params.len()));
        }
        if let Some(ref sender) = filter.sender_id {
            params.push(sender.clone().into());
            sql.push_str(&format!(" AND sender_id = ?{}", params.len()));
        }
        if let Some(role) = filter.role {
            params.push(role.as_str().to_string().into());
            sql.push_str(&format!(" AND role = ?{}", params.len()));
        }
        if let Some((created_at, rowid)) = cursor {
            params.push(created_at.clone().into());
            let c = params.len();
            params.push(created_at.into());
            let c2 = params.len();
            params.push(rowid.into());
            let r = params.len();
            sql.push_str(&format!(
                " AND (created_at < ?{c} OR (created_at = ?{c2} AND rowid < ?{r}))"
            ));
        }

        params.push((limit.min(i64::MAX as usize) as i64).into());
        sql.push_str(&format!(
            " ORDER BY created_at DESC, rowid DESC LIMIT ?{}",
            params.len()
        ));

        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), row_to_turn)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn record_expression(&self, record: &ExpressionRecord) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO expressions
             (id, user_id, session_id, expression_type, content, priority_score,
              relationship_stage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.id,
                record.user_id,
                record.session_id,
                record.expression_type,
                record.content,
                record.priority_score,
                record.relationship_stage,
                record.timestamp,
            ],
        )?;
        Ok(())
    }

    fn list_expressions(&self, user_id: &str, limit: usize) -> Result<Vec<ExpressionRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, session_id, expression_type, content, priority_score,
                    relationship_stage, created_at
             FROM expressions
             WHERE user_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, limit as i64], |row| {
            Ok(ExpressionRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                session_id: row.get(2)?,
                expression_type: row.get(3)?,
                content: row.get(4)?,
                priority_score: row.get(5)?,
                relationship_stage: row.get(6)?,
                timestamp: row.get(7)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT user_id, name, interaction_count, preferences, topics, created_at, updated_at
             FROM user_profiles WHERE user_id = ?1",
            rusqlite::params![user_id],
            row_to_profile,
        ) {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StorageError::Database(e)),
        }
    }

    fn upsert_user_profile(&self, profile: &UserProfile) -> Result<()> {
        let now = now_rfc3339();
        let preferences = serde_json::to_string(&Value::Object(profile.preferences.clone()))?;
        let topics = serde_json::to_string(&profile.topics_of_interest)?;
        let db = self.db.lock().unwrap();
        // interaction_count is monotonic: an upsert can never lower it.
        db.execute(
            "INSERT INTO user_profiles
             (user_id, name, interaction_count, preferences, topics, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                name = excluded.name,
                interaction_count = MAX(user_profiles.interaction_count, excluded.interaction_count),
                preferences = excluded.preferences,
                topics = excluded.topics,
                updated_at = excluded.updated_at",
            rusqlite::params![
                profile.user_id,
                profile.name,
                profile.interaction_count as i64,
                preferences,
                topics,
                now,
            ],
        )?;
        Ok(())
    }

    fn bump_interaction_count(&self, user_id: &str) -> Result<u64> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO user_profiles (user_id, interaction_count, created_at, updated_at)
             VALUES (?1, 1, ?2, ?2)
             ON CONFLICT(user_id) DO UPDATE SET
                interaction_count = interaction_count + 1,
                updated_at = excluded.updated_at",
            rusqlite::params![user_id, now],
        )?;
        let count: i64 = db.query_row(
            "SELECT interaction_count FROM user_profiles WHERE user_id = ?1",
            rusqlite::params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn health(&self) -> StoreHealth {
        let db = self.db.lock().unwrap();
        match db.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
            Ok(_) => StoreHealth {
                status: HealthStatus::Healthy,
                detail: "sqlite ping ok".to_string(),
            },
            Err(e) => StoreHealth {
                status: HealthStatus::Degraded,
                detail: format!("sqlite ping failed: {e}"),
            },
        }
    }
}

/// Apply a session patch, enforcing immutability of `dialogue_type` and
/// the creator slot.
pub(crate) fn apply_session_patch(mut session: Session, patch: &SessionPatch) -> Result<Session> {
    if let Some(ref title) = patch.title {
        session.title = Some(title.clone());
    }
    if let Some(ref status) = patch.status {
        session.metadata.status = status.clone();
    }
    if let Some(ref last_activity) = patch.last_activity {
        session.last_activity = last_activity.clone();
    }
    if let Some(ref participants) = patch.participants {
        if participants.first().map(String::as_str) != Some(session.user_id.as_str()) {
            return Err(StorageError::InvalidInput(
                "participants[0] (creator) is immutable".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for p in participants {
            if !seen.insert(p.as_str()) {
                return Err(StorageError::InvalidInput(format!(
                    "duplicate participant: {p}"
                )));
            }
        }
        session.metadata.participants = participants.clone();
    }
    for (k, v) in &patch.extra {
        session.metadata.extra.insert(k.clone(), v.clone());
    }
    Ok(session)
}

/// Merge a turn patch: read-receipt keys are only ever added, never
/// overwritten, which makes repeated mark-as-read calls idempotent.
pub(crate) fn apply_turn_patch(metadata: &mut TurnMetadata, patch: &TurnPatch) {
    for (user, ts) in &patch.add_read_at {
        metadata
            .read_at
            .entry(user.clone())
            .or_insert_with(|| ts.clone());
    }
    for (k, v) in &patch.extra {
        metadata.extra.insert(k.clone(), v.clone());
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let dialogue_type_str: String = row.get(3)?;
    let participants_raw: String = row.get(4)?;
    let extra_raw: String = row.get(6)?;

    // Malformed stored values fall back to safe defaults rather than
    // failing the whole listing.
    let dialogue_type = dialogue_type_str
        .parse()
        .unwrap_or(chorus_core::DialogueType::HumanAiPrivate);
    let participants: Vec<String> =
        serde_json::from_str(&participants_raw).unwrap_or_default();
    let extra = decode_json_map(&extra_raw);

    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        metadata: SessionMetadata {
            dialogue_type,
            participants,
            status: row.get(5)?,
            extra,
        },
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        last_activity: row.get(9)?,
    })
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turn> {
    let role_str: String = row.get(2)?;
    let message_type_str: String = row.get(5)?;
    let read_at_raw: String = row.get(7)?;
    let extra_raw: String = row.get(8)?;

    Ok(Turn {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: role_str.parse().unwrap_or(chorus_core::Role::System),
        content: row.get(3)?,
        metadata: TurnMetadata {
            sender_id: row.get(4)?,
            message_type: message_type_str
                .parse()
                .unwrap_or(chorus_core::MessageType::Text),
            human_chat: row.get::<_, i64>(6)? != 0,
            read_at: serde_json::from_str(&read_at_raw).unwrap_or_default(),
            extra: decode_json_map(&extra_raw),
        },
        created_at: row.get(9)?,
    })
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    let preferences_raw: String = row.get(3)?;
    let topics_raw: String = row.get(4)?;
    Ok(UserProfile {
        user_id: row.get(0)?,
        name: row.get(1)?,
        interaction_count: row.get::<_, i64>(2)? as u64,
        preferences: decode_json_map(&preferences_raw),
        topics_of_interest: serde_json::from_str(&topics_raw).unwrap_or_default(),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Decode a stored JSON object column, tolerating the legacy wrapper
/// shapes (see [`crate::shape`]).
fn decode_json_map(raw: &str) -> Map<String, Value> {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(crate::shape::normalize_single)
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{DialogueType, MessageType};

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("in-memory db")
    }

    fn private_meta(creator: &str, other: &str) -> SessionMetadata {
        SessionMetadata::new(
            DialogueType::HumanHumanPrivate,
            vec![creator.to_string(), other.to_string()],
        )
    }

    #[test]
    fn create_then_get_round_trips() {
        let s = store();
        let created = s
            .create_session("alice", Some("hello"), private_meta("alice", "bob"), None)
            .unwrap();
        let fetched = s.get_session(&created.id).unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.user_id, "alice");
        assert_eq!(fetched.title.as_deref(), Some("hello"));
        assert_eq!(
            fetched.metadata.participants,
            vec!["alice".to_string(), "bob".to_string()]
        );
        assert!(fetched.updated_at >= fetched.created_at);
    }

    #[test]
    fn nonce_makes_create_idempotent() {
        let s = store();
        let a = s
            .create_session("alice", None, private_meta("alice", "bob"), Some("n-1"))
            .unwrap();
        let b = s
            .create_session("alice", None, private_meta("alice", "bob"), Some("n-1"))
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn update_session_cannot_move_creator() {
        let s = store();
        let created = s
            .create_session("alice", None, private_meta("alice", "bob"), None)
            .unwrap();
        let patch = SessionPatch {
            participants: Some(vec!["bob".into(), "alice".into()]),
            ..SessionPatch::default()
        };
        assert!(matches!(
            s.update_session(&created.id, &patch),
            Err(StorageError::InvalidInput(_))
        ));
    }

    #[test]
    fn update_session_bumps_updated_at() {
        let s = store();
        let created = s
            .create_session("alice", None, private_meta("alice", "bob"), None)
            .unwrap();
        let patch = SessionPatch {
            title: Some("renamed".into()),
            ..SessionPatch::default()
        };
        let updated = s.update_session(&created.id, &patch).unwrap().unwrap();
        assert_eq!(updated.title.as_deref(), Some("renamed"));
        assert!(updated.updated_at >= created.updated_at);
        // dialogue_type untouched
        assert_eq!(
            updated.metadata.dialogue_type,
            DialogueType::HumanHumanPrivate
        );
    }

    #[test]
    fn turn_requires_existing_session() {
        let s = store();
        let err = s.create_turn(
            "missing",
            chorus_core::Role::Human,
            "hi",
            TurnMetadata::default(),
        );
        assert!(matches!(err, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn sender_read_receipt_is_set_on_write() {
        let s = store();
        let session = s
            .create_session("alice", None, private_meta("alice", "bob"), None)
            .unwrap();
        let turn = s
            .create_turn(
                &session.id,
                chorus_core::Role::Human,
                "hi",
                TurnMetadata {
                    sender_id: Some("alice".into()),
                    human_chat: true,
                    ..TurnMetadata::default()
                },
            )
            .unwrap();
        assert!(turn.metadata.read_at.contains_key("alice"));
    }

    #[test]
    fn read_receipts_are_idempotent_and_never_cleared() {
        let s = store();
        let session = s
            .create_session("alice", None, private_meta("alice", "bob"), None)
            .unwrap();
        let turn = s
            .create_turn(
                &session.id,
                chorus_core::Role::Human,
                "hi",
                TurnMetadata {
                    sender_id: Some("alice".into()),
                    human_chat: true,
                    ..TurnMetadata::default()
                },
            )
            .unwrap();

        let first = s
            .update_turn(&turn.id, &TurnPatch::read_receipt("bob", "2026-01-01T00:00:00Z"))
            .unwrap()
            .unwrap();
        let first_ts = first.metadata.read_at.get("bob").cloned().unwrap();

        let second = s
            .update_turn(&turn.id, &TurnPatch::read_receipt("bob", "2026-02-02T00:00:00Z"))
            .unwrap()
            .unwrap();
        assert_eq!(second.metadata.read_at.get("bob"), Some(&first_ts));
        assert!(second.metadata.read_at.contains_key("alice"));
    }

    #[test]
    fn list_turns_newest_first_with_cursor() {
        let s = store();
        let session = s
            .create_session("alice", None, private_meta("alice", "bob"), None)
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let t = s
                .create_turn(
                    &session.id,
                    chorus_core::Role::Human,
                    &format!("msg {i}"),
                    TurnMetadata {
                        sender_id: Some("alice".into()),
                        human_chat: true,
                        ..TurnMetadata::default()
                    },
                )
                .unwrap();
            ids.push(t.id);
        }

        let newest = s
            .list_turns(&session.id, &TurnFilter::default(), 2, None)
            .unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].id, ids[4]);
        assert_eq!(newest[1].id, ids[3]);

        // cursor excludes before_id and walks backwards
        let older = s
            .list_turns(&session.id, &TurnFilter::default(), 10, Some(&ids[3]))
            .unwrap();
        assert_eq!(
            older.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec![ids[2].as_str(), ids[1].as_str(), ids[0].as_str()]
        );
    }

    #[test]
    fn unknown_before_id_returns_empty_list() {
        let s = store();
        let session = s
            .create_session("alice", None, private_meta("alice", "bob"), None)
            .unwrap();
        s.create_turn(
            &session.id,
            chorus_core::Role::Human,
            "hi",
            TurnMetadata::default(),
        )
        .unwrap();
        let turns = s
            .list_turns(&session.id, &TurnFilter::default(), 10, Some("nope"))
            .unwrap();
        assert!(turns.is_empty());
    }

    #[test]
    fn human_chat_filter_applies() {
        let s = store();
        let session = s
            .create_session("alice", None, private_meta("alice", "bob"), None)
            .unwrap();
        s.create_turn(
            &session.id,
            chorus_core::Role::Human,
            "human one",
            TurnMetadata {
                sender_id: Some("alice".into()),
                human_chat: true,
                ..TurnMetadata::default()
            },
        )
        .unwrap();
        s.create_turn(
            &session.id,
            chorus_core::Role::Ai,
            "ai reply",
            TurnMetadata::default(),
        )
        .unwrap();

        let human_only = s
            .list_turns(&session.id, &TurnFilter::human_chat_only(), 10, None)
            .unwrap();
        assert_eq!(human_only.len(), 1);
        assert_eq!(human_only[0].content, "human one");
    }

    #[test]
    fn list_sessions_participant_filter() {
        let s = store();
        s.create_session("alice", None, private_meta("alice", "bob"), None)
            .unwrap();
        s.create_session("carol", None, private_meta("carol", "dave"), None)
            .unwrap();

        let bobs = s
            .list_sessions(
                &SessionFilter {
                    participant: Some("bob".into()),
                    ..SessionFilter::default()
                },
                10,
                0,
            )
            .unwrap();
        assert_eq!(bobs.len(), 1);
        assert!(bobs[0].is_participant("bob"));
    }

    #[test]
    fn interaction_count_is_monotonic() {
        let s = store();
        assert_eq!(s.bump_interaction_count("u1").unwrap(), 1);
        assert_eq!(s.bump_interaction_count("u1").unwrap(), 2);

        // an upsert with a lower count cannot decrease it
        let mut profile = s.get_user_profile("u1").unwrap().unwrap();
        profile.interaction_count = 0;
        s.upsert_user_profile(&profile).unwrap();
        assert_eq!(
            s.get_user_profile("u1").unwrap().unwrap().interaction_count,
            2
        );
    }

    #[test]
    fn expressions_round_trip() {
        let s = store();
        let rec = ExpressionRecord {
            id: "e1".into(),
            user_id: "u1".into(),
            session_id: Some("s1".into()),
            expression_type: "greeting".into(),
            content: "hey there".into(),
            priority_score: 0.8,
            relationship_stage: "familiar".into(),
            timestamp: now_rfc3339(),
        };
        s.record_expression(&rec).unwrap();
        let listed = s.list_expressions("u1", 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].expression_type, "greeting");
        assert!((listed[0].priority_score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn message_type_survives_round_trip() {
        let s = store();
        let session = s
            .create_session("alice", None, private_meta("alice", "bob"), None)
            .unwrap();
        let t = s
            .create_turn(
                &session.id,
                chorus_core::Role::Human,
                "now",
                TurnMetadata {
                    sender_id: Some("alice".into()),
                    message_type: MessageType::Urgent,
                    human_chat: true,
                    ..TurnMetadata::default()
                },
            )
            .unwrap();
        let fetched = s.get_turn(&t.id).unwrap().unwrap();
        assert_eq!(fetched.metadata.message_type, MessageType::Urgent);
    }
}
