use rusqlite::Connection;

use crate::error::Result;

/// Initialise all chorus tables and their indexes.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id            TEXT PRIMARY KEY,
            client_nonce  TEXT UNIQUE,
            user_id       TEXT NOT NULL,
            title         TEXT,
            dialogue_type TEXT NOT NULL,
            participants  TEXT NOT NULL,
            status        TEXT NOT NULL DEFAULT 'active',
            extra         TEXT NOT NULL DEFAULT '{}',
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            last_activity TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_updated
            ON sessions(updated_at DESC);

        CREATE TABLE IF NOT EXISTS turns (
            id           TEXT PRIMARY KEY,
            session_id   TEXT NOT NULL,
            role         TEXT NOT NULL,
            content      TEXT NOT NULL,
            sender_id    TEXT,
            message_type TEXT NOT NULL DEFAULT 'text',
            human_chat   INTEGER NOT NULL DEFAULT 0,
            read_at      TEXT NOT NULL DEFAULT '{}',
            extra        TEXT NOT NULL DEFAULT '{}',
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_turns_session
            ON turns(session_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS expressions (
            id                 TEXT PRIMARY KEY,
            user_id            TEXT NOT NULL,
            session_id         TEXT,
            expression_type    TEXT NOT NULL,
            content            TEXT NOT NULL,
            priority_score     REAL NOT NULL,
            relationship_stage TEXT NOT NULL,
            created_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_expressions_user
            ON expressions(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS user_profiles (
            user_id           TEXT PRIMARY KEY,
            name              TEXT,
            interaction_count INTEGER NOT NULL DEFAULT 0,
            preferences       TEXT NOT NULL DEFAULT '{}',
            topics            TEXT NOT NULL DEFAULT '[]',
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );",
    )?;
    Ok(())
}
