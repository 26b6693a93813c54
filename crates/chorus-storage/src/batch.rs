//! Bulk fan-in reads and the message-history query.
//!
//! Collapses N independent lookups into chunks of at most `batch_size`
//! concurrent requests, returning id-keyed maps with missing ids absent.

use std::collections::HashMap;

use futures_util::future::join_all;
use tracing::debug;

use crate::error::Result;
use crate::store::Storage;
use crate::types::{Session, Turn, TurnFilter, TurnPatch};

/// Upper bound used when a "fetch everything" scan is required.
const FULL_SCAN_LIMIT: usize = 100_000;

/// Fetch many sessions by id. Missing ids are absent from the result map.
pub async fn batch_get_sessions(
    storage: &Storage,
    ids: &[String],
    batch_size: usize,
) -> Result<HashMap<String, Session>> {
    let mut results = HashMap::with_capacity(ids.len());
    for chunk in ids.chunks(batch_size.max(1)) {
        let lookups = join_all(chunk.iter().map(|id| storage.get_session(id))).await;
        for (id, looked_up) in chunk.iter().zip(lookups) {
            if let Some(session) = looked_up? {
                results.insert(id.clone(), session);
            }
        }
    }
    Ok(results)
}

/// Fetch many turns by id. Missing ids are absent from the result map.
pub async fn batch_get_turns(
    storage: &Storage,
    ids: &[String],
    batch_size: usize,
) -> Result<HashMap<String, Turn>> {
    let mut results = HashMap::with_capacity(ids.len());
    for chunk in ids.chunks(batch_size.max(1)) {
        let lookups = join_all(chunk.iter().map(|id| storage.get_turn(id))).await;
        for (id, looked_up) in chunk.iter().zip(lookups) {
            if let Some(turn) = looked_up? {
                results.insert(id.clone(), turn);
            }
        }
    }
    Ok(results)
}

/// Apply many turn patches. The result maps each id to whether the turn
/// existed and was updated.
pub async fn batch_update_turns(
    storage: &Storage,
    updates: Vec<(String, TurnPatch)>,
    batch_size: usize,
) -> Result<HashMap<String, bool>> {
    let mut results = HashMap::with_capacity(updates.len());
    for chunk in updates.chunks(batch_size.max(1)) {
        let applied = join_all(
            chunk
                .iter()
                .map(|(id, patch)| storage.update_turn(id, patch.clone())),
        )
        .await;
        for ((id, _), outcome) in chunk.iter().zip(applied) {
            results.insert(id.clone(), outcome?.is_some());
        }
    }
    Ok(results)
}

/// Message-history query: all human-chat turns of a session, newest first,
/// windowed by the `before_id` cursor and truncated to `limit`.
pub async fn list_human_turns(
    storage: &Storage,
    session_id: &str,
    limit: usize,
    before_id: Option<&str>,
) -> Result<Vec<Turn>> {
    storage
        .list_turns(
            session_id,
            TurnFilter::human_chat_only(),
            limit.min(FULL_SCAN_LIMIT),
            before_id,
        )
        .await
}

/// Run a storage future and log its latency.
pub async fn timed<T, F>(name: &str, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let result = fut.await;
    debug!(
        query = name,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "storage query finished"
    );
    result
}
