//! AI dialogue endpoints: session creation and per-turn processing.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use chorus_core::{ChorusError, DialogueType};

use crate::app::AppState;
use crate::http::failure;

type Failure = (StatusCode, Json<Value>);

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    pub dialogue_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub participants: Option<Vec<String>>,
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<Value>, Failure> {
    let dialogue_type: DialogueType = req
        .dialogue_type
        .parse()
        .map_err(|e: String| failure(ChorusError::InvalidInput(e), None, None))?;

    let session = state
        .dialogue
        .create_session(
            &req.user_id,
            dialogue_type,
            req.title.as_deref(),
            req.participants,
        )
        .await
        .map_err(|e| failure(e.into(), None, None))?;
    Ok(Json(json!({ "success": true, "session": session })))
}

#[derive(Deserialize)]
pub struct ProcessInputRequest {
    /// Must be the session id string; a JSON object is rejected.
    pub session_id: Value,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

pub async fn process_input(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProcessInputRequest>,
) -> Result<Json<Value>, Failure> {
    // Only the string form is accepted for session_id.
    let Some(session_id) = req.session_id.as_str().map(str::to_string) else {
        return Err(failure(
            ChorusError::InvalidInput(
                "session_id must be a string (pass session.id, not the session object)"
                    .to_string(),
            ),
            None,
            Some(&req.content),
        ));
    };

    let input_type = req.input_type.as_deref().unwrap_or("text");

    // Keep the proactive pipeline's picture of this session current.
    state
        .integrator
        .process_user_message(&session_id, &req.user_id, &req.content, Some(input_type))
        .await;

    // One cancellation token per session; /dialogue/{id}/stop fires it.
    let cancel = CancellationToken::new();
    state
        .active_operations
        .insert(session_id.clone(), cancel.clone());

    let result = state
        .dialogue
        .process_input(
            &session_id,
            &req.user_id,
            &req.content,
            input_type,
            req.metadata.unwrap_or_default(),
            Some(&cancel),
        )
        .await;
    state.active_operations.remove(&session_id);
    let result =
        result.map_err(|e| failure(e.into(), Some(&session_id), Some(&req.content)))?;

    state
        .integrator
        .process_system_response(&session_id, &result.response);

    Ok(Json(json!(result)))
}

/// POST /dialogue/{session_id}/stop — cancel the in-flight request for a
/// session, if any.
pub async fn stop(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    let cancelled = match state.active_operations.get(&session_id) {
        Some(token) => {
            token.cancel();
            true
        }
        None => false,
    };
    Json(json!({ "success": true, "cancelled": cancelled }))
}
