//! Human-chat REST endpoints.
//!
//! Thin wrappers over `ChatManager`: decode, call, encode. Failures come
//! back as the uniform `{success:false, error, ...}` body.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use chorus_core::MessageType;

use crate::app::AppState;
use crate::http::failure;

type Failure = (StatusCode, Json<Value>);

#[derive(Deserialize)]
pub struct CreatePrivateRequest {
    pub creator_id: String,
    pub recipient_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create_private(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePrivateRequest>,
) -> Result<Json<Value>, Failure> {
    let session = state
        .chat
        .create_private_chat(&req.creator_id, &req.recipient_id, req.title.as_deref())
        .await
        .map_err(|e| failure(e.into(), None, None))?;
    Ok(Json(json!({ "success": true, "session": session })))
}

#[derive(Deserialize)]
pub struct CreateGroupRequest {
    pub creator_id: String,
    pub member_ids: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<Value>, Failure> {
    let session = state
        .chat
        .create_group_chat(&req.creator_id, &req.member_ids, req.title.as_deref())
        .await
        .map_err(|e| failure(e.into(), None, None))?;
    Ok(Json(json!({ "success": true, "session": session })))
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Value>, Failure> {
    let message_type: MessageType = req
        .message_type
        .as_deref()
        .unwrap_or("text")
        .parse()
        .map_err(|e: String| {
            failure(
                chorus_core::ChorusError::InvalidInput(e),
                Some(&session_id),
                Some(&req.content),
            )
        })?;

    let turn = state
        .chat
        .send_message(
            &session_id,
            &req.sender_id,
            &req.content,
            message_type,
            req.metadata.unwrap_or_default(),
        )
        .await
        .map_err(|e| failure(e.into(), Some(&session_id), Some(&req.content)))?;
    Ok(Json(json!({ "success": true, "message": turn })))
}

#[derive(Deserialize)]
pub struct ActorRequest {
    pub user_id: String,
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> Result<Json<Value>, Failure> {
    let turn = state
        .chat
        .mark_as_read(&message_id, &req.user_id)
        .await
        .map_err(|e| failure(e.into(), None, None))?;
    Ok(Json(json!({ "success": true, "message": turn })))
}

pub async fn typing(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> Result<Json<Value>, Failure> {
    state
        .chat
        .notify_typing(&session_id, &req.user_id)
        .await
        .map_err(|e| failure(e.into(), Some(&session_id), None))?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct ListSessionsQuery {
    pub user_id: String,
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Value>, Failure> {
    let sessions = state
        .chat
        .list_user_sessions(&query.user_id)
        .await
        .map_err(|e| failure(e.into(), None, None))?;
    Ok(Json(json!({ "success": true, "sessions": sessions })))
}

#[derive(Deserialize)]
pub struct ListMessagesQuery {
    pub user_id: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub before_id: Option<String>,
}

fn default_limit() -> usize {
    20
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Value>, Failure> {
    let messages = state
        .chat
        .get_session_messages(
            &session_id,
            &query.user_id,
            query.limit,
            query.before_id.as_deref(),
        )
        .await
        .map_err(|e| failure(e.into(), Some(&session_id), None))?;
    Ok(Json(json!({ "success": true, "messages": messages })))
}
