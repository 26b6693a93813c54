pub mod chat;
pub mod dialogue;
pub mod health;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use chorus_core::ChorusError;

/// Uniform failure body: `{success:false, error, id, timestamp, ...}`.
pub fn failure(
    err: ChorusError,
    session_id: Option<&str>,
    input: Option<&str>,
) -> (StatusCode, Json<Value>) {
    let status = match &err {
        ChorusError::NotFound(_) => StatusCode::NOT_FOUND,
        ChorusError::Forbidden(_) => StatusCode::FORBIDDEN,
        ChorusError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ChorusError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        ChorusError::StorageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ChorusError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut body = json!({
        "success": false,
        "error": err.to_string(),
        "code": err.code(),
        "id": Uuid::new_v4().to_string(),
        "timestamp": chorus_core::types::now_rfc3339(),
    });
    if let Some(sid) = session_id {
        body["sessionId"] = Value::String(sid.to_string());
    }
    if let Some(input) = input {
        body["input"] = Value::String(input.to_string());
    }
    (status, Json(body))
}
