use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /health — storage ping plus the degraded flag.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let health = state.storage.health().await;
    Json(json!({
        "status": health.status,
        "detail": health.detail,
        "degraded": state.storage.is_degraded(),
        "monitored_sessions": state.integrator.session_count(),
        "timestamp": chorus_core::types::now_rfc3339(),
    }))
}
