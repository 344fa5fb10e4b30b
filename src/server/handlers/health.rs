use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "rag_enabled": state.coordinator.is_enabled(),
        "active_index_tasks": state.coordinator.active_task_count(),
    }))
}
