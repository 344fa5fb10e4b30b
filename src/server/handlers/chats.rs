use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::core::errors::ApiError;
use crate::core::security::resolve_user;
use crate::server::sse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub title: String,
    pub knowledge_base_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionRequest {
    pub title: Option<String>,
    pub knowledge_base_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = resolve_user(&headers)?;
    let session = state
        .chats
        .create_session(&user_id, &payload.title, payload.knowledge_base_id.as_deref())
        .await?;
    Ok(Json(session))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = resolve_user(&headers)?;
    let sessions = state
        .chats
        .list_sessions(&user_id, page.skip, page.limit)
        .await?;
    Ok(Json(sessions))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = resolve_user(&headers)?;
    let session = state
        .chats
        .get_session(&user_id, &session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("chat session not found".to_string()))?;
    Ok(Json(session))
}

pub async fn update_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(payload): Json<UpdateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = resolve_user(&headers)?;
    let session = state
        .chats
        .update_session(
            &user_id,
            &session_id,
            payload.title.as_deref(),
            payload.knowledge_base_id.as_deref(),
        )
        .await?
        .ok_or_else(|| ApiError::NotFound("chat session not found".to_string()))?;
    Ok(Json(session))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = resolve_user(&headers)?;
    let deleted = state.chats.delete_session(&user_id, &session_id).await?;
    if !deleted {
        return Err(ApiError::NotFound("chat session not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = resolve_user(&headers)?;
    // Ownership check before touching messages.
    state
        .chats
        .get_session(&user_id, &session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("chat session not found".to_string()))?;

    let messages = state
        .chats
        .list_messages(&session_id, page.skip, page.limit)
        .await?;
    Ok(Json(messages))
}

/// Send a message and stream the reply as `text/event-stream`. Session and
/// input validation fail as plain HTTP errors; everything after the
/// response switches to streaming is reported as events.
pub async fn post_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(payload): Json<PostMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = resolve_user(&headers)?;
    if payload.content.trim().is_empty() {
        return Err(ApiError::Validation("message content is empty".to_string()));
    }

    let rx = state
        .pipeline
        .send(&user_id, &session_id, payload.content)
        .await?;
    Ok(sse::event_stream(rx))
}
