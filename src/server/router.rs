use std::sync::Arc;

use axum::http::{header, Method};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::server::handlers::{chats, health, rag};
use crate::state::AppState;

/// Assemble the application router: health probe, versioned chat and
/// indexing API, CORS, and request tracing.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/api/v1/chats",
            get(chats::list_sessions).post(chats::create_session),
        )
        .route(
            "/api/v1/chats/:session_id",
            get(chats::get_session)
                .put(chats::update_session)
                .delete(chats::delete_session),
        )
        .route(
            "/api/v1/chats/:session_id/messages",
            get(chats::list_messages).post(chats::post_message),
        )
        .route("/api/v1/rag/index", post(rag::index_knowledge_base))
        .route("/api/v1/rag/index/:kb_id", delete(rag::delete_kb_index))
        .route(
            "/api/v1/rag/index/document/:doc_id",
            delete(rag::delete_document_index),
        )
        .route(
            "/api/v1/rag/reindex/document/:doc_id",
            post(rag::reindex_document),
        )
        .route("/api/v1/rag/search", post(rag::search))
        .with_state(state)
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::ACCEPT, header::AUTHORIZATION, header::CONTENT_TYPE])
}
