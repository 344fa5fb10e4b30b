use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::errors::ApiError;
use crate::core::security::resolve_user;
use crate::db::documents::Document;
use crate::rag::chunker::ChunkParams;
use crate::rag::store::VectorFilter;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct IndexRequest {
    pub kb_id: String,
    pub max_tokens: Option<usize>,
    pub overlap_tokens: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct IndexStats {
    pub kb_id: String,
    pub total_documents: usize,
    pub indexed_documents: usize,
    pub skipped_documents: usize,
    /// Indexing runs in the background; chunk counts land on the document
    /// rows as tasks finish.
    pub total_chunks: usize,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub kb_id: Option<String>,
    pub top_k: Option<usize>,
}

fn chunk_overrides(
    max_tokens: Option<usize>,
    overlap_tokens: Option<usize>,
) -> Result<Option<ChunkParams>, ApiError> {
    if max_tokens.is_none() && overlap_tokens.is_none() {
        return Ok(None);
    }
    let params = ChunkParams {
        max_tokens: max_tokens.unwrap_or(ChunkParams::default().max_tokens),
        overlap_tokens: overlap_tokens.unwrap_or(ChunkParams::default().overlap_tokens),
    };
    if !(128..=2048).contains(&params.max_tokens) {
        return Err(ApiError::Validation(
            "max_tokens must be between 128 and 2048".to_string(),
        ));
    }
    if params.overlap_tokens > 512 {
        return Err(ApiError::Validation(
            "overlap_tokens must be at most 512".to_string(),
        ));
    }
    if params.overlap_tokens >= params.max_tokens {
        return Err(ApiError::Validation(
            "overlap_tokens must be smaller than max_tokens".to_string(),
        ));
    }
    Ok(Some(params))
}

/// Submit every document of a knowledge base for background indexing.
pub async fn index_knowledge_base(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<IndexRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = resolve_user(&headers)?;
    if !state.coordinator.is_enabled() {
        return Err(ApiError::Disabled);
    }
    let params = chunk_overrides(payload.max_tokens, payload.overlap_tokens)?;

    // Opportunistic sweep: stuck rows surface as `timeout` before the new
    // submissions replace them.
    if let Err(err) = state.coordinator.check_timeout_tasks().await {
        tracing::warn!("Timeout sweep failed: {}", err);
    }

    let (documents, total) = state
        .documents
        .list_by_kb(&user_id, &payload.kb_id, 0, 0, None)
        .await?;
    if documents.is_empty() {
        return Err(ApiError::NotFound(
            "knowledge base not found or has no documents".to_string(),
        ));
    }

    let mut indexed = 0;
    let mut skipped = 0;
    for doc in &documents {
        if !doc.kind.indexable() {
            skipped += 1;
            continue;
        }
        state.coordinator.submit(&user_id, doc, params).await?;
        indexed += 1;
    }

    Ok(Json(IndexStats {
        kb_id: payload.kb_id,
        total_documents: total as usize,
        indexed_documents: indexed,
        skipped_documents: skipped,
        total_chunks: 0,
    }))
}

/// Resubmit a single document for indexing.
pub async fn reindex_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(doc_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = resolve_user(&headers)?;
    if !state.coordinator.is_enabled() {
        return Err(ApiError::Disabled);
    }
    let doc: Document = state
        .documents
        .get(&user_id, &doc_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("document not found".to_string()))?;

    let (indexed, skipped) = if doc.kind.indexable() {
        state.coordinator.on_document_updated(&user_id, &doc).await?;
        (1, 0)
    } else {
        (0, 1)
    };

    Ok(Json(IndexStats {
        kb_id: doc.knowledge_base_id,
        total_documents: 1,
        indexed_documents: indexed,
        skipped_documents: skipped,
        total_chunks: 0,
    }))
}

pub async fn delete_document_index(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(doc_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = resolve_user(&headers)?;
    let deleted = state.coordinator.on_document_deleted(&user_id, &doc_id).await?;
    Ok(Json(json!({"deleted": deleted})))
}

pub async fn delete_kb_index(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(kb_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = resolve_user(&headers)?;
    let deleted = state
        .vectors
        .delete(&VectorFilter::kb(&user_id, &kb_id))
        .await?;
    Ok(Json(json!({"deleted": deleted})))
}

/// Semantic search across one knowledge base, or all of the user's
/// knowledge bases when `kb_id` is omitted.
pub async fn search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = resolve_user(&headers)?;
    if !state.coordinator.is_enabled() {
        return Err(ApiError::Disabled);
    }

    let query = payload.query.trim();
    if query.is_empty() {
        return Err(ApiError::Validation("query is empty".to_string()));
    }
    if query.chars().count() > 1000 {
        return Err(ApiError::Validation(
            "query must be at most 1000 chars".to_string(),
        ));
    }
    let top_k = payload.top_k.unwrap_or(5);
    if !(1..=20).contains(&top_k) {
        return Err(ApiError::Validation(
            "top_k must be between 1 and 20".to_string(),
        ));
    }

    if let Err(err) = state.coordinator.check_timeout_tasks().await {
        tracing::warn!("Timeout sweep failed: {}", err);
    }

    let texts = [query.to_string()];
    let mut embeddings = state.embedder.embed(&texts).await?;
    let query_vec = embeddings
        .pop()
        .ok_or_else(|| ApiError::Model("empty embedding response".to_string()))?;

    let filter = match &payload.kb_id {
        Some(kb_id) => VectorFilter::kb(&user_id, kb_id),
        None => VectorFilter::user(&user_id),
    };
    let hits = state.vectors.search(&query_vec, top_k, &filter).await?;

    let results: Vec<_> = hits
        .iter()
        .map(|hit| {
            json!({
                "content": hit.content,
                "source": hit.source,
                "score": hit.score,
                "metadata": hit.metadata,
            })
        })
        .collect();

    Ok(Json(json!({
        "query": query,
        "kb_id": payload.kb_id,
        "total": results.len(),
        "results": results,
    })))
}
