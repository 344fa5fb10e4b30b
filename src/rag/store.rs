//! Vector storage abstraction.
//!
//! The collection schema is fixed for migration compatibility:
//! `pk` (store-assigned int64), `embedding` (float vector), `content`
//! (text, max 65535 chars), `source` (max 512 chars), `metadata`
//! (structured map), `created_at` (ms epoch). Server-backed
//! implementations index with IVF_FLAT over L2 (nlist 128, nprobe 10);
//! the embedded implementation in [`crate::rag::sqlite`] scans exactly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::errors::ApiError;

pub const MAX_CONTENT_CHARS: usize = 65_535;
pub const MAX_SOURCE_CHARS: usize = 512;

/// Structured metadata attached to every stored vector. `user_id` scopes
/// all queries; `doc_id` ties a chunk to its document for replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub kb_id: String,
    pub doc_id: String,
    pub doc_kind: String,
    pub doc_name: String,
    pub user_id: String,
    pub chunk_index: i64,
}

#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub embedding: Vec<f32>,
    pub content: String,
    pub source: String,
    pub metadata: RecordMetadata,
    pub created_at: i64,
}

/// Equality filter over metadata fields. At least one field must be set;
/// `user_id` is set on every query issued by this service.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub user_id: Option<String>,
    pub kb_id: Option<String>,
    pub doc_id: Option<String>,
}

impl VectorFilter {
    pub fn user(user_id: &str) -> Self {
        VectorFilter {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        }
    }

    pub fn doc(user_id: &str, doc_id: &str) -> Self {
        VectorFilter {
            user_id: Some(user_id.to_string()),
            doc_id: Some(doc_id.to_string()),
            ..Default::default()
        }
    }

    pub fn kb(user_id: &str, kb_id: &str) -> Self {
        VectorFilter {
            user_id: Some(user_id.to_string()),
            kb_id: Some(kb_id.to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.kb_id.is_none() && self.doc_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub pk: i64,
    pub content: String,
    pub source: String,
    pub metadata: RecordMetadata,
    /// L2 distance to the query; hits are ordered by it ascending.
    pub distance: f32,
    /// `1 / (1 + distance)`, higher is better.
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotently create the collection for vectors of dimension `dim`.
    async fn ensure_collection(&self, dim: usize) -> Result<(), ApiError>;

    /// Append records; returns the assigned primary keys in input order.
    async fn insert(&self, records: Vec<VectorRecord>) -> Result<Vec<i64>, ApiError>;

    /// Up to `top_k` hits matching `filter`, ordered by ascending distance
    /// with ties broken by ascending pk.
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<SearchHit>, ApiError>;

    /// Delete everything matching `filter`; returns the count removed.
    /// Tolerates zero matches.
    async fn delete(&self, filter: &VectorFilter) -> Result<u64, ApiError>;
}
