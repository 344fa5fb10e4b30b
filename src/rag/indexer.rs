//! End-to-end indexing of a single document.

use std::sync::Arc;

use chrono::Utc;

use crate::core::errors::ApiError;
use crate::db::documents::Document;
use crate::rag::chunker::{self, ChunkParams};
use crate::rag::embedder::Embedder;
use crate::rag::store::{RecordMetadata, VectorFilter, VectorRecord, VectorStore};

const INSERT_BATCH_SIZE: usize = 100;

pub struct RagIndexer {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    params: ChunkParams,
}

impl RagIndexer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        params: ChunkParams,
    ) -> Self {
        Self {
            embedder,
            vectors,
            params,
        }
    }

    /// Rebuild the vector namespace of one document: delete whatever is
    /// stored for it, then chunk, embed, and insert the current content.
    /// Returns the number of chunks written. Starting with the delete makes
    /// the operation idempotent and lets concurrent runs on the same
    /// document converge - the last delete-then-insert wins.
    pub async fn reindex(
        &self,
        user_id: &str,
        document: &Document,
        params: Option<ChunkParams>,
    ) -> Result<usize, ApiError> {
        let filter = VectorFilter::doc(user_id, &document.id);
        self.vectors
            .delete(&filter)
            .await
            .map_err(ApiError::index)?;

        if !document.kind.indexable() {
            return Ok(0);
        }

        let chunks = chunker::chunk(&document.content, params.unwrap_or(self.params));
        if chunks.is_empty() {
            return Ok(0);
        }

        let embeddings = self
            .embedder
            .embed(&chunks)
            .await
            .map_err(ApiError::index)?;

        let created_at = Utc::now().timestamp_millis();
        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(chunk_index, (content, embedding))| VectorRecord {
                embedding,
                content,
                source: document.name.clone(),
                metadata: RecordMetadata {
                    kb_id: document.knowledge_base_id.clone(),
                    doc_id: document.id.clone(),
                    doc_kind: document.kind.as_str().to_string(),
                    doc_name: document.name.clone(),
                    user_id: user_id.to_string(),
                    chunk_index: chunk_index as i64,
                },
                created_at,
            })
            .collect();

        let total = records.len();
        for batch in records.chunks(INSERT_BATCH_SIZE) {
            self.vectors
                .insert(batch.to_vec())
                .await
                .map_err(ApiError::index)?;
        }

        Ok(total)
    }
}
