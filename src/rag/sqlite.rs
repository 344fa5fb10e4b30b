//! SQLite-backed vector store.
//!
//! Chunk text and metadata live in SQLite; embeddings are serialized as
//! little-endian `f32` BLOBs and scored in process with an exact L2 scan.
//! No external vector server required, which keeps the whole service a
//! single binary plus two database files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::core::errors::ApiError;
use crate::db;
use crate::rag::store::{
    RecordMetadata, SearchHit, VectorFilter, VectorRecord, VectorStore, MAX_CONTENT_CHARS,
    MAX_SOURCE_CHARS,
};

pub struct SqliteVectorStore {
    pool: SqlitePool,
    dim: AtomicUsize,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl SqliteVectorStore {
    pub async fn with_path(db_path: &Path) -> Result<Self, ApiError> {
        let pool = db::connect(db_path).await?;
        Ok(Self {
            pool,
            dim: AtomicUsize::new(0),
            db_path: db_path.to_path_buf(),
        })
    }

    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn l2_distance(a: &[f32], b: &[f32]) -> Option<f32> {
        if a.len() != b.len() || a.is_empty() {
            return None;
        }
        let sum: f32 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
        Some(sum.sqrt())
    }

    /// `(where_clause, binds)` for a metadata equality filter.
    fn filter_sql(filter: &VectorFilter) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();

        if let Some(user_id) = &filter.user_id {
            clauses.push("json_extract(metadata, '$.user_id') = ?");
            binds.push(user_id.clone());
        }
        if let Some(kb_id) = &filter.kb_id {
            clauses.push("json_extract(metadata, '$.kb_id') = ?");
            binds.push(kb_id.clone());
        }
        if let Some(doc_id) = &filter.doc_id {
            clauses.push("json_extract(metadata, '$.doc_id') = ?");
            binds.push(doc_id.clone());
        }

        (clauses.join(" AND "), binds)
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn ensure_collection(&self, dim: usize) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kb_vectors (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                embedding BLOB NOT NULL,
                content TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::store)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_kb_vectors_user_doc ON kb_vectors \
             (json_extract(metadata, '$.user_id'), json_extract(metadata, '$.doc_id'))",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::store)?;

        self.dim.store(dim, Ordering::SeqCst);
        Ok(())
    }

    async fn insert(&self, records: Vec<VectorRecord>) -> Result<Vec<i64>, ApiError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let dim = self.dim.load(Ordering::SeqCst);
        let mut tx = self.pool.begin().await.map_err(ApiError::store)?;
        let mut pks = Vec::with_capacity(records.len());

        for record in &records {
            if dim != 0 && record.embedding.len() != dim {
                return Err(ApiError::Store(format!(
                    "embedding dimension mismatch: expected {dim}, got {}",
                    record.embedding.len()
                )));
            }
            if record.content.chars().count() > MAX_CONTENT_CHARS {
                return Err(ApiError::Store("content exceeds 65535 chars".to_string()));
            }
            if record.source.chars().count() > MAX_SOURCE_CHARS {
                return Err(ApiError::Store("source exceeds 512 chars".to_string()));
            }

            let blob = Self::serialize_embedding(&record.embedding);
            let metadata =
                serde_json::to_string(&record.metadata).map_err(ApiError::store)?;

            let result = sqlx::query(
                "INSERT INTO kb_vectors (embedding, content, source, metadata, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&blob)
            .bind(&record.content)
            .bind(&record.source)
            .bind(&metadata)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::store)?;

            pks.push(result.last_insert_rowid());
        }

        tx.commit().await.map_err(ApiError::store)?;
        tracing::debug!("Inserted {} vectors", pks.len());
        Ok(pks)
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<SearchHit>, ApiError> {
        let (where_clause, binds) = Self::filter_sql(filter);
        let sql = if where_clause.is_empty() {
            "SELECT pk, embedding, content, source, metadata FROM kb_vectors".to_string()
        } else {
            format!(
                "SELECT pk, embedding, content, source, metadata FROM kb_vectors WHERE {where_clause}"
            )
        };

        let mut query_builder = sqlx::query(&sql);
        for bind in &binds {
            query_builder = query_builder.bind(bind);
        }
        let rows = query_builder
            .fetch_all(&self.pool)
            .await
            .map_err(ApiError::store)?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.try_get("embedding").ok()?;
                let embedding = Self::deserialize_embedding(&blob);
                let distance = Self::l2_distance(query, &embedding)?;

                let metadata_text: String = row.try_get("metadata").ok()?;
                let metadata: RecordMetadata = serde_json::from_str(&metadata_text).ok()?;

                Some(SearchHit {
                    pk: row.try_get("pk").unwrap_or_default(),
                    content: row.try_get("content").unwrap_or_default(),
                    source: row.try_get("source").unwrap_or_default(),
                    metadata,
                    distance,
                    score: 1.0 / (1.0 + distance),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.pk.cmp(&b.pk))
        });
        hits.truncate(top_k);

        Ok(hits)
    }

    async fn delete(&self, filter: &VectorFilter) -> Result<u64, ApiError> {
        if filter.is_empty() {
            return Err(ApiError::Validation(
                "refusing to delete vectors without a filter".to_string(),
            ));
        }

        let (where_clause, binds) = Self::filter_sql(filter);
        let sql = format!("DELETE FROM kb_vectors WHERE {where_clause}");

        let mut query_builder = sqlx::query(&sql);
        for bind in &binds {
            query_builder = query_builder.bind(bind);
        }
        let result = query_builder
            .execute(&self.pool)
            .await
            .map_err(ApiError::store)?;

        Ok(result.rows_affected())
    }
}
