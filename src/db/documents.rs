//! Document rows and their embedded index state.
//!
//! The index-state columns are the single point of concurrent writes in the
//! system: the coordinator's submission path, its workers, and the timeout
//! sweep all race on them. Every such write goes through
//! [`DocumentRepo::compare_and_set_index_state`], a single conditional
//! `UPDATE` whose `WHERE` clause carries the expected task uuid, so the
//! storage layer serializes the race.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::core::errors::ApiError;
use crate::db::now_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocKind {
    Note,
    Uploaded,
    Folder,
}

impl DocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::Note => "note",
            DocKind::Uploaded => "uploaded",
            DocKind::Folder => "folder",
        }
    }

    fn parse(value: &str) -> DocKind {
        match value {
            "uploaded" => DocKind::Uploaded,
            "folder" => DocKind::Folder,
            _ => DocKind::Note,
        }
    }

    /// Folders hold no indexable text.
    pub fn indexable(&self) -> bool {
        !matches!(self, DocKind::Folder)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Pending,
    Indexing,
    Completed,
    Failed,
    Timeout,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Pending => "pending",
            IndexStatus::Indexing => "indexing",
            IndexStatus::Completed => "completed",
            IndexStatus::Failed => "failed",
            IndexStatus::Timeout => "timeout",
        }
    }

    fn parse(value: &str) -> IndexStatus {
        match value {
            "indexing" => IndexStatus::Indexing,
            "completed" => IndexStatus::Completed,
            "failed" => IndexStatus::Failed,
            "timeout" => IndexStatus::Timeout,
            _ => IndexStatus::Pending,
        }
    }
}

/// Index progress embedded in the document row, returned verbatim to
/// clients so they can poll for it.
#[derive(Debug, Clone, Serialize)]
pub struct IndexState {
    pub status: IndexStatus,
    pub task_uuid: Option<String>,
    pub worker_id: Option<i64>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

impl IndexState {
    pub fn pending() -> Self {
        IndexState {
            status: IndexStatus::Pending,
            task_uuid: None,
            worker_id: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Fresh `indexing` state installed at submission time.
    pub fn indexing(task_uuid: &str) -> Self {
        IndexState {
            status: IndexStatus::Indexing,
            task_uuid: Some(task_uuid.to_string()),
            worker_id: None,
            started_at: Some(now_rfc3339()),
            completed_at: None,
            error: None,
        }
    }

    pub fn completed(&self) -> Self {
        IndexState {
            status: IndexStatus::Completed,
            completed_at: Some(now_rfc3339()),
            error: None,
            ..self.clone()
        }
    }

    pub fn failed(&self, error: &str) -> Self {
        IndexState {
            status: IndexStatus::Failed,
            completed_at: Some(now_rfc3339()),
            error: Some(error.to_string()),
            ..self.clone()
        }
    }

    pub fn timed_out(&self) -> Self {
        IndexState {
            status: IndexStatus::Timeout,
            completed_at: Some(now_rfc3339()),
            error: Some("Task exceeded timeout limit".to_string()),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub knowledge_base_id: String,
    pub folder_id: Option<String>,
    pub user_id: String,
    pub name: String,
    pub kind: DocKind,
    pub summary: Option<String>,
    pub content: String,
    pub created_at: String,
    pub updated_at: String,
    pub index_state: IndexState,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub name: String,
    pub kind: DocKind,
    pub content: String,
    pub folder_id: Option<String>,
    pub summary: Option<String>,
}

impl NewDocument {
    pub fn note(name: &str, content: &str) -> Self {
        NewDocument {
            name: name.to_string(),
            kind: DocKind::Note,
            content: content.to_string(),
            folder_id: None,
            summary: None,
        }
    }
}

/// An `indexing` row whose worker has exceeded the timeout budget.
#[derive(Debug, Clone)]
pub struct StaleTask {
    pub user_id: String,
    pub doc_id: String,
    pub state: IndexState,
}

const DOCUMENT_COLUMNS: &str = "id, knowledge_base_id, folder_id, user_id, name, doc_kind, \
     summary, content, created_at, updated_at, \
     rag_index_status, rag_index_task_uuid, rag_index_thread_id, \
     rag_index_started_at, rag_index_completed_at, rag_index_error";

#[derive(Clone)]
pub struct DocumentRepo {
    pool: SqlitePool,
}

impl DocumentRepo {
    pub async fn new(pool: SqlitePool) -> Result<Self, ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                knowledge_base_id TEXT NOT NULL,
                folder_id TEXT,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                doc_kind TEXT NOT NULL,
                summary TEXT,
                content TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                rag_index_status TEXT NOT NULL DEFAULT 'pending',
                rag_index_task_uuid TEXT,
                rag_index_thread_id INTEGER,
                rag_index_started_at TEXT,
                rag_index_completed_at TEXT,
                rag_index_error TEXT
            )",
        )
        .execute(&pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_user_kb \
             ON documents (user_id, knowledge_base_id)",
        )
        .execute(&pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_index_status \
             ON documents (rag_index_status)",
        )
        .execute(&pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(Self { pool })
    }

    pub async fn create(
        &self,
        user_id: &str,
        kb_id: &str,
        doc: NewDocument,
    ) -> Result<Document, ApiError> {
        let doc_id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        sqlx::query(
            "INSERT INTO documents (
                id, knowledge_base_id, folder_id, user_id, name, doc_kind,
                summary, content, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&doc_id)
        .bind(kb_id)
        .bind(&doc.folder_id)
        .bind(user_id)
        .bind(&doc.name)
        .bind(doc.kind.as_str())
        .bind(&doc.summary)
        .bind(&doc.content)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        self.get(user_id, &doc_id)
            .await?
            .ok_or_else(|| ApiError::internal("document vanished after insert"))
    }

    pub async fn get(&self, user_id: &str, doc_id: &str) -> Result<Option<Document>, ApiError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ? AND user_id = ?"
        ))
        .bind(doc_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(row.map(|row| row_to_document(&row)))
    }

    /// List documents in a knowledge base. `folder_id = None` lists the
    /// whole knowledge base; `Some(id)` restricts to one folder. Folders
    /// sort before documents, then by name.
    pub async fn list_by_kb(
        &self,
        user_id: &str,
        kb_id: &str,
        skip: i64,
        limit: i64,
        folder_id: Option<&str>,
    ) -> Result<(Vec<Document>, i64), ApiError> {
        let limit = if limit > 0 { limit } else { i64::MAX };

        let (total, rows) = if let Some(folder_id) = folder_id {
            let total: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM documents \
                 WHERE knowledge_base_id = ? AND user_id = ? AND folder_id = ?",
            )
            .bind(kb_id)
            .bind(user_id)
            .bind(folder_id)
            .fetch_one(&self.pool)
            .await
            .map_err(ApiError::internal)?;

            let rows = sqlx::query(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents \
                 WHERE knowledge_base_id = ? AND user_id = ? AND folder_id = ? \
                 ORDER BY CASE doc_kind WHEN 'folder' THEN 0 ELSE 1 END, name ASC \
                 LIMIT ? OFFSET ?"
            ))
            .bind(kb_id)
            .bind(user_id)
            .bind(folder_id)
            .bind(limit)
            .bind(skip)
            .fetch_all(&self.pool)
            .await
            .map_err(ApiError::internal)?;

            (total, rows)
        } else {
            let total: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM documents \
                 WHERE knowledge_base_id = ? AND user_id = ?",
            )
            .bind(kb_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(ApiError::internal)?;

            let rows = sqlx::query(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents \
                 WHERE knowledge_base_id = ? AND user_id = ? \
                 ORDER BY CASE doc_kind WHEN 'folder' THEN 0 ELSE 1 END, name ASC \
                 LIMIT ? OFFSET ?"
            ))
            .bind(kb_id)
            .bind(user_id)
            .bind(limit)
            .bind(skip)
            .fetch_all(&self.pool)
            .await
            .map_err(ApiError::internal)?;

            (total, rows)
        };

        Ok((rows.iter().map(row_to_document).collect(), total))
    }

    pub async fn update_content(
        &self,
        user_id: &str,
        doc_id: &str,
        content: &str,
    ) -> Result<Option<Document>, ApiError> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE documents SET content = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(content)
        .bind(&now)
        .bind(doc_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(user_id, doc_id).await
    }

    pub async fn delete(&self, user_id: &str, doc_id: &str) -> Result<bool, ApiError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ? AND user_id = ?")
            .bind(doc_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically replace the row's index state.
    ///
    /// With `expected = Some(uuid)` the write only lands while the row still
    /// carries that task uuid; `None` writes unconditionally (used when a new
    /// submission supersedes whatever was there). Returns whether a row was
    /// updated - `false` means the caller lost the race or the row is gone.
    pub async fn compare_and_set_index_state(
        &self,
        user_id: &str,
        doc_id: &str,
        expected: Option<&str>,
        state: &IndexState,
    ) -> Result<bool, ApiError> {
        let result = if let Some(expected) = expected {
            sqlx::query(
                "UPDATE documents SET
                    rag_index_status = ?, rag_index_task_uuid = ?, rag_index_thread_id = ?,
                    rag_index_started_at = ?, rag_index_completed_at = ?, rag_index_error = ?
                 WHERE id = ? AND user_id = ? AND rag_index_task_uuid = ?",
            )
            .bind(state.status.as_str())
            .bind(&state.task_uuid)
            .bind(state.worker_id)
            .bind(&state.started_at)
            .bind(&state.completed_at)
            .bind(&state.error)
            .bind(doc_id)
            .bind(user_id)
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?
        } else {
            sqlx::query(
                "UPDATE documents SET
                    rag_index_status = ?, rag_index_task_uuid = ?, rag_index_thread_id = ?,
                    rag_index_started_at = ?, rag_index_completed_at = ?, rag_index_error = ?
                 WHERE id = ? AND user_id = ?",
            )
            .bind(state.status.as_str())
            .bind(&state.task_uuid)
            .bind(state.worker_id)
            .bind(&state.started_at)
            .bind(&state.completed_at)
            .bind(&state.error)
            .bind(doc_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?
        };

        Ok(result.rows_affected() == 1)
    }

    /// Stamp the worker id on the row without touching the rest of the
    /// state. Informational only; conditioned on the task uuid so a
    /// superseded worker cannot scribble on a newer task's row.
    pub async fn stamp_worker(
        &self,
        user_id: &str,
        doc_id: &str,
        task_uuid: &str,
        worker_id: i64,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE documents SET rag_index_thread_id = ? \
             WHERE id = ? AND user_id = ? AND rag_index_task_uuid = ?",
        )
        .bind(worker_id)
        .bind(doc_id)
        .bind(user_id)
        .bind(task_uuid)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(())
    }

    /// Rows still marked `indexing` whose work started before `cutoff`.
    pub async fn stale_indexing(&self, cutoff: &str) -> Result<Vec<StaleTask>, ApiError> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE rag_index_status = 'indexing' \
               AND rag_index_started_at IS NOT NULL \
               AND rag_index_started_at < ?"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(rows
            .iter()
            .map(|row| {
                let doc = row_to_document(row);
                StaleTask {
                    user_id: doc.user_id,
                    doc_id: doc.id,
                    state: doc.index_state,
                }
            })
            .collect())
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    let status: String = row.try_get("rag_index_status").unwrap_or_default();
    let kind: String = row.try_get("doc_kind").unwrap_or_default();

    Document {
        id: row.try_get("id").unwrap_or_default(),
        knowledge_base_id: row.try_get("knowledge_base_id").unwrap_or_default(),
        folder_id: row.try_get("folder_id").unwrap_or(None),
        user_id: row.try_get("user_id").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        kind: DocKind::parse(&kind),
        summary: row.try_get("summary").unwrap_or(None),
        content: row.try_get("content").unwrap_or_default(),
        created_at: row.try_get("created_at").unwrap_or_default(),
        updated_at: row.try_get("updated_at").unwrap_or_default(),
        index_state: IndexState {
            status: IndexStatus::parse(&status),
            task_uuid: row.try_get("rag_index_task_uuid").unwrap_or(None),
            worker_id: row.try_get("rag_index_thread_id").unwrap_or(None),
            started_at: row.try_get("rag_index_started_at").unwrap_or(None),
            completed_at: row.try_get("rag_index_completed_at").unwrap_or(None),
            error: row.try_get("rag_index_error").unwrap_or(None),
        },
    }
}
