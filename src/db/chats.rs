//! Chat sessions and messages.
//!
//! Messages cascade-delete with their session, and every append bumps the
//! session's `updated_at` inside the same transaction so list ordering
//! tracks activity.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::core::errors::ApiError;
use crate::db::now_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn parse(value: &str) -> Role {
        match value {
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Thinking,
    Content,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Thinking => "thinking",
            ContentKind::Content => "content",
        }
    }

    fn parse(value: &str) -> ContentKind {
        match value {
            "thinking" => ContentKind::Thinking,
            _ => ContentKind::Content,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub knowledge_base_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub content_type: ContentKind,
    pub rag_context: Option<String>,
    pub rag_sources: Option<Value>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub content_type: ContentKind,
    pub rag_context: Option<String>,
    pub rag_sources: Option<Value>,
}

impl NewMessage {
    pub fn user(content: String) -> Self {
        NewMessage {
            role: Role::User,
            content,
            content_type: ContentKind::Content,
            rag_context: None,
            rag_sources: None,
        }
    }

    pub fn assistant(content: String) -> Self {
        NewMessage {
            role: Role::Assistant,
            content,
            content_type: ContentKind::Content,
            rag_context: None,
            rag_sources: None,
        }
    }
}

#[derive(Clone)]
pub struct ChatRepo {
    pool: SqlitePool,
}

impl ChatRepo {
    pub async fn new(pool: SqlitePool) -> Result<Self, ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                knowledge_base_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                content_type TEXT NOT NULL DEFAULT 'content',
                rag_context TEXT,
                rag_sources TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY(session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_session \
             ON chat_messages(session_id)",
        )
        .execute(&pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(Self { pool })
    }

    pub async fn create_session(
        &self,
        user_id: &str,
        title: &str,
        knowledge_base_id: Option<&str>,
    ) -> Result<ChatSession, ApiError> {
        let session_id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        sqlx::query(
            "INSERT INTO chat_sessions (id, user_id, title, knowledge_base_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session_id)
        .bind(user_id)
        .bind(title)
        .bind(knowledge_base_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        self.get_session(user_id, &session_id)
            .await?
            .ok_or_else(|| ApiError::internal("session vanished after insert"))
    }

    pub async fn get_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<ChatSession>, ApiError> {
        let row = sqlx::query(
            "SELECT id, user_id, title, knowledge_base_id, created_at, updated_at \
             FROM chat_sessions WHERE id = ? AND user_id = ?",
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(row.map(|row| row_to_session(&row)))
    }

    pub async fn list_sessions(
        &self,
        user_id: &str,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ChatSession>, ApiError> {
        let limit = if limit > 0 { limit } else { 100 };
        let rows = sqlx::query(
            "SELECT id, user_id, title, knowledge_base_id, created_at, updated_at \
             FROM chat_sessions WHERE user_id = ? \
             ORDER BY updated_at DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(rows.iter().map(row_to_session).collect())
    }

    pub async fn update_session(
        &self,
        user_id: &str,
        session_id: &str,
        title: Option<&str>,
        knowledge_base_id: Option<&str>,
    ) -> Result<Option<ChatSession>, ApiError> {
        if title.is_none() && knowledge_base_id.is_none() {
            return self.get_session(user_id, session_id).await;
        }

        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE chat_sessions SET \
                title = COALESCE(?, title), \
                knowledge_base_id = COALESCE(?, knowledge_base_id), \
                updated_at = ? \
             WHERE id = ? AND user_id = ?",
        )
        .bind(title)
        .bind(knowledge_base_id)
        .bind(&now)
        .bind(session_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_session(user_id, session_id).await
    }

    /// Delete a session and, through the foreign key, all of its messages.
    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<bool, ApiError> {
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_messages(
        &self,
        session_id: &str,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        let limit = if limit > 0 { limit } else { i64::MAX };
        let rows = sqlx::query(
            "SELECT id, session_id, role, content, content_type, rag_context, rag_sources, created_at \
             FROM chat_messages WHERE session_id = ? \
             ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?",
        )
        .bind(session_id)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(rows.iter().map(row_to_message).collect())
    }

    /// The most recent `limit` messages, returned in chronological order.
    pub async fn recent_messages(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        let rows = sqlx::query(
            "SELECT * FROM ( \
                SELECT id, session_id, role, content, content_type, rag_context, rag_sources, created_at \
                FROM chat_messages WHERE session_id = ? ORDER BY id DESC LIMIT ? \
             ) ORDER BY id ASC",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(rows.iter().map(row_to_message).collect())
    }

    pub async fn append_message(
        &self,
        session_id: &str,
        message: NewMessage,
    ) -> Result<ChatMessage, ApiError> {
        let now = now_rfc3339();
        let sources_text = message
            .rag_sources
            .as_ref()
            .map(|value| serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string()));

        let mut tx = self.pool.begin().await.map_err(ApiError::internal)?;

        sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

        let result = sqlx::query(
            "INSERT INTO chat_messages \
                (session_id, role, content, content_type, rag_context, rag_sources, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.content_type.as_str())
        .bind(&message.rag_context)
        .bind(&sources_text)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;

        tx.commit().await.map_err(ApiError::internal)?;

        Ok(ChatMessage {
            id: result.last_insert_rowid(),
            session_id: session_id.to_string(),
            role: message.role,
            content: message.content,
            content_type: message.content_type,
            rag_context: message.rag_context,
            rag_sources: message.rag_sources,
            created_at: now,
        })
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> ChatSession {
    ChatSession {
        id: row.try_get("id").unwrap_or_default(),
        user_id: row.try_get("user_id").unwrap_or_default(),
        title: row.try_get("title").unwrap_or_default(),
        knowledge_base_id: row.try_get("knowledge_base_id").unwrap_or(None),
        created_at: row.try_get("created_at").unwrap_or_default(),
        updated_at: row.try_get("updated_at").unwrap_or_default(),
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> ChatMessage {
    let role: String = row.try_get("role").unwrap_or_default();
    let content_type: String = row.try_get("content_type").unwrap_or_default();
    let sources_text: Option<String> = row.try_get("rag_sources").unwrap_or(None);

    ChatMessage {
        id: row.try_get("id").unwrap_or_default(),
        session_id: row.try_get("session_id").unwrap_or_default(),
        role: Role::parse(&role),
        content: row.try_get("content").unwrap_or_default(),
        content_type: ContentKind::parse(&content_type),
        rag_context: row.try_get("rag_context").unwrap_or(None),
        rag_sources: sources_text.and_then(|text| serde_json::from_str(&text).ok()),
        created_at: row.try_get("created_at").unwrap_or_default(),
    }
}
