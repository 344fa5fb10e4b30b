//! SQLite persistence layer.
//!
//! Each repository owns its table schema and creates it idempotently in its
//! constructor. All repositories share one pool per database file.

pub mod chats;
pub mod documents;

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::core::errors::ApiError;

pub async fn connect(db_path: &Path) -> Result<SqlitePool, ApiError> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(ApiError::internal)
}

/// UTC timestamp with fixed microsecond precision.
///
/// The fixed width keeps lexicographic string comparison consistent with
/// chronological order, which both message ordering and the stale-task
/// sweep rely on.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
