//! Environment-driven runtime settings.
//!
//! Everything has a sensible default so the server boots with no
//! configuration at all; individual knobs are overridden through the
//! environment variables named next to each field.

use std::env;
use std::time::Duration;

/// Default number of concurrent indexing workers (`RAG_MAX_WORKERS`).
const DEFAULT_MAX_WORKERS: usize = 4;
/// Default indexing task timeout in seconds (`RAG_TIMEOUT_SECONDS`).
const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
/// Default depth of the pending-task queue (`RAG_QUEUE_CAPACITY`).
const DEFAULT_QUEUE_CAPACITY: usize = 64;
/// Default bounded-wait admission window in milliseconds (`RAG_ADMISSION_WAIT_MS`).
const DEFAULT_ADMISSION_WAIT_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct Settings {
    /// `RAG_MAX_WORKERS`
    pub max_workers: usize,
    /// `RAG_TIMEOUT_SECONDS`
    pub timeout: Duration,
    /// `RAG_QUEUE_CAPACITY`
    pub queue_capacity: usize,
    /// `RAG_ADMISSION_WAIT_MS`
    pub admission_wait: Duration,
    /// `RAG_ENABLED` - batch-import escape hatch; disables index submissions
    /// and chat-time retrieval when set to `0`/`false`.
    pub rag_enabled: bool,
    /// `OPENAI_BASE_URL`
    pub openai_base_url: String,
    /// `OPENAI_API_KEY`
    pub openai_api_key: String,
    /// `OPENAI_CHAT_MODEL`
    pub chat_model: String,
    /// `OPENAI_EMBED_MODEL`
    pub embed_model: String,
    /// `EMBEDDING_DIM` - fixed dimension of the embedding space.
    pub embedding_dim: usize,
    /// `PORT`
    pub port: u16,
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            max_workers: env_parse("RAG_MAX_WORKERS", DEFAULT_MAX_WORKERS).max(1),
            timeout: Duration::from_secs(env_parse(
                "RAG_TIMEOUT_SECONDS",
                DEFAULT_TIMEOUT_SECONDS,
            )),
            queue_capacity: env_parse("RAG_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY).max(1),
            admission_wait: Duration::from_millis(env_parse(
                "RAG_ADMISSION_WAIT_MS",
                DEFAULT_ADMISSION_WAIT_MS,
            )),
            rag_enabled: env_flag("RAG_ENABLED", true),
            openai_base_url: env_string("OPENAI_BASE_URL", "http://localhost:8000/v1"),
            openai_api_key: env_string("OPENAI_API_KEY", ""),
            chat_model: env_string("OPENAI_CHAT_MODEL", "default"),
            embed_model: env_string("OPENAI_EMBED_MODEL", "m3e-base"),
            embedding_dim: env_parse("EMBEDDING_DIM", 768).max(1),
            port: env_parse("PORT", 8000),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid value for {}: {:?}, using default", key, value);
            default
        }),
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => !matches!(value.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off"),
        Err(_) => default,
    }
}
