//! Shared test doubles and fixtures.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Notify, Semaphore};
use uuid::Uuid;

use crate::core::errors::ApiError;
use crate::db;
use crate::llm::{ChatOptions, LlmClient, LlmMessage};
use crate::rag::embedder::{l2_normalize, Embedder};
use crate::rag::store::{RecordMetadata, VectorRecord};

pub fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("memoranda-test-{}.db", Uuid::new_v4()))
}

pub async fn test_pool() -> SqlitePool {
    db::connect(&temp_db_path()).await.unwrap()
}

pub fn test_record(
    user_id: &str,
    kb_id: &str,
    doc_id: &str,
    chunk_index: i64,
    embedding: Vec<f32>,
) -> VectorRecord {
    VectorRecord {
        embedding,
        content: format!("chunk {chunk_index} of {doc_id}"),
        source: format!("{doc_id}.md"),
        metadata: RecordMetadata {
            kb_id: kb_id.to_string(),
            doc_id: doc_id.to_string(),
            doc_kind: "note".to_string(),
            doc_name: format!("{doc_id}.md"),
            user_id: user_id.to_string(),
            chunk_index,
        },
        created_at: 0,
    }
}

/// Poll `condition` every 10 ms for up to 5 s.
pub async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition was not reached within 5 seconds");
}

/// Deterministic embedder. Vectors are derived from a hash of the text, so
/// identical text embeds identically and searches for a chunk's own text
/// return it at distance zero. Can be told to fail, or to block inside
/// `embed` until released - which is how the coordinator tests freeze a
/// worker at a known point.
pub struct MockEmbedder {
    dim: usize,
    fail: AtomicBool,
    blocking: AtomicBool,
    started: Notify,
    release: Semaphore,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            fail: AtomicBool::new(false),
            blocking: AtomicBool::new(false),
            started: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::SeqCst);
    }

    /// Wait until a blocked `embed` call has been entered.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Let one blocked `embed` call proceed.
    pub fn release(&self) {
        self.release.add_permits(1);
    }

    pub fn vector(text: &str, dim: usize) -> Vec<f32> {
        let mut seed: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in text.bytes() {
            seed ^= u64::from(byte);
            seed = seed.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let mut values = Vec::with_capacity(dim);
        let mut state = seed;
        for _ in 0..dim {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            values.push(((state >> 33) as f32 / u32::MAX as f32) - 0.25);
        }
        l2_normalize(values)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        if self.blocking.load(Ordering::SeqCst) {
            self.started.notify_one();
            let permit = self.release.acquire().await.map_err(ApiError::internal)?;
            permit.forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ApiError::Model("mock embedder failure".to_string()));
        }
        Ok(texts
            .iter()
            .map(|text| Self::vector(text, self.dim))
            .collect())
    }
}

/// Canned-response LLM. Optionally errors after the scripted deltas, or
/// gates every delta after the first behind a semaphore so tests can
/// control stream pacing.
pub struct MockLlm {
    deltas: Vec<String>,
    fail_at_end: bool,
    gate: Option<Arc<Semaphore>>,
}

impl MockLlm {
    pub fn with_reply(parts: &[&str]) -> Self {
        Self {
            deltas: parts.iter().map(|s| s.to_string()).collect(),
            fail_at_end: false,
            gate: None,
        }
    }

    pub fn failing_after(parts: &[&str]) -> Self {
        Self {
            deltas: parts.iter().map(|s| s.to_string()).collect(),
            fail_at_end: true,
            gate: None,
        }
    }

    pub fn gated(parts: &[&str], gate: Arc<Semaphore>) -> Self {
        Self {
            deltas: parts.iter().map(|s| s.to_string()).collect(),
            fail_at_end: false,
            gate: Some(gate),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn stream_chat(
        &self,
        _messages: Vec<LlmMessage>,
        _options: &ChatOptions,
    ) -> Result<mpsc::Receiver<Result<String, ApiError>>, ApiError> {
        let (tx, rx) = mpsc::channel(32);
        let deltas = self.deltas.clone();
        let fail_at_end = self.fail_at_end;
        let gate = self.gate.clone();

        tokio::spawn(async move {
            for (i, delta) in deltas.into_iter().enumerate() {
                if i > 0 {
                    if let Some(gate) = &gate {
                        let Ok(permit) = gate.acquire().await else {
                            return;
                        };
                        permit.forget();
                    }
                }
                if tx.send(Ok(delta)).await.is_err() {
                    return;
                }
            }
            if fail_at_end {
                let _ = tx
                    .send(Err(ApiError::Upstream("mock upstream failure".to_string())))
                    .await;
            }
        });

        Ok(rx)
    }
}
