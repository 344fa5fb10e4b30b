//! Asynchronous index coordinator.
//!
//! Document-change events are turned into tasks on a bounded worker pool.
//! Each submission installs a fresh task uuid on the document row with an
//! unconditional compare-and-set, which logically cancels any in-flight
//! task for the same document: workers re-check the row's uuid before and
//! after the heavy work and publish nothing once superseded. Failures are
//! recorded on the row and never retried here; a timeout sweep bounds how
//! long a stuck task can stay visible as `indexing`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::errors::ApiError;
use crate::db::documents::{Document, DocumentRepo, IndexState};
use crate::rag::chunker::ChunkParams;
use crate::rag::indexer::RagIndexer;
use crate::rag::store::{VectorFilter, VectorStore};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_workers: usize,
    pub timeout: Duration,
    pub queue_capacity: usize,
    pub admission_wait: Duration,
    pub enabled: bool,
}

impl CoordinatorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        CoordinatorConfig {
            max_workers: settings.max_workers,
            timeout: settings.timeout,
            queue_capacity: settings.queue_capacity,
            admission_wait: settings.admission_wait,
            enabled: settings.rag_enabled,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            max_workers: 4,
            timeout: Duration::from_secs(300),
            queue_capacity: 64,
            admission_wait: Duration::from_millis(200),
            enabled: true,
        }
    }
}

struct IndexTask {
    task_uuid: String,
    user_id: String,
    doc_id: String,
    params: Option<ChunkParams>,
}

pub struct IndexCoordinator {
    documents: DocumentRepo,
    vectors: Arc<dyn VectorStore>,
    tx: mpsc::Sender<IndexTask>,
    active: Arc<AtomicUsize>,
    enabled: AtomicBool,
    timeout: Duration,
    admission_wait: Duration,
}

impl IndexCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        documents: DocumentRepo,
        vectors: Arc<dyn VectorStore>,
        indexer: Arc<RagIndexer>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<IndexTask>(config.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let active = Arc::new(AtomicUsize::new(0));

        for worker_id in 0..config.max_workers.max(1) {
            let worker = Worker {
                id: worker_id as i64,
                documents: documents.clone(),
                vectors: vectors.clone(),
                indexer: indexer.clone(),
            };
            let rx = rx.clone();
            let active = active.clone();
            tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    let Some(task) = task else { break };
                    worker.run(task).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }

        Self {
            documents,
            vectors,
            tx,
            active,
            enabled: AtomicBool::new(config.enabled),
            timeout: config.timeout,
            admission_wait: config.admission_wait,
        }
    }

    pub async fn on_document_created(
        &self,
        user_id: &str,
        document: &Document,
    ) -> Result<(), ApiError> {
        self.submit(user_id, document, None).await
    }

    pub async fn on_document_updated(
        &self,
        user_id: &str,
        document: &Document,
    ) -> Result<(), ApiError> {
        self.submit(user_id, document, None).await
    }

    /// Remove a deleted document's vectors. Runs synchronously and outside
    /// the worker pool; a worker that loses its final uuid check against the
    /// now-missing row re-issues this delete, so late inserts cannot leave
    /// orphans (see [`Worker::finish`]).
    pub async fn on_document_deleted(&self, user_id: &str, doc_id: &str) -> Result<u64, ApiError> {
        self.vectors
            .delete(&VectorFilter::doc(user_id, doc_id))
            .await
    }

    /// Submit an indexing task, optionally overriding the chunking window.
    ///
    /// Installing the fresh uuid before enqueueing is what supersedes any
    /// older task; the enqueue itself can then fail without leaving a
    /// phantom `indexing` row (the row is flipped to `failed` on admission
    /// timeout).
    pub async fn submit(
        &self,
        user_id: &str,
        document: &Document,
        params: Option<ChunkParams>,
    ) -> Result<(), ApiError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !document.kind.indexable() {
            return Ok(());
        }

        let task_uuid = Uuid::new_v4().to_string();
        let installed = self
            .documents
            .compare_and_set_index_state(
                user_id,
                &document.id,
                None,
                &IndexState::indexing(&task_uuid),
            )
            .await?;
        if !installed {
            // Row gone between the caller's read and now.
            return Ok(());
        }

        let task = IndexTask {
            task_uuid: task_uuid.clone(),
            user_id: user_id.to_string(),
            doc_id: document.id.clone(),
            params,
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        let enqueue = match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => {
                match tokio::time::timeout(self.admission_wait, self.tx.send(task)).await {
                    Ok(Ok(())) => Ok(()),
                    _ => Err(ApiError::Backpressure),
                }
            }
            Err(TrySendError::Closed(_)) => {
                Err(ApiError::internal("indexing worker pool is gone"))
            }
        };

        if let Err(err) = enqueue {
            self.active.fetch_sub(1, Ordering::SeqCst);
            let failed = IndexState::indexing(&task_uuid).failed(&err.to_string());
            let _ = self
                .documents
                .compare_and_set_index_state(user_id, &document.id, Some(&task_uuid), &failed)
                .await;
            return Err(err);
        }

        Ok(())
    }

    /// Flip `indexing` rows older than the timeout budget to `timeout`.
    /// Conditioned on each row's current uuid, so a row that was
    /// resubmitted in the meantime is left alone. Returns how many rows
    /// were transitioned.
    pub async fn check_timeout_tasks(&self) -> Result<usize, ApiError> {
        let cutoff = (Utc::now()
            - chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::zero()))
        .to_rfc3339_opts(SecondsFormat::Micros, true);

        let stale = self.documents.stale_indexing(&cutoff).await?;
        let mut swept = 0;
        for task in &stale {
            let Some(task_uuid) = task.state.task_uuid.as_deref() else {
                continue;
            };
            let timed_out = task.state.timed_out();
            if self
                .documents
                .compare_and_set_index_state(&task.user_id, &task.doc_id, Some(task_uuid), &timed_out)
                .await?
            {
                tracing::warn!(
                    "Indexing task {} for document {} timed out",
                    task_uuid,
                    task.doc_id
                );
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Tasks submitted but not yet finished (queued or running).
    pub fn active_task_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        tracing::info!("Index coordinator enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        tracing::info!("Index coordinator disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

struct Worker {
    id: i64,
    documents: DocumentRepo,
    vectors: Arc<dyn VectorStore>,
    indexer: Arc<RagIndexer>,
}

impl Worker {
    async fn run(&self, task: IndexTask) {
        // Re-read so the task indexes the content that is current now, and
        // exit quietly if a newer submission already took over the row.
        let doc = match self.documents.get(&task.user_id, &task.doc_id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!("Failed to load document {}: {}", task.doc_id, err);
                return;
            }
        };
        if doc.index_state.task_uuid.as_deref() != Some(task.task_uuid.as_str()) {
            tracing::debug!("Task {} superseded before start", task.task_uuid);
            return;
        }

        let _ = self
            .documents
            .stamp_worker(&task.user_id, &task.doc_id, &task.task_uuid, self.id)
            .await;

        let outcome = self.indexer.reindex(&task.user_id, &doc, task.params).await;
        self.finish(&task, &doc, outcome).await;
    }

    /// Publish the terminal state, but only while this task still owns the
    /// row. Losing the uuid check means a newer task has taken over and
    /// will converge the index itself; losing it because the row vanished
    /// means the document was deleted mid-run, and any vectors this worker
    /// inserted after the deletion must be cleared again.
    async fn finish(&self, task: &IndexTask, doc: &Document, outcome: Result<usize, ApiError>) {
        let current = match self.documents.get(&task.user_id, &task.doc_id).await {
            Ok(current) => current,
            Err(err) => {
                tracing::warn!("Failed to re-read document {}: {}", task.doc_id, err);
                return;
            }
        };
        let Some(current) = current else {
            let _ = self
                .vectors
                .delete(&VectorFilter::doc(&task.user_id, &task.doc_id))
                .await;
            return;
        };
        if current.index_state.task_uuid.as_deref() != Some(task.task_uuid.as_str()) {
            tracing::debug!("Task {} superseded during execution", task.task_uuid);
            return;
        }

        let state = match &outcome {
            Ok(chunks) => {
                tracing::info!(
                    "Indexed document {} ({}): {} chunks",
                    doc.id,
                    doc.name,
                    chunks
                );
                current.index_state.completed()
            }
            Err(err) => {
                tracing::error!("Failed to index document {}: {}", doc.id, err);
                current.index_state.failed(&err.to_string())
            }
        };

        let wrote = self
            .documents
            .compare_and_set_index_state(&task.user_id, &task.doc_id, Some(&task.task_uuid), &state)
            .await
            .unwrap_or(false);
        if !wrote {
            // Raced between the re-read and the write.
            if let Ok(None) = self.documents.get(&task.user_id, &task.doc_id).await {
                let _ = self
                    .vectors
                    .delete(&VectorFilter::doc(&task.user_id, &task.doc_id))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::documents::{IndexStatus, NewDocument};
    use crate::rag::sqlite::SqliteVectorStore;
    use crate::test_support::{temp_db_path, test_pool, wait_for, MockEmbedder};

    struct Fixture {
        coordinator: IndexCoordinator,
        documents: DocumentRepo,
        vectors: Arc<SqliteVectorStore>,
        embedder: Arc<MockEmbedder>,
    }

    async fn fixture(config: CoordinatorConfig) -> Fixture {
        let documents = DocumentRepo::new(test_pool().await).await.unwrap();
        let vectors = Arc::new(SqliteVectorStore::with_path(&temp_db_path()).await.unwrap());
        vectors.ensure_collection(8).await.unwrap();
        let embedder = Arc::new(MockEmbedder::new(8));
        let indexer = Arc::new(RagIndexer::new(
            embedder.clone(),
            vectors.clone(),
            ChunkParams::default(),
        ));
        let coordinator =
            IndexCoordinator::new(config, documents.clone(), vectors.clone(), indexer);
        Fixture {
            coordinator,
            documents,
            vectors,
            embedder,
        }
    }

    async fn wait_quiesced(fx: &Fixture) {
        wait_for(|| async { fx.coordinator.active_task_count() == 0 }).await;
    }

    #[tokio::test]
    async fn single_submission_converges_to_completed() {
        let fx = fixture(CoordinatorConfig::default()).await;
        let doc = fx
            .documents
            .create("u1", "kb1", NewDocument::note("a", "document body"))
            .await
            .unwrap();

        fx.coordinator
            .on_document_created("u1", &doc)
            .await
            .unwrap();
        wait_quiesced(&fx).await;

        let row = fx.documents.get("u1", &doc.id).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Completed);
        assert!(row.index_state.completed_at.is_some());
        assert!(row.index_state.worker_id.is_some());

        let hits = fx
            .vectors
            .search(
                &MockEmbedder::vector("document body", 8),
                5,
                &VectorFilter::doc("u1", &doc.id),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn rapid_double_edit_keeps_only_latest_content() {
        let fx = fixture(CoordinatorConfig {
            max_workers: 1,
            ..CoordinatorConfig::default()
        })
        .await;
        let doc = fx
            .documents
            .create("u1", "kb1", NewDocument::note("a", "first version"))
            .await
            .unwrap();

        // First submission blocks inside embed after its delete ran.
        fx.embedder.set_blocking(true);
        fx.coordinator
            .on_document_created("u1", &doc)
            .await
            .unwrap();
        fx.embedder.wait_started().await;

        // Edit while the first task is mid-flight; the second submission
        // installs a new uuid and supersedes it.
        let updated = fx
            .documents
            .update_content("u1", &doc.id, "second version")
            .await
            .unwrap()
            .unwrap();
        fx.coordinator
            .on_document_updated("u1", &updated)
            .await
            .unwrap();
        let installed_uuid = fx
            .documents
            .get("u1", &doc.id)
            .await
            .unwrap()
            .unwrap()
            .index_state
            .task_uuid;

        fx.embedder.set_blocking(false);
        fx.embedder.release();
        wait_quiesced(&fx).await;

        let row = fx.documents.get("u1", &doc.id).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Completed);
        assert_eq!(row.index_state.task_uuid, installed_uuid);

        // Only the second edit's chunks remain.
        let hits = fx
            .vectors
            .search(&[0.0; 8], 100, &VectorFilter::doc("u1", &doc.id))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "second version");
    }

    #[tokio::test]
    async fn failing_embedder_records_failed_then_recovers() {
        let fx = fixture(CoordinatorConfig::default()).await;
        let doc = fx
            .documents
            .create("u1", "kb1", NewDocument::note("a", "body"))
            .await
            .unwrap();

        fx.embedder.set_fail(true);
        fx.coordinator
            .on_document_created("u1", &doc)
            .await
            .unwrap();
        wait_quiesced(&fx).await;

        let row = fx.documents.get("u1", &doc.id).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Failed);
        assert!(row
            .index_state
            .error
            .as_deref()
            .unwrap()
            .contains("mock embedder failure"));
        // The leading delete ran, so nothing is stored for the doc.
        let hits = fx
            .vectors
            .search(&[0.0; 8], 100, &VectorFilter::doc("u1", &doc.id))
            .await
            .unwrap();
        assert!(hits.is_empty());

        // Failures are not retried; an explicit resubmission converges.
        fx.embedder.set_fail(false);
        fx.coordinator
            .on_document_updated("u1", &doc)
            .await
            .unwrap();
        wait_quiesced(&fx).await;

        let row = fx.documents.get("u1", &doc.id).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Completed);
        let hits = fx
            .vectors
            .search(&[0.0; 8], 100, &VectorFilter::doc("u1", &doc.id))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn timeout_sweep_flips_stale_rows_and_tolerates_late_finish() {
        let fx = fixture(CoordinatorConfig {
            timeout: Duration::from_secs(300),
            ..CoordinatorConfig::default()
        })
        .await;
        let doc = fx
            .documents
            .create("u1", "kb1", NewDocument::note("a", "body"))
            .await
            .unwrap();

        // A frozen worker: indexing since long before the budget.
        let mut stuck = IndexState::indexing("uuid-stuck");
        stuck.started_at = Some("2000-01-01T00:00:00.000000Z".to_string());
        fx.documents
            .compare_and_set_index_state("u1", &doc.id, None, &stuck)
            .await
            .unwrap();

        let swept = fx.coordinator.check_timeout_tasks().await.unwrap();
        assert_eq!(swept, 1);

        let row = fx.documents.get("u1", &doc.id).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Timeout);
        assert!(row.index_state.completed_at.is_some());
        assert_eq!(
            row.index_state.error.as_deref(),
            Some("Task exceeded timeout limit")
        );

        // Second sweep finds nothing: the row is no longer `indexing`.
        assert_eq!(fx.coordinator.check_timeout_tasks().await.unwrap(), 0);

        // If the frozen worker wakes up later, its conditional write still
        // matches the unchanged uuid - last write wins and the row must not
        // end up back at `indexing`.
        let finished = row.index_state.completed();
        assert!(fx
            .documents
            .compare_and_set_index_state("u1", &doc.id, Some("uuid-stuck"), &finished)
            .await
            .unwrap());
        let row = fx.documents.get("u1", &doc.id).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Completed);
    }

    #[tokio::test]
    async fn delete_during_indexing_leaves_no_orphaned_vectors() {
        let fx = fixture(CoordinatorConfig {
            max_workers: 1,
            ..CoordinatorConfig::default()
        })
        .await;
        let doc = fx
            .documents
            .create("u1", "kb1", NewDocument::note("a", "to be deleted"))
            .await
            .unwrap();

        fx.embedder.set_blocking(true);
        fx.coordinator
            .on_document_created("u1", &doc)
            .await
            .unwrap();
        fx.embedder.wait_started().await;

        // Outer CRUD deletes the document while the worker is mid-embed;
        // its vectors are removed, but the worker will still insert after
        // this point.
        fx.documents.delete("u1", &doc.id).await.unwrap();
        fx.coordinator
            .on_document_deleted("u1", &doc.id)
            .await
            .unwrap();

        fx.embedder.set_blocking(false);
        fx.embedder.release();
        wait_quiesced(&fx).await;

        // The worker noticed the missing row and re-issued the delete.
        let hits = fx
            .vectors
            .search(&[0.0; 8], 100, &VectorFilter::doc("u1", &doc.id))
            .await
            .unwrap();
        assert!(hits.is_empty(), "late-arriving vectors must be cleared");
    }

    #[tokio::test]
    async fn disabled_coordinator_ignores_submissions() {
        let fx = fixture(CoordinatorConfig {
            enabled: false,
            ..CoordinatorConfig::default()
        })
        .await;
        let doc = fx
            .documents
            .create("u1", "kb1", NewDocument::note("a", "body"))
            .await
            .unwrap();

        fx.coordinator
            .on_document_created("u1", &doc)
            .await
            .unwrap();
        assert_eq!(fx.coordinator.active_task_count(), 0);
        let row = fx.documents.get("u1", &doc.id).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Pending);

        fx.coordinator.enable();
        fx.coordinator
            .on_document_created("u1", &doc)
            .await
            .unwrap();
        wait_quiesced(&fx).await;
        let row = fx.documents.get("u1", &doc.id).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Completed);
    }

    #[tokio::test]
    async fn folders_are_never_submitted() {
        let fx = fixture(CoordinatorConfig::default()).await;
        let folder = fx
            .documents
            .create(
                "u1",
                "kb1",
                NewDocument {
                    name: "folder".to_string(),
                    kind: crate::db::documents::DocKind::Folder,
                    content: String::new(),
                    folder_id: None,
                    summary: None,
                },
            )
            .await
            .unwrap();

        fx.coordinator
            .on_document_created("u1", &folder)
            .await
            .unwrap();
        assert_eq!(fx.coordinator.active_task_count(), 0);
        let row = fx.documents.get("u1", &folder.id).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Pending);
    }

    #[tokio::test]
    async fn full_queue_fails_submission_with_backpressure() {
        let fx = fixture(CoordinatorConfig {
            max_workers: 1,
            queue_capacity: 1,
            admission_wait: Duration::from_millis(5),
            ..CoordinatorConfig::default()
        })
        .await;

        let mut docs = Vec::new();
        for i in 0..3 {
            docs.push(
                fx.documents
                    .create("u1", "kb1", NewDocument::note(&format!("d{i}"), "body"))
                    .await
                    .unwrap(),
            );
        }

        fx.embedder.set_blocking(true);
        // First task occupies the worker, second fills the queue.
        fx.coordinator
            .on_document_created("u1", &docs[0])
            .await
            .unwrap();
        fx.embedder.wait_started().await;
        fx.coordinator
            .on_document_created("u1", &docs[1])
            .await
            .unwrap();

        let err = fx
            .coordinator
            .on_document_created("u1", &docs[2])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "backpressure");

        // The rejected submission surfaces as a terminal state, not a
        // phantom `indexing` row.
        let row = fx.documents.get("u1", &docs[2].id).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Failed);

        fx.embedder.set_blocking(false);
        fx.embedder.release();
        fx.embedder.release();
        wait_quiesced(&fx).await;

        for doc in &docs[..2] {
            let row = fx.documents.get("u1", &doc.id).await.unwrap().unwrap();
            assert_eq!(row.index_state.status, IndexStatus::Completed);
        }
    }

    #[tokio::test]
    async fn deleted_document_vectors_are_removed_synchronously() {
        let fx = fixture(CoordinatorConfig::default()).await;
        let doc = fx
            .documents
            .create("u1", "kb1", NewDocument::note("a", "content"))
            .await
            .unwrap();

        fx.coordinator
            .on_document_created("u1", &doc)
            .await
            .unwrap();
        wait_quiesced(&fx).await;

        fx.documents.delete("u1", &doc.id).await.unwrap();
        let deleted = fx
            .coordinator
            .on_document_deleted("u1", &doc.id)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let hits = fx
            .vectors
            .search(&[0.0; 8], 100, &VectorFilter::doc("u1", &doc.id))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
