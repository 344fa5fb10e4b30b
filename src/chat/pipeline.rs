//! Streaming chat orchestration.
//!
//! A turn validates the session, persists the user message, optionally
//! retrieves knowledge-base context, then streams LLM deltas interleaved
//! with retrieval progress events. The assistant reply is persisted after
//! the stream drains; a client disconnect is observed as a failed channel
//! send, at which point the turn stops consuming the LLM and persists
//! nothing further.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::core::errors::ApiError;
use crate::chat::events::StreamEvent;
use crate::db::chats::{ChatRepo, ChatSession, NewMessage};
use crate::llm::{ChatOptions, LlmClient, LlmMessage};
use crate::rag::embedder::Embedder;
use crate::rag::store::{VectorFilter, VectorStore};

/// How many trailing messages of the session feed the prompt.
const HISTORY_LIMIT: i64 = 20;
/// How many chunks retrieval contributes to the context block.
const TOP_K: usize = 5;

const RAG_SYSTEM_PROMPT: &str = "You are a knowledgeable assistant. Answer the user's question \
using only the reference material below. If the material does not contain the answer, say so \
plainly instead of guessing.\n\nReference material:\n\n";

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer the user's questions in a friendly, accurate way.";

#[derive(Debug, Clone, Serialize)]
struct RagSource {
    doc_name: String,
    doc_id: String,
    score: f32,
}

struct Retrieved {
    context: Option<String>,
    sources: Vec<RagSource>,
}

#[derive(Clone)]
pub struct ChatPipeline {
    chats: ChatRepo,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    options: ChatOptions,
    rag_enabled: bool,
}

impl ChatPipeline {
    pub fn new(
        chats: ChatRepo,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmClient>,
        options: ChatOptions,
        rag_enabled: bool,
    ) -> Self {
        Self {
            chats,
            embedder,
            vectors,
            llm,
            options,
            rag_enabled,
        }
    }

    /// Start a chat turn. Fails fast before any streaming on an unknown or
    /// foreign session; the user message is persisted before this returns,
    /// which pins message order to request order.
    pub async fn send(
        &self,
        user_id: &str,
        session_id: &str,
        user_text: String,
    ) -> Result<mpsc::Receiver<StreamEvent>, ApiError> {
        let session = self
            .chats
            .get_session(user_id, session_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("chat session not found".to_string()))?;

        self.chats
            .append_message(session_id, NewMessage::user(user_text.clone()))
            .await?;

        let (tx, rx) = mpsc::channel(32);
        let pipeline = self.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            pipeline.run(tx, user_id, session, user_text).await;
        });

        Ok(rx)
    }

    async fn run(
        &self,
        tx: mpsc::Sender<StreamEvent>,
        user_id: String,
        session: ChatSession,
        user_text: String,
    ) {
        let history = match self.chats.recent_messages(&session.id, HISTORY_LIMIT).await {
            Ok(history) => history,
            Err(err) => {
                let _ = tx
                    .send(StreamEvent::error(format!("failed to load history: {err}")))
                    .await;
                let _ = tx.send(StreamEvent::Done).await;
                return;
            }
        };

        let mut retrieved = None;
        if let Some(kb_id) = session
            .knowledge_base_id
            .as_deref()
            .filter(|_| self.rag_enabled)
        {
            match self.retrieve(&tx, &user_id, kb_id, &user_text).await {
                Ok(Some(result)) => retrieved = Some(result),
                // Client went away mid-retrieval.
                Ok(None) => return,
                Err((step, err)) => {
                    let message = err.to_string();
                    if tx
                        .send(StreamEvent::rag_step(
                            &format!("{step}_error"),
                            json!({"error": message}),
                        ))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    // The turn degrades: the error text becomes the
                    // assistant reply so the exchange stays well-formed.
                    if let Err(persist_err) = self
                        .chats
                        .append_message(&session.id, NewMessage::assistant(message.clone()))
                        .await
                    {
                        tracing::warn!("Failed to persist error marker: {}", persist_err);
                    }
                    let _ = tx.send(StreamEvent::error(message)).await;
                    let _ = tx.send(StreamEvent::Done).await;
                    return;
                }
            }
        }

        let context = retrieved.as_ref().and_then(|r| r.context.clone());
        let mut messages = Vec::with_capacity(history.len() + 1);
        match &context {
            Some(context) => {
                messages.push(LlmMessage::system(format!("{RAG_SYSTEM_PROMPT}{context}")))
            }
            None => messages.push(LlmMessage::system(DEFAULT_SYSTEM_PROMPT)),
        }
        // `history` already ends with the just-persisted user turn.
        for msg in &history {
            messages.push(LlmMessage {
                role: msg.role.as_str().to_string(),
                content: msg.content.clone(),
            });
        }

        let mut stream = match self.llm.stream_chat(messages, &self.options).await {
            Ok(stream) => stream,
            Err(err) => {
                let _ = tx
                    .send(StreamEvent::error(format!("failed to start generation: {err}")))
                    .await;
                return;
            }
        };

        let mut full_reply = String::new();
        let mut upstream_error = None;
        while let Some(item) = stream.recv().await {
            match item {
                Ok(delta) => {
                    full_reply.push_str(&delta);
                    if tx.send(StreamEvent::message(delta)).await.is_err() {
                        // Disconnect: stop consuming, store no partial reply.
                        return;
                    }
                }
                Err(err) => {
                    upstream_error = Some(err);
                    break;
                }
            }
        }

        // On a mid-stream upstream failure the partial reply is still the
        // assistant turn; the client sees where it was cut off.
        let mut message = NewMessage::assistant(full_reply);
        message.rag_context = context;
        message.rag_sources = retrieved
            .map(|r| serde_json::to_value(r.sources).unwrap_or_else(|_| json!([])));
        if let Err(err) = self.chats.append_message(&session.id, message).await {
            tracing::warn!("Failed to persist assistant message: {}", err);
            let _ = tx
                .send(StreamEvent::error(format!("failed to persist reply: {err}")))
                .await;
            return;
        }

        if let Some(err) = upstream_error {
            let _ = tx
                .send(StreamEvent::error(format!("generation failed: {err}")))
                .await;
            return;
        }
        let _ = tx.send(StreamEvent::Done).await;
    }

    /// Run the retrieval steps, narrating progress. `Ok(None)` means the
    /// client disconnected; errors carry the failing step name.
    async fn retrieve(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        user_id: &str,
        kb_id: &str,
        user_text: &str,
    ) -> Result<Option<Retrieved>, (&'static str, ApiError)> {
        if tx
            .send(StreamEvent::rag_step("search_start", json!({"kb_id": kb_id})))
            .await
            .is_err()
        {
            return Ok(None);
        }

        let query = [user_text.to_string()];
        let mut embeddings = self
            .embedder
            .embed(&query)
            .await
            .map_err(|err| ("search", err))?;
        let query_vec = match embeddings.pop() {
            Some(vec) => vec,
            None => {
                return Err((
                    "search",
                    ApiError::Model("empty embedding response".to_string()),
                ))
            }
        };

        let hits = self
            .vectors
            .search(&query_vec, TOP_K, &VectorFilter::kb(user_id, kb_id))
            .await
            .map_err(|err| ("search", err))?;

        if tx
            .send(StreamEvent::rag_step(
                "search_complete",
                json!({"count": hits.len()}),
            ))
            .await
            .is_err()
        {
            return Ok(None);
        }
        if tx
            .send(StreamEvent::rag_step("context_build", json!({})))
            .await
            .is_err()
        {
            return Ok(None);
        }

        let sources: Vec<RagSource> = hits
            .iter()
            .map(|hit| RagSource {
                doc_name: hit.metadata.doc_name.clone(),
                doc_id: hit.metadata.doc_id.clone(),
                score: hit.score,
            })
            .collect();
        let context = if hits.is_empty() {
            None
        } else {
            Some(
                hits.iter()
                    .map(|hit| format!("[{}]\n{}", hit.metadata.doc_name, hit.content))
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            )
        };

        if tx
            .send(StreamEvent::rag_step(
                "context_complete",
                json!({"sources": sources.len()}),
            ))
            .await
            .is_err()
        {
            return Ok(None);
        }
        if tx
            .send(StreamEvent::rag_step("generate_start", json!({})))
            .await
            .is_err()
        {
            return Ok(None);
        }

        Ok(Some(Retrieved { context, sources }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::chats::Role;
    use serde_json::json;
    use crate::rag::sqlite::SqliteVectorStore;
    use crate::rag::store::{RecordMetadata, VectorRecord};
    use crate::test_support::{temp_db_path, test_pool, MockEmbedder, MockLlm};
    use tokio::sync::Semaphore;

    struct Fixture {
        pipeline: ChatPipeline,
        chats: ChatRepo,
        vectors: Arc<SqliteVectorStore>,
    }

    async fn fixture(llm: MockLlm, rag_enabled: bool) -> Fixture {
        let chats = ChatRepo::new(test_pool().await).await.unwrap();
        let vectors = Arc::new(SqliteVectorStore::with_path(&temp_db_path()).await.unwrap());
        vectors.ensure_collection(8).await.unwrap();
        let embedder = Arc::new(MockEmbedder::new(8));
        let pipeline = ChatPipeline::new(
            chats.clone(),
            embedder,
            vectors.clone(),
            Arc::new(llm),
            ChatOptions::default(),
            rag_enabled,
        );
        Fixture {
            pipeline,
            chats,
            vectors,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn step_names(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::RagStep { step, .. } => Some(step.clone()),
                _ => None,
            })
            .collect()
    }

    async fn seed_chunk(fx: &Fixture, user_id: &str, kb_id: &str, doc_name: &str, content: &str) {
        fx.vectors
            .insert(vec![VectorRecord {
                embedding: MockEmbedder::vector(content, 8),
                content: content.to_string(),
                source: doc_name.to_string(),
                metadata: RecordMetadata {
                    kb_id: kb_id.to_string(),
                    doc_id: "d1".to_string(),
                    doc_kind: "note".to_string(),
                    doc_name: doc_name.to_string(),
                    user_id: user_id.to_string(),
                    chunk_index: 0,
                },
                created_at: 0,
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn plain_chat_streams_messages_then_done() {
        let fx = fixture(MockLlm::with_reply(&["Hello ", "there!"]), true).await;
        let session = fx.chats.create_session("u1", "chat", None).await.unwrap();

        let rx = fx
            .pipeline
            .send("u1", &session.id, "hello".to_string())
            .await
            .unwrap();
        let events = collect(rx).await;

        assert!(step_names(&events).is_empty(), "no retrieval for plain chat");
        assert!(matches!(events[0], StreamEvent::Message { .. }));
        assert!(matches!(events.last(), Some(StreamEvent::Done)));

        let messages = fx.chats.list_messages(&session.id, 0, 0).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hello there!");
        assert!(messages[1].rag_sources.is_none());
    }

    #[tokio::test]
    async fn rag_chat_with_empty_kb_narrates_zero_hits() {
        let fx = fixture(MockLlm::with_reply(&["pong"]), true).await;
        let session = fx
            .chats
            .create_session("u1", "chat", Some("kb-empty"))
            .await
            .unwrap();

        let rx = fx
            .pipeline
            .send("u1", &session.id, "ping".to_string())
            .await
            .unwrap();
        let events = collect(rx).await;

        assert_eq!(
            step_names(&events),
            vec![
                "search_start",
                "search_complete",
                "context_build",
                "context_complete",
                "generate_start"
            ]
        );
        // search_start carries the kb id; counts are zero.
        let StreamEvent::RagStep { data, .. } = &events[0] else {
            panic!("expected rag_step");
        };
        assert_eq!(data["kb_id"], "kb-empty");
        let StreamEvent::RagStep { data, .. } = &events[1] else {
            panic!("expected rag_step");
        };
        assert_eq!(data["count"], 0);
        assert!(matches!(events.last(), Some(StreamEvent::Done)));

        let messages = fx.chats.list_messages(&session.id, 0, 0).await.unwrap();
        assert_eq!(messages[1].rag_sources, Some(json!([])));
        assert!(messages[1].rag_context.is_none());
    }

    #[tokio::test]
    async fn rag_chat_builds_context_from_hits() {
        let fx = fixture(MockLlm::with_reply(&["answer"]), true).await;
        seed_chunk(&fx, "u1", "kb1", "notes.md", "Rust has fearless concurrency").await;
        let session = fx
            .chats
            .create_session("u1", "chat", Some("kb1"))
            .await
            .unwrap();

        let rx = fx
            .pipeline
            .send("u1", &session.id, "what about concurrency?".to_string())
            .await
            .unwrap();
        let events = collect(rx).await;
        assert!(matches!(events.last(), Some(StreamEvent::Done)));

        let messages = fx.chats.list_messages(&session.id, 0, 0).await.unwrap();
        let assistant = &messages[1];
        let context = assistant.rag_context.as_deref().unwrap();
        assert!(context.contains("[notes.md]"));
        assert!(context.contains("Rust has fearless concurrency"));

        let sources = assistant.rag_sources.as_ref().unwrap();
        assert_eq!(sources[0]["doc_name"], "notes.md");
        assert_eq!(sources[0]["doc_id"], "d1");
        assert!(sources[0]["score"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn rag_disabled_skips_retrieval_even_with_kb() {
        let fx = fixture(MockLlm::with_reply(&["ok"]), false).await;
        seed_chunk(&fx, "u1", "kb1", "notes.md", "content").await;
        let session = fx
            .chats
            .create_session("u1", "chat", Some("kb1"))
            .await
            .unwrap();

        let rx = fx
            .pipeline
            .send("u1", &session.id, "hi".to_string())
            .await
            .unwrap();
        let events = collect(rx).await;
        assert!(step_names(&events).is_empty());

        let messages = fx.chats.list_messages(&session.id, 0, 0).await.unwrap();
        assert!(messages[1].rag_sources.is_none());
    }

    #[tokio::test]
    async fn unknown_session_fails_before_persisting() {
        let fx = fixture(MockLlm::with_reply(&["x"]), true).await;
        let session = fx.chats.create_session("u1", "chat", None).await.unwrap();

        let err = fx
            .pipeline
            .send("u2", &session.id, "hello".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let messages = fx.chats.list_messages(&session.id, 0, 0).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn retrieval_failure_degrades_turn_with_error_marker() {
        let chats = ChatRepo::new(test_pool().await).await.unwrap();
        let vectors: Arc<SqliteVectorStore> =
            Arc::new(SqliteVectorStore::with_path(&temp_db_path()).await.unwrap());
        vectors.ensure_collection(8).await.unwrap();
        let embedder = Arc::new(MockEmbedder::new(8));
        embedder.set_fail(true);
        let pipeline = ChatPipeline::new(
            chats.clone(),
            embedder,
            vectors,
            Arc::new(MockLlm::with_reply(&["never reached"])),
            ChatOptions::default(),
            true,
        );
        let session = chats.create_session("u1", "chat", Some("kb1")).await.unwrap();

        let rx = pipeline
            .send("u1", &session.id, "hello".to_string())
            .await
            .unwrap();
        let events = collect(rx).await;

        assert_eq!(step_names(&events), vec!["search_start", "search_error"]);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Error { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Done)));

        // User turn stays; the error marker is the assistant turn.
        let messages = chats.list_messages(&session.id, 0, 0).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages[1].content.contains("mock embedder failure"));
    }

    #[tokio::test]
    async fn upstream_failure_keeps_partial_reply() {
        let fx = fixture(MockLlm::failing_after(&["partial "]), true).await;
        let session = fx.chats.create_session("u1", "chat", None).await.unwrap();

        let rx = fx
            .pipeline
            .send("u1", &session.id, "hello".to_string())
            .await
            .unwrap();
        let events = collect(rx).await;

        assert!(matches!(events[0], StreamEvent::Message { .. }));
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Done)));

        let messages = fx.chats.list_messages(&session.id, 0, 0).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "partial ");
    }

    #[tokio::test]
    async fn disconnect_mid_stream_persists_no_assistant_message() {
        let gate = Arc::new(Semaphore::new(0));
        let fx = fixture(
            MockLlm::gated(&["first ", "second ", "third"], gate.clone()),
            true,
        )
        .await;
        let session = fx.chats.create_session("u1", "chat", None).await.unwrap();

        let mut rx = fx
            .pipeline
            .send("u1", &session.id, "hello".to_string())
            .await
            .unwrap();

        // Take the first delta, then hang up.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, StreamEvent::Message { .. }));
        drop(rx);

        gate.add_permits(2);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let messages = fx.chats.list_messages(&session.id, 0, 0).await.unwrap();
        assert_eq!(messages.len(), 1, "only the user message survives");
        assert_eq!(messages[0].role, Role::User);
    }
}
