use std::sync::Arc;

use crate::chat::ChatPipeline;
use crate::core::config::{AppPaths, Settings};
use crate::core::errors::ApiError;
use crate::db;
use crate::db::chats::ChatRepo;
use crate::db::documents::DocumentRepo;
use crate::llm::{ChatOptions, LlmClient, OpenAiChatClient};
use crate::rag::chunker::ChunkParams;
use crate::rag::coordinator::{CoordinatorConfig, IndexCoordinator};
use crate::rag::embedder::{Embedder, OpenAiEmbedder};
use crate::rag::indexer::RagIndexer;
use crate::rag::sqlite::SqliteVectorStore;
use crate::rag::store::VectorStore;

/// Shared application state, cloned into every handler.
pub struct AppState {
    pub settings: Settings,
    pub documents: DocumentRepo,
    pub chats: ChatRepo,
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<dyn VectorStore>,
    pub coordinator: Arc<IndexCoordinator>,
    pub pipeline: ChatPipeline,
}

impl AppState {
    /// Wire config, databases, stores, clients, the index coordinator and
    /// the chat pipeline.
    pub async fn initialize(paths: &AppPaths, settings: Settings) -> Result<Arc<Self>, ApiError> {
        let pool = db::connect(&paths.db_path).await?;
        let documents = DocumentRepo::new(pool.clone()).await?;
        let chats = ChatRepo::new(pool).await?;

        let vectors: Arc<dyn VectorStore> =
            Arc::new(SqliteVectorStore::with_path(&paths.vector_db_path).await?);
        vectors.ensure_collection(settings.embedding_dim).await?;

        let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(
            &settings.openai_base_url,
            &settings.openai_api_key,
            &settings.embed_model,
            settings.embedding_dim,
        ));
        let llm: Arc<dyn LlmClient> = Arc::new(OpenAiChatClient::new(
            &settings.openai_base_url,
            &settings.openai_api_key,
        ));

        let indexer = Arc::new(RagIndexer::new(
            embedder.clone(),
            vectors.clone(),
            ChunkParams::default(),
        ));
        let coordinator = Arc::new(IndexCoordinator::new(
            CoordinatorConfig::from_settings(&settings),
            documents.clone(),
            vectors.clone(),
            indexer,
        ));

        let options = ChatOptions {
            model: settings.chat_model.clone(),
            ..ChatOptions::default()
        };
        let pipeline = ChatPipeline::new(
            chats.clone(),
            embedder.clone(),
            vectors.clone(),
            llm,
            options,
            settings.rag_enabled,
        );

        Ok(Arc::new(AppState {
            settings,
            documents,
            chats,
            embedder,
            vectors,
            coordinator,
            pipeline,
        }))
    }
}
