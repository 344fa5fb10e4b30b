//! Retrieval-augmented generation: chunking, embedding, vector storage,
//! and the coordinator that keeps the index converged with document edits.

pub mod chunker;
pub mod coordinator;
pub mod embedder;
pub mod indexer;
pub mod sqlite;
pub mod store;
