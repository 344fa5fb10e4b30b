//! Personal knowledge-base service: asynchronous vector indexing of user
//! documents and a streaming retrieval-augmented chat pipeline on top.

pub mod chat;
pub mod core;
pub mod db;
pub mod llm;
pub mod rag;
pub mod server;
pub mod state;

#[cfg(test)]
mod test_support;
