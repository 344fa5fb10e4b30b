//! Structured events streamed to chat clients.

use serde::Serialize;
use serde_json::Value;

pub use crate::db::chats::ContentKind;

/// One frame of a chat response stream, serialized with a `type` tag.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Retrieval progress: `search_start`, `search_complete`,
    /// `context_build`, `context_complete`, `generate_start`, or a
    /// `<step>_error` form carrying the failure.
    RagStep { step: String, data: Value },
    /// A generated text delta.
    Message {
        content: String,
        content_type: ContentKind,
    },
    /// Successful end of the turn.
    Done,
    /// Terminal failure; the stream ends after this frame.
    Error {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl StreamEvent {
    pub fn rag_step(step: &str, data: Value) -> Self {
        StreamEvent::RagStep {
            step: step.to_string(),
            data,
        }
    }

    pub fn message(content: impl Into<String>) -> Self {
        StreamEvent::Message {
            content: content.into(),
            content_type: ContentKind::Content,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        StreamEvent::Error {
            content: content.into(),
            data: None,
        }
    }
}
