pub mod client;
pub mod types;

pub use client::{LlmClient, OpenAiChatClient};
pub use types::{ChatOptions, LlmMessage};
