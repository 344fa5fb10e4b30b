//! Streaming chat completion over an OpenAI-compatible endpoint.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::core::errors::ApiError;
use crate::llm::types::{ChatOptions, LlmMessage};

/// A finite stream of text deltas. The producer may pause arbitrarily
/// between items; an `Err` item ends the stream and already-yielded output
/// is not rolled back.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn stream_chat(
        &self,
        messages: Vec<LlmMessage>,
        options: &ChatOptions,
    ) -> Result<mpsc::Receiver<Result<String, ApiError>>, ApiError>;
}

#[derive(Clone)]
pub struct OpenAiChatClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiChatClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client: Client::new(),
        }
    }
}

/// One parsed line of an OpenAI SSE response body.
#[derive(Debug, PartialEq)]
enum LineEvent {
    Delta(String),
    Done,
    Skip,
}

fn parse_stream_line(line: &str) -> LineEvent {
    let line = line.trim();
    if line.is_empty() {
        return LineEvent::Skip;
    }
    if line == "data: [DONE]" {
        return LineEvent::Done;
    }
    let Some(data) = line.strip_prefix("data: ") else {
        return LineEvent::Skip;
    };
    let Ok(payload) = serde_json::from_str::<Value>(data) else {
        return LineEvent::Skip;
    };
    match payload["choices"][0]["delta"]["content"].as_str() {
        Some(content) if !content.is_empty() => LineEvent::Delta(content.to_string()),
        _ => LineEvent::Skip,
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn stream_chat(
        &self,
        messages: Vec<LlmMessage>,
        options: &ChatOptions,
    ) -> Result<mpsc::Receiver<Result<String, ApiError>>, ApiError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = json!({
            "model": options.model,
            "messages": messages,
            "stream": true,
            "temperature": options.temperature,
        });
        if let (Some(obj), Some(max_tokens)) = (body.as_object_mut(), options.max_tokens) {
            obj.insert("max_tokens".to_string(), json!(max_tokens));
        }

        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let res = request.send().await.map_err(ApiError::upstream)?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "chat completion failed ({status}): {text}"
            )));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut stream = res.bytes_stream();

        tokio::spawn(async move {
            // Deltas can split across transport chunks; keep a line buffer.
            let mut buffer = String::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(newline) = buffer.find('\n') {
                            let line: String = buffer.drain(..=newline).collect();
                            match parse_stream_line(&line) {
                                LineEvent::Delta(content) => {
                                    if tx.send(Ok(content)).await.is_err() {
                                        return;
                                    }
                                }
                                LineEvent::Done => return,
                                LineEvent::Skip => {}
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(ApiError::upstream(err))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
