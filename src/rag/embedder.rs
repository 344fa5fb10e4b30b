//! Text embedding over an OpenAI-compatible `/embeddings` endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::core::errors::ApiError;

/// Embedding dimension of the reference model.
pub const EMBEDDING_DIM: usize = 768;

const EMBED_BATCH_SIZE: usize = 32;

/// Produces one L2-normalized vector per input text, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError>;
}

/// Remote embedder speaking the OpenAI embeddings protocol.
///
/// The backend serves one model process, so concurrent callers are
/// serialized here rather than contending for it.
pub struct OpenAiEmbedder {
    base_url: String,
    api_key: String,
    model: String,
    dim: usize,
    client: Client,
    gate: Mutex<()>,
}

impl OpenAiEmbedder {
    pub fn new(base_url: &str, api_key: &str, model: &str, dim: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dim,
            client: Client::new(),
            gate: Mutex::new(()),
        }
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.model,
            "input": batch,
        });

        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let res = request.send().await.map_err(ApiError::model)?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::Model(format!(
                "embedding request failed ({status}): {text}"
            )));
        }

        let payload: Value = res.json().await.map_err(ApiError::model)?;
        let data = payload["data"]
            .as_array()
            .ok_or_else(|| ApiError::Model("embedding response missing data".to_string()))?;

        // The protocol allows out-of-order items; restore input order.
        let mut ordered: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for (position, item) in data.iter().enumerate() {
            let index = item["index"].as_u64().map(|i| i as usize).unwrap_or(position);
            let values = item["embedding"]
                .as_array()
                .ok_or_else(|| ApiError::Model("embedding item missing vector".to_string()))?;
            let vector: Vec<f32> = values
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            if vector.len() != self.dim {
                return Err(ApiError::Model(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dim,
                    vector.len()
                )));
            }
            ordered.push((index, vector));
        }
        ordered.sort_by_key(|(index, _)| *index);

        if ordered.len() != batch.len() {
            return Err(ApiError::Model(format!(
                "embedding count mismatch: sent {}, got {}",
                batch.len(),
                ordered.len()
            )));
        }

        Ok(ordered
            .into_iter()
            .map(|(_, vector)| l2_normalize(vector))
            .collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.gate.lock().await;
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

pub fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}
