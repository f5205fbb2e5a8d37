//! OpenAI embeddings provider.
//!
//! No local model download or ONNX runtime required. The SDK-equivalent
//! transient handling (429/5xx) is one defensive retry layer here; the
//! engine's embedder mutex provides the serialization.

use crate::{Embedder, l2_normalize};
use async_trait::async_trait;
use recall_core::{RecallError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

const ENDPOINT: &str = "https://api.openai.com/v1/embeddings";
const MAX_RETRIES: usize = 2;
const BATCH_SIZE: usize = 128;

// Dimensions for well-known models, avoiding a probe call at startup.
fn known_dimension(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        "text-embedding-ada-002" => Some(1536),
        _ => None,
    }
}

pub struct OpenAiEmbedder {
    name: String,
    model: String,
    dimension: usize,
    api_key: String,
    client: Client,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(model: &str, api_key: String) -> Self {
        let dimension = known_dimension(model).unwrap_or(1536);
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        info!(model, dimension, "OpenAI embedder initialized");
        Self {
            name: format!("openai/{model}"),
            model: model.to_string(),
            dimension,
            api_key,
            client,
        }
    }

    async fn call_api(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_error = None;
        for attempt in 0..=MAX_RETRIES {
            match self.call_api_once(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        warn!(
                            "OpenAI embedding call failed (attempt {}/{}): {e}",
                            attempt + 1,
                            MAX_RETRIES + 1
                        );
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| RecallError::embedding("embedding call failed")))
    }

    async fn call_api_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingsRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| RecallError::embedding(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RecallError::embedding(format!(
                "OpenAI API error {status}: {body}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| RecallError::embedding(format!("response decode: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(RecallError::embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(BATCH_SIZE) {
            let mut vectors = self.call_api(chunk).await?;
            for vector in vectors.iter_mut() {
                l2_normalize(vector);
            }
            all.append(&mut vectors);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_dimensions() {
        assert_eq!(known_dimension("text-embedding-3-small"), Some(1536));
        assert_eq!(known_dimension("text-embedding-3-large"), Some(3072));
        assert_eq!(known_dimension("mystery-model"), None);
    }

    #[test]
    fn test_embedder_metadata() {
        let embedder = OpenAiEmbedder::new("text-embedding-3-small", "sk-test".to_string());
        assert_eq!(embedder.dimension(), 1536);
        assert_eq!(embedder.name(), "openai/text-embedding-3-small");
    }
}
