//! Embedding providers for the Recall memory service.
//!
//! An [`Embedder`] encodes strings into unit-norm `f32` vectors of a fixed
//! dimension. Providers are hot-swappable behind the engine's embedder mutex,
//! so implementations do not need internal synchronization beyond what their
//! runtimes require.

pub mod onnx;
pub mod openai;

use async_trait::async_trait;
use recall_core::{RecallError, Result, env_str};
use tracing::info;

pub use onnx::OnnxEmbedder;
pub use openai::OpenAiEmbedder;

/// Capability contract for embedding backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Short provider/model label for logs and config.
    fn name(&self) -> &str;

    /// Output vector dimension.
    fn dimension(&self) -> usize;

    /// Encode a batch of texts into L2-normalized vectors, one per input.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Release runtime resources. Called when the embedder is swapped out.
    fn close(&self) {}
}

/// Settings resolved from the environment for constructing embedders.
#[derive(Debug, Clone)]
pub struct EmbedSettings {
    pub provider: String,
    pub model: String,
    pub model_dir: Option<String>,
    pub dimension: usize,
    pub openai_api_key: Option<String>,
}

impl EmbedSettings {
    pub fn from_env() -> Self {
        let provider = env_str("EMBED_PROVIDER").unwrap_or_else(|| "onnx".to_string());
        let provider = provider.to_lowercase();
        let model = env_str("EMBED_MODEL").unwrap_or_else(|| match provider.as_str() {
            "openai" => "text-embedding-3-small".to_string(),
            _ => env_str("MODEL_NAME").unwrap_or_else(|| "all-MiniLM-L6-v2".to_string()),
        });
        Self {
            provider,
            model,
            model_dir: env_str("MODEL_CACHE_DIR"),
            dimension: recall_core::env_int("EMBED_DIMENSION", 384, 1) as usize,
            openai_api_key: env_str("OPENAI_API_KEY"),
        }
    }
}

/// Construct an embedder from settings. Fails fast on unknown providers or
/// missing credentials so misconfiguration surfaces at startup, not on the
/// first write.
pub fn make_embedder(settings: &EmbedSettings) -> Result<Box<dyn Embedder>> {
    match settings.provider.as_str() {
        "onnx" => {
            info!(model = %settings.model, "Embedder: provider=onnx");
            Ok(Box::new(OnnxEmbedder::new(
                &settings.model,
                settings.model_dir.as_deref(),
                settings.dimension,
            )?))
        }
        "openai" => {
            let api_key = settings.openai_api_key.clone().ok_or_else(|| {
                RecallError::config("EMBED_PROVIDER=openai requires OPENAI_API_KEY to be set")
            })?;
            info!(model = %settings.model, "Embedder: provider=openai");
            Ok(Box::new(OpenAiEmbedder::new(&settings.model, api_key)))
        }
        other => Err(RecallError::config(format!(
            "Unknown EMBED_PROVIDER={other:?}. Valid values: openai, onnx"
        ))),
    }
}

/// L2-normalize a vector in place. Near-zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Deterministic token-feature-hashing embedder.
///
/// Each lowercased whitespace token is hashed onto one of `dimension`
/// buckets; the bucket counts are L2-normalized. Texts sharing tokens get
/// proportionally high cosine similarity, which is enough for integration
/// tests and for the ONNX fallback path when model files are absent. It does
/// NOT provide semantic understanding.
pub struct HashEmbedder {
    name: String,
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            name: "hash".to_string(),
            dimension,
        }
    }

    fn token_bucket(&self, token: &str) -> usize {
        let hash = token
            .bytes()
            .fold(1469598103934665603u64, |acc, b| {
                (acc ^ b as u64).wrapping_mul(1099511628211)
            });
        (hash % self.dimension as u64) as usize
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split_whitespace() {
            vector[self.token_bucket(token)] += 1.0;
        }
        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedder_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.encode(&["hello world".to_string()]).await.unwrap();
        let b = embedder.encode(&["hello world".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
    }

    #[tokio::test]
    async fn test_hash_embedder_unit_norm() {
        let embedder = HashEmbedder::new(64);
        let vectors = embedder
            .encode(&["tokio async runtime".to_string()])
            .await
            .unwrap();
        let norm: f32 = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hash_embedder_token_overlap_similarity() {
        let embedder = HashEmbedder::new(128);
        let vectors = embedder
            .encode(&[
                "rust memory service".to_string(),
                "rust memory engine".to_string(),
                "completely unrelated words".to_string(),
            ])
            .await
            .unwrap();
        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&vectors[0], &vectors[1]) > dot(&vectors[0], &vectors[2]));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let settings = EmbedSettings {
            provider: "bogus".to_string(),
            model: "m".to_string(),
            model_dir: None,
            dimension: 8,
            openai_api_key: None,
        };
        assert!(make_embedder(&settings).is_err());
    }
}
