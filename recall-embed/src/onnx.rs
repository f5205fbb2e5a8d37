//! ONNX Runtime embedder for local models.
//!
//! Loads a sentence-transformer exported to ONNX (`model.onnx` plus
//! `tokenizer.json` in the same directory) and runs batched inference with
//! attention-mask-weighted mean pooling. When the model files are absent the
//! embedder falls back to the deterministic hash embedder at the configured
//! dimension, which keeps integration environments functional without the
//! model download.

use crate::{Embedder, HashEmbedder, l2_normalize};
use async_trait::async_trait;
use ndarray::{Array, Axis, CowArray, IxDyn};
use parking_lot::RwLock;
use recall_core::{RecallError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_SEQ_LENGTH: usize = 256;

pub struct OnnxEmbedder {
    name: String,
    dimension: usize,
    session: Option<Arc<RwLock<ort::Session>>>,
    tokenizer: Option<Arc<tokenizers::Tokenizer>>,
    #[allow(dead_code)] // keeps the environment alive for the session
    environment: Option<Arc<ort::Environment>>,
    fallback: Option<HashEmbedder>,
    max_batch_size: usize,
}

impl OnnxEmbedder {
    /// Load the model from `<model_dir>/<model_name>/model.onnx` (or
    /// `<model_dir>/model.onnx` when the nested layout is absent). Missing
    /// files trigger the hash-embedder fallback at `fallback_dimension`.
    pub fn new(model_name: &str, model_dir: Option<&str>, fallback_dimension: usize) -> Result<Self> {
        let model_path = model_dir.and_then(|dir| Self::locate_model(dir, model_name));

        match model_path {
            Some(path) => match Self::load(&path) {
                Ok((environment, session, tokenizer)) => {
                    let session = Arc::new(RwLock::new(session));
                    let tokenizer = Arc::new(tokenizer);
                    let dimension =
                        Self::probe_dimension(&session, &tokenizer)?;
                    info!(
                        model = model_name,
                        dimension, "ONNX embedder loaded from {}", path.display()
                    );
                    Ok(Self {
                        name: format!("onnx/{model_name}"),
                        dimension,
                        session: Some(session),
                        tokenizer: Some(tokenizer),
                        environment: Some(environment),
                        fallback: None,
                        max_batch_size: 64,
                    })
                }
                Err(e) => {
                    warn!("Failed to load ONNX model: {e}. Using hash fallback embeddings.");
                    Ok(Self::fallback_embedder(model_name, fallback_dimension))
                }
            },
            None => {
                warn!(
                    model = model_name,
                    "No ONNX model files found. Using hash fallback embeddings."
                );
                Ok(Self::fallback_embedder(model_name, fallback_dimension))
            }
        }
    }

    fn fallback_embedder(model_name: &str, dimension: usize) -> Self {
        Self {
            name: format!("onnx/{model_name}"),
            dimension,
            session: None,
            tokenizer: None,
            environment: None,
            fallback: Some(HashEmbedder::new(dimension)),
            max_batch_size: 64,
        }
    }

    fn locate_model(model_dir: &str, model_name: &str) -> Option<PathBuf> {
        let nested = Path::new(model_dir).join(model_name).join("model.onnx");
        if nested.exists() {
            return Some(nested);
        }
        let flat = Path::new(model_dir).join("model.onnx");
        flat.exists().then_some(flat)
    }

    fn load(
        model_path: &Path,
    ) -> Result<(Arc<ort::Environment>, ort::Session, tokenizers::Tokenizer)> {
        let environment = ort::Environment::builder()
            .with_name("recall_embed")
            .with_log_level(ort::LoggingLevel::Warning)
            .build()
            .map_err(|e| RecallError::embedding(format!("ONNX environment: {e}")))?
            .into_arc();

        let session = ort::SessionBuilder::new(&environment)
            .and_then(|b| b.with_optimization_level(ort::GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(4))
            .and_then(|b| b.with_model_from_file(model_path))
            .map_err(|e| RecallError::embedding(format!("ONNX session: {e}")))?;

        let tokenizer_path = model_path
            .parent()
            .map(|dir| dir.join("tokenizer.json"))
            .filter(|p| p.exists())
            .ok_or_else(|| {
                RecallError::embedding(format!(
                    "tokenizer.json not found next to {}",
                    model_path.display()
                ))
            })?;

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| RecallError::embedding(format!("tokenizer load: {e}")))?;

        Ok((environment, session, tokenizer))
    }

    fn probe_dimension(
        session: &Arc<RwLock<ort::Session>>,
        tokenizer: &Arc<tokenizers::Tokenizer>,
    ) -> Result<usize> {
        let probe = run_inference(session, tokenizer, &["dimension probe".to_string()])?;
        probe
            .first()
            .map(Vec::len)
            .ok_or_else(|| RecallError::embedding("empty probe output"))
    }
}

#[async_trait]
impl Embedder for OnnxEmbedder {
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
        if let Some(fallback) = &self.fallback {
            return Ok(texts.iter().map(|t| fallback.embed_one(t)).collect());
        }

        let session = self.session.clone().ok_or_else(|| {
            RecallError::embedding("ONNX session not initialized")
        })?;
        let tokenizer = self.tokenizer.clone().ok_or_else(|| {
            RecallError::embedding("tokenizer not initialized")
        })?;
        let texts = texts.to_vec();
        let max_batch = self.max_batch_size;

        // Inference is CPU-bound; keep it off the reactor.
        tokio::task::spawn_blocking(move || {
            let mut all = Vec::with_capacity(texts.len());
            for chunk in texts.chunks(max_batch) {
                all.extend(run_inference(&session, &tokenizer, chunk)?);
            }
            Ok(all)
        })
        .await
        .map_err(|e| RecallError::internal(format!("embedding task join: {e}")))?
    }

    fn close(&self) {
        debug!(embedder = %self.name, "closing ONNX embedder");
    }
}

/// Run one batched inference call: tokenize with padding, execute the
/// session, mask-weighted mean pool, L2-normalize.
fn run_inference(
    session: &Arc<RwLock<ort::Session>>,
    tokenizer: &Arc<tokenizers::Tokenizer>,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let batch_size = texts.len();

    let encodings = tokenizer
        .encode_batch(texts.to_vec(), true)
        .map_err(|e| RecallError::embedding(format!("batch tokenization failed: {e}")))?;

    let max_len = encodings
        .iter()
        .map(|e| e.get_ids().len())
        .max()
        .unwrap_or(0)
        .min(MAX_SEQ_LENGTH)
        .max(1);

    let mut input_ids = Vec::with_capacity(batch_size * max_len);
    let mut attention_mask = Vec::with_capacity(batch_size * max_len);
    for encoding in &encodings {
        let ids = encoding.get_ids();
        let mask = encoding.get_attention_mask();
        let seq_len = ids.len().min(max_len);
        for i in 0..seq_len {
            input_ids.push(ids[i] as i64);
            attention_mask.push(mask[i] as i64);
        }
        for _ in seq_len..max_len {
            input_ids.push(0);
            attention_mask.push(0);
        }
    }

    let session_guard = session.read();
    let allocator = session_guard.allocator();

    let input_ids_array = Array::from_shape_vec(IxDyn(&[batch_size, max_len]), input_ids)
        .map_err(|e| RecallError::embedding(format!("input tensor: {e}")))?;
    let attention_array =
        Array::from_shape_vec(IxDyn(&[batch_size, max_len]), attention_mask.clone())
            .map_err(|e| RecallError::embedding(format!("attention tensor: {e}")))?;

    let input_ids_cow: CowArray<i64, IxDyn> = CowArray::from(input_ids_array);
    let attention_cow: CowArray<i64, IxDyn> = CowArray::from(attention_array);

    let mut inputs = vec![
        ort::Value::from_array(allocator, &input_ids_cow)
            .map_err(|e| RecallError::embedding(format!("input value: {e}")))?,
        ort::Value::from_array(allocator, &attention_cow)
            .map_err(|e| RecallError::embedding(format!("attention value: {e}")))?,
    ];

    // Some exports expect token_type_ids as a third input.
    let type_ids_cow: CowArray<i64, IxDyn>;
    if session_guard.inputs.len() == 3 {
        let zeros = Array::from_elem(IxDyn(&[batch_size, max_len]), 0i64);
        type_ids_cow = CowArray::from(zeros);
        inputs.push(
            ort::Value::from_array(allocator, &type_ids_cow)
                .map_err(|e| RecallError::embedding(format!("token type value: {e}")))?,
        );
    }

    let outputs = session_guard
        .run(inputs)
        .map_err(|e| RecallError::embedding(format!("inference failed: {e}")))?;

    let tensor = outputs[0]
        .try_extract::<f32>()
        .map_err(|e| RecallError::embedding(format!("output extract: {e}")))?;
    let view = tensor.view();
    let shape = view.shape().to_vec();

    let mut results = Vec::with_capacity(batch_size);
    match shape.len() {
        3 => {
            // [batch, seq, hidden]: mean pool over attended tokens.
            let hidden = shape[2];
            for b in 0..batch_size {
                let item = view.index_axis(Axis(0), b);
                let mut pooled = vec![0.0f32; hidden];
                let mut attended = 0.0f32;
                for (t, row) in item.axis_iter(Axis(0)).enumerate() {
                    if attention_mask[b * max_len + t] == 0 {
                        continue;
                    }
                    attended += 1.0;
                    for (j, value) in row.iter().enumerate() {
                        pooled[j] += *value;
                    }
                }
                let denom = attended.max(1e-9);
                for value in pooled.iter_mut() {
                    *value /= denom;
                }
                l2_normalize(&mut pooled);
                results.push(pooled);
            }
        }
        2 => {
            // [batch, hidden]: already pooled by the export.
            for b in 0..batch_size {
                let mut pooled: Vec<f32> =
                    view.index_axis(Axis(0), b).iter().copied().collect();
                l2_normalize(&mut pooled);
                results.push(pooled);
            }
        }
        _ => {
            return Err(RecallError::embedding(format!(
                "unexpected output shape: {shape:?}"
            )));
        }
    }

    debug!(batch = batch_size, "ONNX batch inference complete");
    Ok(results)
}
