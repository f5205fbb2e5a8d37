//! Local vector store: exact cosine scan over an in-memory collection.
//!
//! Used when `QDRANT_URL` is unset (embedded/local mode) and by tests. The
//! collection is mirrored to a JSON file under the data directory so a
//! restart keeps count parity with the metadata log without a reindex.

use crate::{PayloadPoint, ScoredPoint, VectorPoint, VectorStore};
use async_trait::async_trait;
use recall_core::{RecallError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Collection {
    dimension: Option<usize>,
    points: BTreeMap<i64, StoredPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPoint {
    vector: Vec<f32>,
    payload: serde_json::Value,
}

pub struct LocalVectorStore {
    path: Option<PathBuf>,
    collection: RwLock<Collection>,
}

impl LocalVectorStore {
    /// Purely in-memory store (tests).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            collection: RwLock::new(Collection::default()),
        }
    }

    /// Store persisted under `<dir>/collection.json`, loading any prior
    /// contents.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("collection.json");
        let collection = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Collection::default(),
            Err(e) => return Err(e.into()),
        };
        if !collection.points.is_empty() {
            info!(
                points = collection.points.len(),
                "Loaded local vector collection from {}",
                path.display()
            );
        }
        Ok(Self {
            path: Some(path),
            collection: RwLock::new(collection),
        })
    }

    async fn persist(&self, collection: &Collection) -> Result<()> {
        if let Some(path) = &self.path {
            let raw = serde_json::to_string(collection)?;
            tokio::fs::write(path, raw).await?;
        }
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= 1e-12 || norm_b <= 1e-12 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn ensure_collection(&self, dimension: usize) -> Result<()> {
        let mut collection = self.collection.write().await;
        if collection.dimension.is_none() {
            collection.dimension = Some(dimension);
            self.persist(&collection).await?;
        }
        Ok(())
    }

    async fn dimension(&self) -> Result<Option<usize>> {
        Ok(self.collection.read().await.dimension)
    }

    async fn recreate_collection(&self, dimension: usize) -> Result<()> {
        let mut collection = self.collection.write().await;
        collection.points.clear();
        collection.dimension = Some(dimension);
        self.persist(&collection).await?;
        debug!(dimension, "local collection recreated");
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.collection.read().await.points.len())
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<()> {
        let mut collection = self.collection.write().await;
        if let Some(dimension) = collection.dimension {
            if let Some(bad) = points.iter().find(|p| p.vector.len() != dimension) {
                return Err(RecallError::vector_store(format!(
                    "dimension mismatch: expected {dimension}, got {} for id {}",
                    bad.vector.len(),
                    bad.id
                )));
            }
        }
        for point in points {
            collection.points.insert(
                point.id,
                StoredPoint {
                    vector: point.vector,
                    payload: point.payload,
                },
            );
        }
        self.persist(&collection).await
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: Option<f64>,
    ) -> Result<Vec<ScoredPoint>> {
        let collection = self.collection.read().await;
        let mut hits: Vec<ScoredPoint> = collection
            .points
            .iter()
            .map(|(&id, point)| ScoredPoint {
                id,
                score: cosine(vector, &point.vector),
                payload: point.payload.clone(),
            })
            .filter(|hit| threshold.is_none_or(|t| hit.score as f64 >= t))
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete(&self, ids: &[i64]) -> Result<()> {
        let mut collection = self.collection.write().await;
        for id in ids {
            collection.points.remove(id);
        }
        self.persist(&collection).await
    }

    async fn set_payload(&self, id: i64, payload: serde_json::Value) -> Result<()> {
        let mut collection = self.collection.write().await;
        match collection.points.get_mut(&id) {
            Some(point) => point.payload = payload,
            None => return Err(RecallError::not_found("point", id)),
        }
        self.persist(&collection).await
    }

    async fn scroll(
        &self,
        offset: Option<i64>,
        limit: usize,
    ) -> Result<(Vec<PayloadPoint>, Option<i64>)> {
        let collection = self.collection.read().await;
        let start = offset.unwrap_or(i64::MIN);
        let mut page: Vec<PayloadPoint> = collection
            .points
            .range(start..)
            .take(limit + 1)
            .map(|(&id, point)| PayloadPoint {
                id,
                payload: point.payload.clone(),
            })
            .collect();
        let next_offset = if page.len() > limit {
            page.pop().map(|point| point.id)
        } else {
            None
        };
        Ok((page, next_offset))
    }
}
