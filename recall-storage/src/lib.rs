//! Storage layer for the Recall memory service.
//!
//! This crate isolates everything that touches durable or external state:
//! - the [`VectorStore`] capability trait with Qdrant and local backends
//! - the keyed entity lock manager used by the write path
//! - timestamped local snapshots with retention
//! - the S3-compatible cloud mirror

pub mod cloud;
pub mod local;
pub mod locks;
pub mod qdrant;
pub mod snapshot;

use async_trait::async_trait;
use recall_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use cloud::{CloudSync, RemoteSnapshot};
pub use local::LocalVectorStore;
pub use locks::{ALL_ENTITIES, DEFAULT_ENTITY, EntityLockManager, entity_key};
pub use qdrant::{QdrantSettings, QdrantVectorStore};
pub use snapshot::{BackupInfo, SnapshotManager, validate_backup_name};

/// A vector plus payload, keyed by the memory id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: i64,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A search hit from the store. Scores are cosine similarity in `[-1, 1]`
/// (practically `[0, 1]` for unit vectors).
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: i64,
    pub score: f32,
    pub payload: Value,
}

/// A scrolled point without its vector.
#[derive(Debug, Clone)]
pub struct PayloadPoint {
    pub id: i64,
    pub payload: Value,
}

/// Capability contract for vector collections keyed by int64 ids.
///
/// Writes must use strong ordering with wait-for-commit so a subsequent read
/// observes them; reads use a majority consistency level where the backend
/// distinguishes the two.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection with cosine distance if missing. Idempotent.
    async fn ensure_collection(&self, dimension: usize) -> Result<()>;

    /// Configured vector size of the collection, `None` if it does not exist.
    async fn dimension(&self) -> Result<Option<usize>>;

    /// Drop and re-create the collection.
    async fn recreate_collection(&self, dimension: usize) -> Result<()>;

    /// Exact point count.
    async fn count(&self) -> Result<usize>;

    /// Insert or overwrite points.
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<()>;

    /// K-nearest search with an optional score threshold.
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: Option<f64>,
    ) -> Result<Vec<ScoredPoint>>;

    /// Delete points by id. Unknown ids are ignored by the backend.
    async fn delete(&self, ids: &[i64]) -> Result<()>;

    /// Replace the payload of one point without touching its vector.
    async fn set_payload(&self, id: i64, payload: Value) -> Result<()>;

    /// Page through all points. `offset` is the id to resume from.
    async fn scroll(
        &self,
        offset: Option<i64>,
        limit: usize,
    ) -> Result<(Vec<PayloadPoint>, Option<i64>)>;
}
