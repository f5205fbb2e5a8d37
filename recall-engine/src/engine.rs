//! The memory engine: CRUD, hybrid retrieval, deduplication, rebuilds, and
//! snapshot-backed durability over the vector store + metadata log pair.
//!
//! Write discipline: entity locks (sorted, keyed by source) are taken first,
//! then the global write mutex, then the in-memory state is mutated and
//! persisted, and the BM25 mirror is rebuilt whenever text changed. Reads
//! never take the write mutex; query encoding serializes on the embedder
//! mutex so non-thread-safe backends stay safe and hot-reload can swap the
//! embedder atomically.

use crate::bm25::{Bm25Index, tokenize};
use crate::chunker::{self, chunk_markdown};
use chrono::{DateTime, Utc};
use recall_core::{
    Metadata, MemoryRecord, RecallError, Result, SearchMatch, StoreConfig, round6,
};
use recall_embed::Embedder;
use recall_storage::{
    ALL_ENTITIES, CloudSync, EntityLockManager, SnapshotManager, VectorPoint, VectorStore,
    entity_key,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Texts are encoded in chunks of this size to bound peak memory.
const ENCODE_CHUNK: usize = 100;
/// Vector points are upserted in batches of this size.
const UPSERT_BATCH: usize = 256;
/// Adds larger than this take a `pre_add` snapshot first.
const SNAPSHOT_ADD_THRESHOLD: usize = 10;
/// Reciprocal rank fusion constant.
const RRF_K: f64 = 60.0;
/// Search fan-out is capped at this many hits.
const SEARCH_K_CAP: usize = 100;

pub const DEFAULT_NOVELTY_THRESHOLD: f64 = 0.88;
pub const DEFAULT_DEDUP_THRESHOLD: f64 = 0.90;

/// Builds replacement embedders for hot-reload. Must be cheap to clone and
/// safe to invoke from a blocking thread.
pub type EmbedderFactory = Arc<dyn Fn() -> Result<Box<dyn Embedder>> + Send + Sync>;

pub struct EngineOptions {
    pub data_dir: PathBuf,
    pub store: Arc<dyn VectorStore>,
    pub embedder_factory: EmbedderFactory,
    pub cloud: Option<CloudSync>,
    pub max_backups: usize,
}

struct EngineState {
    metadata: Vec<MemoryRecord>,
    id_map: HashMap<i64, usize>,
    next_id: i64,
    bm25: Option<Bm25Index>,
    bm25_pos_to_id: Vec<i64>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            metadata: Vec::new(),
            id_map: HashMap::new(),
            next_id: 0,
            bm25: None,
            bm25_pos_to_id: Vec::new(),
        }
    }

    fn rebuild_id_map(&mut self) {
        self.id_map = self
            .metadata
            .iter()
            .enumerate()
            .map(|(index, record)| (record.id, index))
            .collect();
        self.bm25_pos_to_id = self.metadata.iter().map(|record| record.id).collect();
        // next_id only ever advances: deleting the highest id must not allow
        // its reuse. rebuild_from_files resets the counter explicitly.
        let observed = self.id_map.keys().max().map_or(0, |max| max + 1);
        self.next_id = self.next_id.max(observed);
    }

    fn rebuild_bm25(&mut self) {
        if self.metadata.is_empty() {
            self.bm25 = None;
            self.bm25_pos_to_id = Vec::new();
            return;
        }
        let corpus: Vec<Vec<String>> = self
            .metadata
            .iter()
            .map(|record| tokenize(&record.text))
            .collect();
        self.bm25 = Some(Bm25Index::new(&corpus));
        self.bm25_pos_to_id = self.metadata.iter().map(|record| record.id).collect();
    }

    fn record(&self, id: i64) -> Option<&MemoryRecord> {
        self.id_map.get(&id).map(|&index| &self.metadata[index])
    }

    fn record_mut(&mut self, id: i64) -> Option<&mut MemoryRecord> {
        let index = *self.id_map.get(&id)?;
        Some(&mut self.metadata[index])
    }

    fn exists(&self, id: i64) -> bool {
        self.id_map.contains_key(&id)
    }
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub deleted_id: i64,
    pub deleted_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteBatchResult {
    pub deleted_count: usize,
    pub deleted_ids: Vec<i64>,
    pub missing_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub id: i64,
    pub updated_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertOutcome {
    pub id: i64,
    pub action: String,
}

#[derive(Debug, Clone)]
pub struct UpsertEntry {
    pub text: String,
    pub source: String,
    pub key: String,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertBatchResult {
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
    pub results: Vec<UpsertOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupersedeResult {
    pub old_id: i64,
    pub new_id: Option<i64>,
    pub previous_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicatePair {
    pub id_a: i64,
    pub id_b: i64,
    pub similarity: f64,
    pub text_a: String,
    pub text_b: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeduplicateReport {
    pub duplicate_pairs: usize,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub would_remove: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairs: Option<Vec<DuplicatePair>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub files_processed: usize,
    pub memories_added: usize,
    pub backup_location: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryPage {
    pub memories: Vec<MemoryRecord>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderInfo {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_memories: usize,
    pub dimension: usize,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
    pub index_size_bytes: u64,
    pub backup_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsLight {
    pub total_memories: usize,
    pub dimension: usize,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadyStatus {
    pub ready: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qdrant_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub restored_from: String,
    pub total_memories: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    pub reloaded: bool,
    pub model: String,
    pub dimension: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct MemoryEngine {
    data_dir: PathBuf,
    metadata_path: PathBuf,
    config_path: PathBuf,
    legacy_index_path: PathBuf,
    migration_dir: PathBuf,
    vector_data_dir: PathBuf,

    store: Arc<dyn VectorStore>,
    embedder: Mutex<Box<dyn Embedder>>,
    embedder_factory: EmbedderFactory,
    dim: usize,

    state: RwLock<EngineState>,
    config: RwLock<StoreConfig>,
    write_lock: Mutex<()>,
    entity_locks: EntityLockManager,
    snapshots: SnapshotManager,
    cloud: Option<CloudSync>,
}

fn provider_and_model(name: &str) -> (String, String) {
    match name.split_once('/') {
        Some((provider, model)) => (provider.to_string(), model.to_string()),
        None => (name.to_string(), name.to_string()),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

impl MemoryEngine {
    pub async fn new(options: EngineOptions) -> Result<Self> {
        let data_dir = options.data_dir;
        tokio::fs::create_dir_all(&data_dir).await?;
        let backup_dir = data_dir.join("backups");
        tokio::fs::create_dir_all(&backup_dir).await?;

        let metadata_path = data_dir.join("metadata.json");
        let config_path = data_dir.join("config.json");
        let legacy_index_path = data_dir.join("index.faiss");
        let migration_dir = data_dir.join("migrations");
        let vector_data_dir = data_dir.join("qdrant");

        let factory = options.embedder_factory.clone();
        let embedder = tokio::task::spawn_blocking(move || factory())
            .await
            .map_err(|e| RecallError::internal(format!("embedder init join: {e}")))??;
        let dim = embedder.dimension();
        let (provider, model) = provider_and_model(embedder.name());

        options.store.ensure_collection(dim).await?;

        let snapshots = SnapshotManager::new(
            backup_dir,
            metadata_path.clone(),
            config_path.clone(),
            legacy_index_path.clone(),
            options.max_backups,
        );

        let engine = Self {
            data_dir,
            metadata_path,
            config_path,
            legacy_index_path,
            migration_dir,
            vector_data_dir,
            store: options.store,
            embedder: Mutex::new(embedder),
            embedder_factory: options.embedder_factory,
            dim,
            state: RwLock::new(EngineState::new()),
            config: RwLock::new(StoreConfig::new(model, provider, dim)),
            write_lock: Mutex::new(()),
            entity_locks: EntityLockManager::new(),
            snapshots,
            cloud: options.cloud,
        };

        engine.auto_restore_if_empty().await;

        if tokio::fs::try_exists(&engine.metadata_path)
            .await
            .unwrap_or(false)
        {
            engine.load(false).await?;
            if let Err(e) = engine.finalize_legacy_cutover().await {
                warn!("legacy cutover skipped: {e}");
            }
        }

        Ok(engine)
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn cloud(&self) -> Option<&CloudSync> {
        self.cloud.as_ref()
    }

    pub fn backup_dir(&self) -> &Path {
        self.snapshots.backup_dir()
    }

    // -- Encoding ----------------------------------------------------------

    /// Encode under the embedder mutex, in chunks to bound peak memory.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let embedder = self.embedder.lock().await;
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(ENCODE_CHUNK) {
            all.extend(embedder.encode(chunk).await?);
        }
        Ok(all)
    }

    // -- Persistence -------------------------------------------------------

    async fn save_state(&self, state: &EngineState) -> Result<()> {
        let metadata_json = serde_json::to_string_pretty(&state.metadata)?;
        tokio::fs::write(&self.metadata_path, metadata_json).await?;
        let config = self.config.read().await.clone();
        let config_json = serde_json::to_string_pretty(&config)?;
        tokio::fs::write(&self.config_path, config_json).await?;
        Ok(())
    }

    async fn mark_updated(&self) {
        self.config.write().await.touch();
    }

    /// Snapshot the state files and mirror to the cloud when configured.
    /// Cloud failures are logged, never propagated.
    async fn backup(&self, prefix: &str) -> Result<PathBuf> {
        let path = self.snapshots.create(prefix).await?;
        if let Some(cloud) = &self.cloud {
            match cloud.upload_backup(&path).await {
                Ok(report) => info!(
                    backup = %report.backup_name,
                    files = report.files_uploaded,
                    "cloud upload complete"
                ),
                Err(e) => error!("cloud upload failed: {e}"),
            }
        }
        Ok(path)
    }

    pub async fn create_backup(&self, prefix: &str) -> Result<PathBuf> {
        self.backup(prefix).await
    }

    pub async fn list_backups(&self) -> Result<Vec<recall_storage::BackupInfo>> {
        self.snapshots.list().await
    }

    /// Persist metadata/config without mutating anything (shutdown flush).
    pub async fn save(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let state = self.state.read().await;
        self.save_state(&state).await
    }

    // -- Integrity ---------------------------------------------------------

    async fn check_integrity(&self, state: &EngineState) -> Result<()> {
        let total_points = self.store.count().await?;
        if total_points != state.metadata.len() {
            error!(
                "Integrity mismatch: store has {} vectors, metadata has {} entries",
                total_points,
                state.metadata.len()
            );
            return Err(RecallError::failed_precondition(format!(
                "Index/metadata mismatch: {} vectors vs {} metadata entries. \
                 Restore from backup or rebuild the index.",
                total_points,
                state.metadata.len()
            )));
        }
        Ok(())
    }

    /// Remove specific ids from metadata and the store without a full
    /// reindex.
    async fn delete_ids_targeted(
        &self,
        state: &mut EngineState,
        ids: &HashSet<i64>,
    ) -> Result<()> {
        let id_list: Vec<i64> = ids.iter().copied().collect();
        self.store.delete(&id_list).await?;
        state.metadata.retain(|record| !ids.contains(&record.id));
        state.rebuild_id_map();
        Ok(())
    }

    /// Recreate the collection and re-embed every record.
    async fn reindex_from_metadata(&self, state: &EngineState) -> Result<()> {
        self.store.recreate_collection(self.dim).await?;
        if state.metadata.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = state
            .metadata
            .iter()
            .map(|record| record.text.clone())
            .collect();
        let embeddings = self.encode(&texts).await?;
        let points: Vec<VectorPoint> = state
            .metadata
            .iter()
            .zip(embeddings)
            .map(|(record, vector)| VectorPoint {
                id: record.id,
                vector,
                payload: record.point_payload(),
            })
            .collect();
        for batch in points.chunks(UPSERT_BATCH) {
            self.store.upsert(batch.to_vec()).await?;
        }
        Ok(())
    }

    // -- Load / restore ----------------------------------------------------

    /// Load metadata/config from disk and validate against the store,
    /// rebuilding vectors when the collection is empty, the dimension
    /// changed, or `rebuild_on_mismatch` allows it.
    pub async fn load(&self, rebuild_on_mismatch: bool) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let mut state = self.state.write().await;
        self.load_locked(&mut state, rebuild_on_mismatch).await
    }

    async fn load_locked(
        &self,
        state: &mut EngineState,
        rebuild_on_mismatch: bool,
    ) -> Result<()> {
        let raw = tokio::fs::read_to_string(&self.metadata_path).await?;
        let rows: Vec<Value> = serde_json::from_str(&raw)?;

        // Records written before the created_at/updated_at split carry only
        // `timestamp`; migrate them in place.
        let mut migrated = 0usize;
        let mut metadata = Vec::with_capacity(rows.len());
        for mut row in rows {
            if let Value::Object(fields) = &mut row {
                if !fields.contains_key("created_at") {
                    let ts = fields
                        .get("timestamp")
                        .cloned()
                        .unwrap_or_else(|| json!(Utc::now()));
                    fields.insert("created_at".to_string(), ts.clone());
                    fields.insert("updated_at".to_string(), ts.clone());
                    fields.insert("timestamp".to_string(), ts);
                    migrated += 1;
                }
            }
            metadata.push(serde_json::from_value::<MemoryRecord>(row)?);
        }
        state.metadata = metadata;

        if let Ok(raw_config) = tokio::fs::read_to_string(&self.config_path).await {
            if let Ok(stored) = serde_json::from_str::<StoreConfig>(&raw_config) {
                let mut config = self.config.write().await;
                config.created_at = stored.created_at;
                config.last_updated = stored.last_updated;
                config.storage_backend = stored.storage_backend;
                // model/provider/dimension always reflect the running embedder
            }
        }

        state.rebuild_id_map();

        if let Some(collection_dim) = self.store.dimension().await? {
            if collection_dim != self.dim {
                if state.metadata.is_empty() {
                    info!(
                        "Embedding dimension changed ({} -> {}) with empty metadata. Recreating collection.",
                        collection_dim, self.dim
                    );
                    self.store.recreate_collection(self.dim).await?;
                } else {
                    info!(
                        "Embedding dimension changed ({} -> {}). Rebuilding vectors from metadata.",
                        collection_dim, self.dim
                    );
                    self.reindex_from_metadata(state).await?;
                }
            }
        }

        let total_points = self.store.count().await?;
        if total_points == 0 && !state.metadata.is_empty() {
            info!("Vector collection empty with existing metadata. Rebuilding vectors.");
            self.reindex_from_metadata(state).await?;
        } else if rebuild_on_mismatch && total_points != state.metadata.len() {
            info!(
                "Vector store mismatch during restore/load ({} vs {}). Rebuilding vectors.",
                total_points,
                state.metadata.len()
            );
            self.reindex_from_metadata(state).await?;
        }

        self.check_integrity(state).await?;
        state.rebuild_bm25();

        if migrated > 0 {
            info!("Migrated {migrated} memories to created_at/updated_at timestamps");
            self.save_state(state).await?;
        }
        Ok(())
    }

    /// On first boot with cloud sync configured and no local metadata, pull
    /// the latest remote snapshot and restore it. Failures only log.
    async fn auto_restore_if_empty(&self) {
        let Some(cloud) = &self.cloud else { return };
        if tokio::fs::try_exists(&self.metadata_path)
            .await
            .unwrap_or(false)
        {
            return;
        }
        let latest = match cloud.latest_snapshot().await {
            Ok(Some(latest)) => latest,
            Ok(None) => return,
            Err(e) => {
                error!("Auto-download from cloud failed: {e}");
                return;
            }
        };
        info!("Local metadata empty - downloading latest backup from cloud: {latest}");
        let result = async {
            cloud
                .download_backup(&latest, self.snapshots.backup_dir())
                .await?;
            self.restore_from_backup(&latest).await
        }
        .await;
        match result {
            Ok(restored) => info!(
                "Restored from cloud: {} ({} memories)",
                restored.restored_from, restored.total_memories
            ),
            Err(e) => error!("Auto-download from cloud failed: {e}"),
        }
    }

    /// Restore metadata/config from a named local backup and rebuild vectors
    /// as needed.
    pub async fn restore_from_backup(&self, backup_name: &str) -> Result<RestoreResult> {
        let backup_path = self.snapshots.backup_path(backup_name)?;
        if !tokio::fs::try_exists(&backup_path).await.unwrap_or(false) {
            return Err(RecallError::not_found("backup", backup_name));
        }
        let meta_file = backup_path.join("metadata.json");
        if !tokio::fs::try_exists(&meta_file).await.unwrap_or(false) {
            return Err(RecallError::not_found(
                "backup metadata",
                format!("{backup_name} is incomplete"),
            ));
        }

        let _entities = self.entity_locks.acquire_many([ALL_ENTITIES]).await;
        let _write = self.write_lock.lock().await;

        self.backup("pre_restore").await?;

        tokio::fs::copy(&meta_file, &self.metadata_path).await?;
        let config_file = backup_path.join("config.json");
        if tokio::fs::try_exists(&config_file).await.unwrap_or(false) {
            tokio::fs::copy(&config_file, &self.config_path).await?;
        }

        let mut state = self.state.write().await;
        self.load_locked(&mut state, true).await?;

        Ok(RestoreResult {
            restored_from: backup_name.to_string(),
            total_memories: state.metadata.len(),
        })
    }

    /// Archive the legacy vector file and write the one-shot cutover marker.
    pub async fn finalize_legacy_cutover(&self) -> Result<bool> {
        let marker = self.migration_dir.join("faiss_to_qdrant.done");
        if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            return Ok(false);
        }
        if !tokio::fs::try_exists(&self.legacy_index_path)
            .await
            .unwrap_or(false)
        {
            return Ok(false);
        }

        let total_points = self.store.count().await?;
        let metadata_count = self.state.read().await.metadata.len();
        if total_points != metadata_count {
            warn!(
                "Skipping legacy index finalization: store={total_points} metadata={metadata_count}"
            );
            return Ok(false);
        }

        tokio::fs::create_dir_all(&self.migration_dir).await?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let archived_path = self
            .migration_dir
            .join(format!("index.faiss.legacy_{timestamp}"));
        tokio::fs::rename(&self.legacy_index_path, &archived_path).await?;

        let marker_payload = json!({
            "migration": "faiss_to_qdrant",
            "completed_at": Utc::now(),
            "metadata_count": metadata_count,
            "qdrant_count": total_points,
            "archived_index_path": archived_path.display().to_string(),
        });
        tokio::fs::write(&marker, serde_json::to_string_pretty(&marker_payload)?).await?;
        info!("Legacy vector file archived to {}", archived_path.display());
        Ok(true)
    }

    // -- CRUD --------------------------------------------------------------

    /// Add new memories. Returns the allocated ids, which may be empty when
    /// deduplication filtered every candidate.
    pub async fn add_memories(
        &self,
        texts: &[String],
        sources: &[String],
        metadata: Option<&[Option<Metadata>]>,
        deduplicate: bool,
        dedup_threshold: f64,
    ) -> Result<Vec<i64>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.len() != sources.len() {
            return Err(RecallError::invalid_argument(format!(
                "texts/sources length mismatch: {} vs {}",
                texts.len(),
                sources.len()
            )));
        }

        let keys: Vec<String> = sources.iter().map(|source| entity_key(source)).collect();
        let _entities = self.entity_locks.acquire_many(&keys).await;

        let mut texts: Vec<String> = texts.to_vec();
        let mut sources: Vec<String> = sources.to_vec();
        let mut metadata: Vec<Option<Metadata>> = match metadata {
            Some(items) => items.to_vec(),
            None => vec![None; texts.len()],
        };
        metadata.resize(texts.len(), None);

        if deduplicate && !self.state.read().await.metadata.is_empty() {
            let mut novel_texts = Vec::new();
            let mut novel_sources = Vec::new();
            let mut novel_metadata = Vec::new();
            for ((text, source), meta) in texts.iter().zip(&sources).zip(&metadata) {
                let (is_new, _) = self.is_novel(text, dedup_threshold).await?;
                if is_new {
                    novel_texts.push(text.clone());
                    novel_sources.push(source.clone());
                    novel_metadata.push(meta.clone());
                }
            }
            texts = novel_texts;
            sources = novel_sources;
            metadata = novel_metadata;
        }

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings = self.encode(&texts).await?;

        let _write = self.write_lock.lock().await;
        if texts.len() > SNAPSHOT_ADD_THRESHOLD {
            self.backup("pre_add").await?;
        }

        let mut state = self.state.write().await;
        let start_id = state.next_id;
        let now = Utc::now();

        let mut records = Vec::with_capacity(texts.len());
        let mut points = Vec::with_capacity(texts.len());
        let mut added_ids = Vec::with_capacity(texts.len());
        for (i, (text, source)) in texts.iter().zip(&sources).enumerate() {
            let id = start_id + i as i64;
            let record = MemoryRecord::build(id, text, source, now, metadata[i].clone());
            points.push(VectorPoint {
                id,
                vector: embeddings[i].clone(),
                payload: record.point_payload(),
            });
            records.push(record);
            added_ids.push(id);
        }

        // Store first: a vector-store failure leaves engine state unchanged.
        for batch in points.chunks(UPSERT_BATCH) {
            self.store.upsert(batch.to_vec()).await?;
        }

        state.metadata.extend(records);
        state.next_id = start_id + texts.len() as i64;
        state.rebuild_id_map();
        state.rebuild_bm25();
        self.mark_updated().await;
        self.save_state(&state).await?;

        debug!(count = added_ids.len(), "memories added");
        Ok(added_ids)
    }

    /// Delete a single memory by id.
    pub async fn delete_memory(&self, memory_id: i64) -> Result<DeleteResult> {
        let source = {
            let state = self.state.read().await;
            state
                .record(memory_id)
                .ok_or_else(|| RecallError::not_found("memory", memory_id))?
                .source
                .clone()
        };
        let _entities = self.entity_locks.acquire_many([entity_key(&source)]).await;
        let _write = self.write_lock.lock().await;

        // Re-check after lock acquisition; a concurrent delete may have won.
        let deleted = {
            let state = self.state.read().await;
            state
                .record(memory_id)
                .ok_or_else(|| RecallError::not_found("memory", memory_id))?
                .clone()
        };

        self.backup("pre_delete").await?;

        let mut state = self.state.write().await;
        self.delete_ids_targeted(&mut state, &HashSet::from([memory_id]))
            .await?;
        state.rebuild_bm25();
        self.mark_updated().await;
        self.save_state(&state).await?;

        Ok(DeleteResult {
            deleted_id: memory_id,
            deleted_text: truncate_chars(&deleted.text, 100),
        })
    }

    /// Delete multiple memories in one pass. Missing ids are reported, not
    /// errors.
    pub async fn delete_memories(&self, memory_ids: &[i64]) -> Result<DeleteBatchResult> {
        let mut unique_ids: Vec<i64> = memory_ids.to_vec();
        unique_ids.sort_unstable();
        unique_ids.dedup();
        if unique_ids.is_empty() {
            return Ok(DeleteBatchResult {
                deleted_count: 0,
                deleted_ids: Vec::new(),
                missing_ids: Vec::new(),
            });
        }

        let (existing, missing, keys) = {
            let state = self.state.read().await;
            let mut existing = Vec::new();
            let mut missing = Vec::new();
            let mut keys = Vec::new();
            for &id in &unique_ids {
                match state.record(id) {
                    Some(record) => {
                        existing.push(id);
                        keys.push(entity_key(&record.source));
                    }
                    None => missing.push(id),
                }
            }
            (existing, missing, keys)
        };
        if existing.is_empty() {
            return Ok(DeleteBatchResult {
                deleted_count: 0,
                deleted_ids: Vec::new(),
                missing_ids: missing,
            });
        }

        let _entities = self.entity_locks.acquire_many(&keys).await;
        let _write = self.write_lock.lock().await;

        let existing_now: Vec<i64> = {
            let state = self.state.read().await;
            existing.iter().copied().filter(|&id| state.exists(id)).collect()
        };
        if existing_now.is_empty() {
            return Ok(DeleteBatchResult {
                deleted_count: 0,
                deleted_ids: Vec::new(),
                missing_ids: missing,
            });
        }

        self.backup("pre_delete_batch").await?;

        let mut state = self.state.write().await;
        self.delete_ids_targeted(&mut state, &existing_now.iter().copied().collect())
            .await?;
        state.rebuild_bm25();
        self.mark_updated().await;
        self.save_state(&state).await?;

        Ok(DeleteBatchResult {
            deleted_count: existing.len(),
            deleted_ids: existing,
            missing_ids: missing,
        })
    }

    /// Delete all memories whose source contains the pattern.
    pub async fn delete_by_source(&self, source_pattern: &str) -> Result<usize> {
        self.delete_matching("pre_delete_source", |record| {
            record.source.contains(source_pattern)
        })
        .await
    }

    /// Delete all memories whose source starts with the prefix.
    pub async fn delete_by_prefix(&self, source_prefix: &str) -> Result<usize> {
        self.delete_matching("pre_delete_prefix", |record| {
            record.source.starts_with(source_prefix)
        })
        .await
    }

    async fn delete_matching(
        &self,
        snapshot_prefix: &str,
        predicate: impl Fn(&MemoryRecord) -> bool,
    ) -> Result<usize> {
        let _entities = self.entity_locks.acquire_many([ALL_ENTITIES]).await;
        let _write = self.write_lock.lock().await;

        let ids_to_remove: HashSet<i64> = {
            let state = self.state.read().await;
            state
                .metadata
                .iter()
                .filter(|record| predicate(record))
                .map(|record| record.id)
                .collect()
        };
        if ids_to_remove.is_empty() {
            return Ok(0);
        }

        self.backup(snapshot_prefix).await?;

        let mut state = self.state.write().await;
        self.delete_ids_targeted(&mut state, &ids_to_remove).await?;
        state.rebuild_bm25();
        self.mark_updated().await;
        self.save_state(&state).await?;

        Ok(ids_to_remove.len())
    }

    /// Fetch a single memory by id.
    pub async fn get_memory(&self, memory_id: i64) -> Result<MemoryRecord> {
        let state = self.state.read().await;
        state
            .record(memory_id)
            .cloned()
            .ok_or_else(|| RecallError::not_found("memory", memory_id))
    }

    /// Fetch multiple memories; unknown ids are returned separately.
    pub async fn get_memories(&self, memory_ids: &[i64]) -> (Vec<MemoryRecord>, Vec<i64>) {
        let state = self.state.read().await;
        let mut memories = Vec::new();
        let mut missing = Vec::new();
        for &id in memory_ids {
            match state.record(id) {
                Some(record) => memories.push(record.clone()),
                None => missing.push(id),
            }
        }
        (memories, missing)
    }

    /// Update fields on an existing memory without changing its id.
    ///
    /// A source-only change takes the fast path: no snapshot, no re-embed,
    /// just a payload rewrite and an `updated_at` bump.
    pub async fn update_memory(
        &self,
        memory_id: i64,
        text: Option<&str>,
        source: Option<&str>,
        metadata_patch: Option<Metadata>,
    ) -> Result<UpdateResult> {
        let current = self.get_memory(memory_id).await?;
        let old_key = entity_key(&current.source);
        let new_key = entity_key(source.unwrap_or(&current.source));

        let patch_empty = metadata_patch.as_ref().is_none_or(BTreeMap::is_empty);
        let source_only = source.is_some()
            && text.is_none()
            && patch_empty
            && source != Some(current.source.as_str());

        let _entities = self.entity_locks.acquire_many([old_key, new_key]).await;
        let _write = self.write_lock.lock().await;

        let mut record = {
            let state = self.state.read().await;
            state
                .record(memory_id)
                .ok_or_else(|| RecallError::not_found("memory", memory_id))?
                .clone()
        };

        if source_only {
            record.source = source.unwrap_or(&current.source).to_string();
            record.updated_at = Utc::now();
            // created_at and timestamp stay untouched
            self.store
                .set_payload(memory_id, record.point_payload())
                .await?;
            let mut state = self.state.write().await;
            if let Some(stored) = state.record_mut(memory_id) {
                *stored = record;
            }
            self.mark_updated().await;
            self.save_state(&state).await?;
            return Ok(UpdateResult {
                id: memory_id,
                updated_fields: vec!["source".to_string()],
            });
        }

        self.backup("pre_update").await?;

        let mut updated_fields = Vec::new();
        if let Some(text) = text {
            if text != record.text {
                record.text = text.to_string();
                updated_fields.push("text".to_string());
            }
        }
        if let Some(source) = source {
            if source != record.source {
                record.source = source.to_string();
                updated_fields.push("source".to_string());
            }
        }
        if let Some(patch) = metadata_patch {
            if !patch.is_empty() {
                record.apply_user_metadata(patch, false);
                updated_fields.push("metadata".to_string());
            }
        }
        record.updated_at = Utc::now();

        let embedding = self
            .encode(std::slice::from_ref(&record.text))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RecallError::embedding("empty embedding batch"))?;
        self.store
            .upsert(vec![VectorPoint {
                id: memory_id,
                vector: embedding,
                payload: record.point_payload(),
            }])
            .await?;

        let text_changed = updated_fields.iter().any(|field| field == "text");
        let mut state = self.state.write().await;
        if let Some(stored) = state.record_mut(memory_id) {
            *stored = record;
        }
        if text_changed {
            state.rebuild_bm25();
        }
        self.mark_updated().await;
        self.save_state(&state).await?;

        Ok(UpdateResult {
            id: memory_id,
            updated_fields,
        })
    }

    /// Upsert a memory by stable entity key + source.
    pub async fn upsert_memory(
        &self,
        text: &str,
        source: &str,
        key: &str,
        metadata: Option<Metadata>,
    ) -> Result<UpsertOutcome> {
        let mut metadata = metadata.unwrap_or_default();
        metadata.insert("entity_key".to_string(), json!(key));

        let existing_id = {
            let state = self.state.read().await;
            state
                .metadata
                .iter()
                .find(|record| {
                    record.source == source && record.entity_key.as_deref() == Some(key)
                })
                .map(|record| record.id)
        };

        match existing_id {
            None => {
                let ids = self
                    .add_memories(
                        &[text.to_string()],
                        &[source.to_string()],
                        Some(&[Some(metadata)]),
                        false,
                        DEFAULT_DEDUP_THRESHOLD,
                    )
                    .await?;
                let id = ids
                    .first()
                    .copied()
                    .ok_or_else(|| RecallError::internal("upsert add produced no id"))?;
                Ok(UpsertOutcome {
                    id,
                    action: "created".to_string(),
                })
            }
            Some(id) => {
                let result = self
                    .update_memory(id, Some(text), Some(source), Some(metadata))
                    .await?;
                Ok(UpsertOutcome {
                    id: result.id,
                    action: "updated".to_string(),
                })
            }
        }
    }

    /// Upsert multiple memories; per-entry failures are counted, not fatal.
    pub async fn upsert_memories(&self, entries: Vec<UpsertEntry>) -> UpsertBatchResult {
        let mut created = 0;
        let mut updated = 0;
        let mut errors = 0;
        let mut results = Vec::new();
        for entry in entries {
            match self
                .upsert_memory(&entry.text, &entry.source, &entry.key, entry.metadata)
                .await
            {
                Ok(outcome) => {
                    if outcome.action == "created" {
                        created += 1;
                    } else {
                        updated += 1;
                    }
                    results.push(outcome);
                }
                Err(e) => {
                    warn!("upsert entry failed: {e}");
                    errors += 1;
                }
            }
        }
        UpsertBatchResult {
            created,
            updated,
            errors,
            results,
        }
    }

    /// Replace a memory with an updated version, preserving the audit trail.
    /// The new id is strictly greater than any existing id.
    pub async fn supersede(
        &self,
        old_id: i64,
        new_text: &str,
        source: &str,
    ) -> Result<SupersedeResult> {
        let previous_text = self.get_memory(old_id).await?.text;

        self.delete_memory(old_id).await?;

        let added = self
            .add_memories(
                &[new_text.to_string()],
                &[source.to_string()],
                None,
                false,
                DEFAULT_DEDUP_THRESHOLD,
            )
            .await?;
        let new_id = added.first().copied();

        if let Some(new_id) = new_id {
            let _write = self.write_lock.lock().await;
            let mut state = self.state.write().await;
            if let Some(record) = state.record_mut(new_id) {
                record.supersedes = Some(old_id);
                record.previous_text = Some(previous_text.clone());
            }
            self.save_state(&state).await?;
        }

        info!("Superseded memory {old_id} -> {new_id:?}");
        Ok(SupersedeResult {
            old_id,
            new_id,
            previous_text,
        })
    }

    // -- Search ------------------------------------------------------------

    /// Vector-only search.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        threshold: Option<f64>,
        source_prefix: Option<&str>,
    ) -> Result<Vec<SearchMatch>> {
        let total = self.state.read().await.metadata.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let k = k.min(total).min(SEARCH_K_CAP);

        let query_vec = self
            .encode(std::slice::from_ref(&query.to_string()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RecallError::embedding("empty embedding batch"))?;

        let hits = self.store.search(&query_vec, k, threshold).await?;

        let state = self.state.read().await;
        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(record) = state.record(hit.id) else {
                continue;
            };
            if let Some(prefix) = source_prefix {
                if !record.source.starts_with(prefix) {
                    continue;
                }
            }
            let similarity = hit.score as f64;
            if let Some(threshold) = threshold {
                if similarity < threshold {
                    continue;
                }
            }
            results.push(SearchMatch {
                record: record.clone(),
                similarity: Some(round6(similarity)),
                rrf_score: None,
            });
        }
        Ok(results)
    }

    /// Hybrid BM25 + vector search fused with reciprocal rank fusion.
    pub async fn hybrid_search(
        &self,
        query: &str,
        k: usize,
        threshold: Option<f64>,
        vector_weight: f64,
        source_prefix: Option<&str>,
    ) -> Result<Vec<SearchMatch>> {
        let total = self.state.read().await.metadata.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let k = k.min(total).min(SEARCH_K_CAP);
        let oversample = (k * 3).min(total);

        let vector_results = self
            .search(query, oversample, threshold, source_prefix)
            .await?;

        let state = self.state.read().await;
        let mut bm25_ranked: Vec<(usize, f64)> = Vec::new();
        if let Some(bm25) = &state.bm25 {
            let scores = bm25.scores(&tokenize(query));
            let mut candidates: Vec<(usize, f64)> = scores
                .into_iter()
                .enumerate()
                .filter(|&(position, _)| {
                    let Some(prefix) = source_prefix else {
                        return true;
                    };
                    state
                        .bm25_pos_to_id
                        .get(position)
                        .and_then(|&id| state.record(id))
                        .is_some_and(|record| record.source.starts_with(prefix))
                })
                .collect();
            candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
            candidates.truncate(oversample);
            bm25_ranked = candidates;
        }

        let mut rrf_scores: HashMap<i64, f64> = HashMap::new();
        for (rank, result) in vector_results.iter().enumerate() {
            *rrf_scores.entry(result.record.id).or_insert(0.0) +=
                vector_weight / (rank as f64 + RRF_K);
        }
        let bm25_weight = 1.0 - vector_weight;
        for (rank, &(position, score)) in bm25_ranked.iter().enumerate() {
            if score > 0.0 {
                if let Some(&id) = state.bm25_pos_to_id.get(position) {
                    *rrf_scores.entry(id).or_insert(0.0) += bm25_weight / (rank as f64 + RRF_K);
                }
            }
        }

        let mut ranked: Vec<(i64, f64)> = rrf_scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(k);

        let mut results = Vec::with_capacity(ranked.len());
        for (id, rrf_score) in ranked {
            let Some(record) = state.record(id) else {
                continue;
            };
            if let Some(threshold) = threshold {
                let vector_match = vector_results
                    .iter()
                    .find(|result| result.record.id == id)
                    .and_then(|result| result.similarity);
                if let Some(similarity) = vector_match {
                    if similarity < threshold {
                        continue;
                    }
                }
            }
            results.push(SearchMatch {
                record: record.clone(),
                similarity: None,
                rrf_score: Some(round6(rrf_score)),
            });
        }
        Ok(results)
    }

    /// Novelty check: novel iff the closest memory scores under threshold.
    pub async fn is_novel(
        &self,
        text: &str,
        threshold: f64,
    ) -> Result<(bool, Option<SearchMatch>)> {
        let results = self.search(text, 1, None, None).await?;
        match results.into_iter().next() {
            None => Ok((true, None)),
            Some(top) => {
                let novel = top.similarity.unwrap_or(0.0) < threshold;
                Ok((novel, Some(top)))
            }
        }
    }

    // -- Deduplication -----------------------------------------------------

    /// Find near-duplicate pairs across all memory texts.
    pub async fn find_duplicates(&self, threshold: f64) -> Result<Vec<DuplicatePair>> {
        let (ids, texts) = {
            let state = self.state.read().await;
            let ids: Vec<i64> = state.metadata.iter().map(|record| record.id).collect();
            let texts: Vec<String> = state
                .metadata
                .iter()
                .map(|record| record.text.clone())
                .collect();
            (ids, texts)
        };
        if texts.len() < 2 {
            return Ok(Vec::new());
        }

        let embeddings = self.encode(&texts).await?;
        let n = embeddings.len();
        let neighbor_count = 5.min(n);

        let dot = |a: &[f32], b: &[f32]| -> f64 {
            a.iter().zip(b).map(|(x, y)| (x * y) as f64).sum()
        };

        let mut seen: HashSet<(i64, i64)> = HashSet::new();
        let mut duplicates = Vec::new();
        for i in 0..n {
            let mut row: Vec<(usize, f64)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (j, dot(&embeddings[i], &embeddings[j])))
                .collect();
            row.sort_by(|a, b| b.1.total_cmp(&a.1));
            for &(j, similarity) in row.iter().take(neighbor_count) {
                if similarity < threshold {
                    continue;
                }
                let pair = (ids[i].min(ids[j]), ids[i].max(ids[j]));
                if !seen.insert(pair) {
                    continue;
                }
                let (text_a, text_b) = {
                    let (a, b) = if ids[i] <= ids[j] {
                        (&texts[i], &texts[j])
                    } else {
                        (&texts[j], &texts[i])
                    };
                    (truncate_chars(a, 120), truncate_chars(b, 120))
                };
                duplicates.push(DuplicatePair {
                    id_a: pair.0,
                    id_b: pair.1,
                    similarity: (similarity * 10_000.0).round() / 10_000.0,
                    text_a,
                    text_b,
                });
            }
        }
        duplicates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        Ok(duplicates)
    }

    /// Remove near-duplicates, keeping the earliest (lowest-id) entry of each
    /// matched pair. Intersecting pair chains keep the lowest id of every
    /// pair, so a later duplicate can survive when its partner was already
    /// the keeper of another pair.
    pub async fn deduplicate(&self, threshold: f64, dry_run: bool) -> Result<DeduplicateReport> {
        let pairs = self.find_duplicates(threshold).await?;
        if pairs.is_empty() {
            return Ok(DeduplicateReport {
                duplicate_pairs: 0,
                dry_run,
                would_remove: None,
                removed: Some(0),
                remaining: None,
                pairs: None,
            });
        }

        let ids_to_remove: HashSet<i64> =
            pairs.iter().map(|pair| pair.id_a.max(pair.id_b)).collect();

        if dry_run {
            return Ok(DeduplicateReport {
                duplicate_pairs: pairs.len(),
                dry_run: true,
                would_remove: Some(ids_to_remove.len()),
                removed: None,
                remaining: None,
                pairs: Some(pairs.into_iter().take(20).collect()),
            });
        }

        let _entities = self.entity_locks.acquire_many([ALL_ENTITIES]).await;
        let _write = self.write_lock.lock().await;

        self.backup("pre_dedup").await?;

        let mut state = self.state.write().await;
        self.delete_ids_targeted(&mut state, &ids_to_remove).await?;
        state.rebuild_bm25();
        self.mark_updated().await;
        self.save_state(&state).await?;

        Ok(DeduplicateReport {
            duplicate_pairs: pairs.len(),
            dry_run: false,
            would_remove: None,
            removed: Some(ids_to_remove.len()),
            remaining: Some(state.metadata.len()),
            pairs: None,
        })
    }

    // -- Rebuild -----------------------------------------------------------

    /// Rebuild the whole index from markdown files. Ids restart at zero;
    /// callers relying on monotonic ids across a rebuild must snapshot first
    /// (the operation itself takes `pre_rebuild`).
    pub async fn rebuild_from_files(&self, file_paths: &[PathBuf]) -> Result<RebuildReport> {
        let _entities = self.entity_locks.acquire_many([ALL_ENTITIES]).await;
        let _write = self.write_lock.lock().await;

        let backup_path = self.backup("pre_rebuild").await?;

        let mut texts: Vec<String> = Vec::new();
        let mut sources: Vec<String> = Vec::new();
        let mut files_processed = 0usize;
        for path in file_paths {
            let content = match tokio::fs::read_to_string(path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    error!("Error reading {}: {e}", path.display());
                    continue;
                }
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            for (chunk_text, chunk_source) in chunk_markdown(
                &content,
                &name,
                chunker::MAX_CHUNK_SIZE,
                chunker::OVERLAP_SIZE,
            ) {
                texts.push(chunk_text);
                sources.push(chunk_source);
            }
            files_processed += 1;
        }

        let mut state = self.state.write().await;
        state.metadata.clear();
        state.next_id = 0; // rebuilds restart the id space

        if texts.is_empty() {
            self.store.recreate_collection(self.dim).await?;
        } else {
            let embeddings = self.encode(&texts).await?;
            self.store.recreate_collection(self.dim).await?;

            let now = Utc::now();
            let mut points = Vec::with_capacity(texts.len());
            for (i, (text, source)) in texts.iter().zip(&sources).enumerate() {
                let record = MemoryRecord::build(i as i64, text, source, now, None);
                points.push(VectorPoint {
                    id: i as i64,
                    vector: embeddings[i].clone(),
                    payload: record.point_payload(),
                });
                state.metadata.push(record);
            }
            for batch in points.chunks(UPSERT_BATCH) {
                self.store.upsert(batch.to_vec()).await?;
            }
        }

        state.rebuild_id_map();
        state.rebuild_bm25();
        self.mark_updated().await;
        self.save_state(&state).await?;

        Ok(RebuildReport {
            files_processed,
            memories_added: texts.len(),
            backup_location: backup_path.display().to_string(),
        })
    }

    // -- Browse / stats ----------------------------------------------------

    pub async fn count_memories(&self, source_prefix: Option<&str>) -> usize {
        let state = self.state.read().await;
        match source_prefix {
            None => state.metadata.len(),
            Some(prefix) => state
                .metadata
                .iter()
                .filter(|record| record.source.starts_with(prefix))
                .count(),
        }
    }

    pub async fn list_memories(
        &self,
        offset: usize,
        limit: usize,
        source_filter: Option<&str>,
    ) -> MemoryPage {
        let state = self.state.read().await;
        let filtered: Vec<&MemoryRecord> = state
            .metadata
            .iter()
            .filter(|record| {
                source_filter.is_none_or(|prefix| record.source.starts_with(prefix))
            })
            .collect();
        let total = filtered.len();
        let memories = filtered
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        MemoryPage {
            memories,
            total,
            offset,
            limit,
        }
    }

    /// Unique first path segments of sources, with counts.
    pub async fn list_folders(&self) -> (Vec<FolderInfo>, usize) {
        let state = self.state.read().await;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in &state.metadata {
            let folder = match record.source.split_once('/') {
                Some((head, _)) => head.to_string(),
                None if record.source.is_empty() => "(ungrouped)".to_string(),
                None => record.source.clone(),
            };
            *counts.entry(folder).or_insert(0) += 1;
        }
        let folders = counts
            .into_iter()
            .map(|(name, count)| FolderInfo { name, count })
            .collect();
        (folders, state.metadata.len())
    }

    /// Ids plus rewritten sources for a folder rename.
    pub async fn folder_rename_targets(
        &self,
        old_prefix: &str,
        new_prefix: &str,
    ) -> Vec<(i64, String)> {
        let state = self.state.read().await;
        state
            .metadata
            .iter()
            .filter(|record| {
                record.source == old_prefix
                    || record.source.starts_with(&format!("{old_prefix}/"))
            })
            .map(|record| {
                (
                    record.id,
                    format!("{new_prefix}{}", &record.source[old_prefix.len()..]),
                )
            })
            .collect()
    }

    pub async fn stats(&self) -> EngineStats {
        let total_memories = self.state.read().await.metadata.len();
        let config = self.config.read().await.clone();
        let index_size_bytes = dir_size(&self.vector_data_dir).await;
        let backup_count = self.snapshots.list().await.map(|b| b.len()).unwrap_or(0);
        EngineStats {
            total_memories,
            dimension: self.dim,
            model: config.model,
            created_at: config.created_at,
            last_updated: config.last_updated,
            index_size_bytes,
            backup_count,
        }
    }

    /// Cheap stats for health checks (no filesystem I/O).
    pub async fn stats_light(&self) -> StatsLight {
        let total_memories = self.state.read().await.metadata.len();
        let model = self.config.read().await.model.clone();
        StatsLight {
            total_memories,
            dimension: self.dim,
            model,
        }
    }

    /// Readiness probe: ready iff the store and metadata agree on count.
    pub async fn is_ready(&self) -> ReadyStatus {
        let metadata_count = self.state.read().await.metadata.len();
        match self.store.count().await {
            Ok(store_count) => {
                let ready = store_count == metadata_count;
                ReadyStatus {
                    ready,
                    status: if ready { "ready" } else { "degraded" }.to_string(),
                    qdrant_count: Some(store_count),
                    metadata_count: Some(metadata_count),
                    error: None,
                }
            }
            Err(e) => ReadyStatus {
                ready: false,
                status: "error".to_string(),
                qdrant_count: None,
                metadata_count: None,
                error: Some(e.to_string()),
            },
        }
    }

    // -- Embedder lifecycle ------------------------------------------------

    /// Recreate the embedder runtime and release the old inference objects.
    /// Rejects dimension changes; vectors in the store would be unreadable.
    pub async fn reload_embedder(&self) -> Result<ReloadReport> {
        let old = {
            let _entities = self.entity_locks.acquire_many([ALL_ENTITIES]).await;
            let _write = self.write_lock.lock().await;
            let mut slot = self.embedder.lock().await;

            let factory = self.embedder_factory.clone();
            let new_embedder = tokio::task::spawn_blocking(move || factory())
                .await
                .map_err(|e| RecallError::internal(format!("embedder reload join: {e}")))??;

            if new_embedder.dimension() != self.dim {
                let new_dim = new_embedder.dimension();
                new_embedder.close();
                return Err(RecallError::invalid_argument(format!(
                    "Embedder dimension mismatch: current={} new={new_dim}",
                    self.dim
                )));
            }

            let (provider, model) = provider_and_model(new_embedder.name());
            let old = std::mem::replace(&mut *slot, new_embedder);
            {
                let mut config = self.config.write().await;
                config.model = model;
                config.embed_provider = provider;
                config.dimension = self.dim;
                config.touch();
            }
            let state = self.state.read().await;
            self.save_state(&state).await?;
            old
        };

        // Close the old runtime outside every lock.
        old.close();
        drop(old);

        let model = self.config.read().await.model.clone();
        info!(model = %model, "embedder reloaded");
        Ok(ReloadReport {
            reloaded: true,
            model,
            dimension: self.dim,
        })
    }
}

/// Recursive directory size, best effort.
async fn dir_size(root: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if let Ok(metadata) = entry.metadata().await {
                total += metadata.len();
            }
        }
    }
    total
}
