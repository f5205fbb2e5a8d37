//! Memory CRUD endpoints.

use super::{ApiResult, bad_request};
use crate::state::AppState;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use recall_core::Metadata;
use recall_engine::UpsertEntry;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/memory/add", post(add_memory))
        .route("/memory/add-batch", post(add_batch))
        .route("/memory/upsert", post(upsert_memory))
        .route("/memory/upsert-batch", post(upsert_batch))
        .route("/memory/is-novel", post(is_novel))
        .route("/memory/get-batch", post(get_batch))
        .route("/memory/delete-batch", post(delete_batch))
        .route("/memory/delete-by-source", post(delete_by_source))
        .route("/memory/delete-by-prefix", post(delete_by_prefix))
        .route("/memory/deduplicate", post(deduplicate))
        .route("/memory/supersede", post(supersede))
        .route(
            "/memory/{id}",
            get(get_memory).patch(patch_memory).delete(delete_memory),
        )
        .route("/memories", get(list_memories))
        .route("/folders", get(list_folders))
        .route("/folders/rename", post(rename_folder))
}

#[derive(Debug, Deserialize)]
struct AddMemoryRequest {
    text: String,
    source: String,
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    deduplicate: bool,
}

fn validate_text_source(text: &str, source: &str) -> ApiResult<()> {
    if text.is_empty() || text.len() > 50_000 {
        return Err(bad_request("text must be 1..=50000 characters"));
    }
    if source.is_empty() || source.len() > 500 {
        return Err(bad_request("source must be 1..=500 characters"));
    }
    Ok(())
}

/// Add a new memory.
async fn add_memory(
    State(state): State<AppState>,
    Json(request): Json<AddMemoryRequest>,
) -> ApiResult<Json<Value>> {
    validate_text_source(&request.text, &request.source)?;
    info!(source = %request.source, len = request.text.len(), "Add memory");
    let ids = state
        .engine
        .add_memories(
            &[request.text],
            &[request.source],
            Some(&[request.metadata]),
            request.deduplicate,
            recall_engine::DEFAULT_DEDUP_THRESHOLD,
        )
        .await?;
    let added = ids.first().copied();
    Ok(Json(json!({
        "success": true,
        "id": added,
        "message": if added.is_some() { "Memory added successfully" } else { "Duplicate skipped" },
    })))
}

#[derive(Debug, Deserialize)]
struct AddBatchRequest {
    memories: Vec<AddMemoryRequest>,
    #[serde(default)]
    deduplicate: bool,
}

/// Add multiple memories at once.
async fn add_batch(
    State(state): State<AppState>,
    Json(request): Json<AddBatchRequest>,
) -> ApiResult<Json<Value>> {
    if request.memories.is_empty() || request.memories.len() > 500 {
        return Err(bad_request("memories must contain 1..=500 entries"));
    }
    for memory in &request.memories {
        validate_text_source(&memory.text, &memory.source)?;
    }
    info!(count = request.memories.len(), "Add batch");

    let texts: Vec<String> = request.memories.iter().map(|m| m.text.clone()).collect();
    let sources: Vec<String> = request.memories.iter().map(|m| m.source.clone()).collect();
    let metadata: Vec<Option<Metadata>> =
        request.memories.iter().map(|m| m.metadata.clone()).collect();

    let ids = state
        .engine
        .add_memories(
            &texts,
            &sources,
            Some(&metadata),
            request.deduplicate,
            recall_engine::DEFAULT_DEDUP_THRESHOLD,
        )
        .await?;
    let count = ids.len();
    Ok(Json(json!({
        "success": true,
        "ids": ids,
        "count": count,
        "message": format!("Added {count} memories"),
    })))
}

/// Fetch a single memory by id.
async fn get_memory(
    State(state): State<AppState>,
    Path(memory_id): Path<i64>,
) -> ApiResult<Json<recall_core::MemoryRecord>> {
    Ok(Json(state.engine.get_memory(memory_id).await?))
}

#[derive(Debug, Deserialize)]
struct IdsRequest {
    ids: Vec<i64>,
}

/// Fetch multiple memories by ids.
async fn get_batch(
    State(state): State<AppState>,
    Json(request): Json<IdsRequest>,
) -> ApiResult<Json<Value>> {
    if request.ids.is_empty() || request.ids.len() > 1000 {
        return Err(bad_request("ids must contain 1..=1000 entries"));
    }
    let (memories, missing_ids) = state.engine.get_memories(&request.ids).await;
    let count = memories.len();
    Ok(Json(json!({
        "memories": memories,
        "missing_ids": missing_ids,
        "count": count,
    })))
}

#[derive(Debug, Deserialize)]
struct PatchMemoryRequest {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    metadata_patch: Option<Metadata>,
}

/// Patch selected fields on an existing memory.
async fn patch_memory(
    State(state): State<AppState>,
    Path(memory_id): Path<i64>,
    Json(request): Json<PatchMemoryRequest>,
) -> ApiResult<Json<recall_engine::UpdateResult>> {
    let patch_empty = request
        .metadata_patch
        .as_ref()
        .is_none_or(|patch| patch.is_empty());
    if request.text.is_none() && request.source.is_none() && patch_empty {
        return Err(bad_request("At least one field must be provided"));
    }
    let result = state
        .engine
        .update_memory(
            memory_id,
            request.text.as_deref(),
            request.source.as_deref(),
            request.metadata_patch,
        )
        .await?;
    Ok(Json(result))
}

/// Delete a single memory by id.
async fn delete_memory(
    State(state): State<AppState>,
    Path(memory_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    info!(id = memory_id, "Delete memory");
    let result = state.engine.delete_memory(memory_id).await?;
    Ok(Json(json!({
        "success": true,
        "deleted_id": result.deleted_id,
        "deleted_text": result.deleted_text,
    })))
}

/// Delete multiple memories in one operation.
async fn delete_batch(
    State(state): State<AppState>,
    Json(request): Json<IdsRequest>,
) -> ApiResult<Json<Value>> {
    if request.ids.is_empty() || request.ids.len() > 1000 {
        return Err(bad_request("ids must contain 1..=1000 entries"));
    }
    info!(count = request.ids.len(), "Delete batch");
    let result = state.engine.delete_memories(&request.ids).await?;
    Ok(Json(json!({
        "success": true,
        "deleted_count": result.deleted_count,
        "deleted_ids": result.deleted_ids,
        "missing_ids": result.missing_ids,
    })))
}

#[derive(Debug, Deserialize)]
struct DeleteBySourceRequest {
    source_pattern: String,
}

/// Delete all memories matching a source pattern.
async fn delete_by_source(
    State(state): State<AppState>,
    Json(request): Json<DeleteBySourceRequest>,
) -> ApiResult<Json<Value>> {
    if request.source_pattern.is_empty() || request.source_pattern.len() > 500 {
        return Err(bad_request("source_pattern must be 1..=500 characters"));
    }
    info!(pattern = %request.source_pattern, "Delete by source");
    let deleted_count = state.engine.delete_by_source(&request.source_pattern).await?;
    Ok(Json(json!({ "success": true, "deleted_count": deleted_count })))
}

#[derive(Debug, Deserialize)]
struct DeleteByPrefixRequest {
    source_prefix: String,
}

/// Delete all memories whose source starts with a prefix.
async fn delete_by_prefix(
    State(state): State<AppState>,
    Json(request): Json<DeleteByPrefixRequest>,
) -> ApiResult<Json<Value>> {
    if request.source_prefix.is_empty() || request.source_prefix.len() > 500 {
        return Err(bad_request("source_prefix must be 1..=500 characters"));
    }
    info!(prefix = %request.source_prefix, "Delete by prefix");
    let deleted_count = state.engine.delete_by_prefix(&request.source_prefix).await?;
    Ok(Json(json!({ "success": true, "deleted_count": deleted_count })))
}

#[derive(Debug, Deserialize)]
struct UpsertMemoryRequest {
    text: String,
    source: String,
    key: String,
    #[serde(default)]
    metadata: Option<Metadata>,
}

/// Upsert a memory by stable key + source.
async fn upsert_memory(
    State(state): State<AppState>,
    Json(request): Json<UpsertMemoryRequest>,
) -> ApiResult<Json<Value>> {
    validate_text_source(&request.text, &request.source)?;
    if request.key.is_empty() || request.key.len() > 500 {
        return Err(bad_request("key must be 1..=500 characters"));
    }
    let outcome = state
        .engine
        .upsert_memory(&request.text, &request.source, &request.key, request.metadata)
        .await?;
    Ok(Json(json!({
        "success": true,
        "id": outcome.id,
        "action": outcome.action,
    })))
}

#[derive(Debug, Deserialize)]
struct UpsertBatchRequest {
    memories: Vec<UpsertMemoryRequest>,
}

/// Bulk upsert memories by stable keys.
async fn upsert_batch(
    State(state): State<AppState>,
    Json(request): Json<UpsertBatchRequest>,
) -> ApiResult<Json<Value>> {
    if request.memories.is_empty() || request.memories.len() > 1000 {
        return Err(bad_request("memories must contain 1..=1000 entries"));
    }
    let entries: Vec<UpsertEntry> = request
        .memories
        .into_iter()
        .map(|item| UpsertEntry {
            text: item.text,
            source: item.source,
            key: item.key,
            metadata: item.metadata,
        })
        .collect();
    let result = state.engine.upsert_memories(entries).await;
    Ok(Json(json!({
        "success": true,
        "created": result.created,
        "updated": result.updated,
        "errors": result.errors,
        "results": result.results,
    })))
}

#[derive(Debug, Deserialize)]
struct IsNovelRequest {
    text: String,
    #[serde(default = "default_novelty_threshold")]
    threshold: f64,
}

fn default_novelty_threshold() -> f64 {
    recall_engine::DEFAULT_NOVELTY_THRESHOLD
}

/// Check if text is novel (not too similar to existing memories).
async fn is_novel(
    State(state): State<AppState>,
    Json(request): Json<IsNovelRequest>,
) -> ApiResult<Json<Value>> {
    if request.text.is_empty() || request.text.len() > 50_000 {
        return Err(bad_request("text must be 1..=50000 characters"));
    }
    if !(0.0..=1.0).contains(&request.threshold) {
        return Err(bad_request("threshold must be within [0, 1]"));
    }
    let (is_novel, most_similar) = state
        .engine
        .is_novel(&request.text, request.threshold)
        .await?;
    Ok(Json(json!({
        "is_novel": is_novel,
        "threshold": request.threshold,
        "most_similar": most_similar,
    })))
}

#[derive(Debug, Deserialize)]
struct SupersedeRequest {
    old_id: i64,
    new_text: String,
    #[serde(default)]
    source: String,
}

/// Replace a memory with an updated version (audit trail preserved).
async fn supersede(
    State(state): State<AppState>,
    Json(request): Json<SupersedeRequest>,
) -> ApiResult<Json<Value>> {
    info!(old_id = request.old_id, source = %request.source, "Supersede");
    let result = state
        .engine
        .supersede(request.old_id, &request.new_text, &request.source)
        .await?;
    Ok(Json(json!({
        "success": true,
        "old_id": result.old_id,
        "new_id": result.new_id,
        "previous_text": result.previous_text,
    })))
}

#[derive(Debug, Deserialize)]
struct DeduplicateRequest {
    #[serde(default = "default_dedup_threshold")]
    threshold: f64,
    #[serde(default = "default_true")]
    dry_run: bool,
}

fn default_dedup_threshold() -> f64 {
    recall_engine::DEFAULT_DEDUP_THRESHOLD
}

fn default_true() -> bool {
    true
}

/// Find and optionally remove near-duplicate memories.
async fn deduplicate(
    State(state): State<AppState>,
    Json(request): Json<DeduplicateRequest>,
) -> ApiResult<Json<recall_engine::DeduplicateReport>> {
    if !(0.5..=1.0).contains(&request.threshold) {
        return Err(bad_request("threshold must be within [0.5, 1]"));
    }
    info!(
        threshold = request.threshold,
        dry_run = request.dry_run,
        "Deduplicate"
    );
    let report = state
        .engine
        .deduplicate(request.threshold, request.dry_run)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    source: Option<String>,
}

fn default_limit() -> usize {
    20
}

/// List memories with pagination and optional source filter.
async fn list_memories(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<recall_engine::MemoryPage>> {
    if query.limit == 0 || query.limit > 100 {
        return Err(bad_request("limit must be 1..=100"));
    }
    Ok(Json(
        state
            .engine
            .list_memories(query.offset, query.limit, query.source.as_deref())
            .await,
    ))
}

/// List unique source-based folders with memory counts.
async fn list_folders(State(state): State<AppState>) -> Json<Value> {
    let (folders, total) = state.engine.list_folders().await;
    Json(json!({ "folders": folders, "total": total }))
}

#[derive(Debug, Deserialize)]
struct RenameFolderRequest {
    old_name: String,
    new_name: String,
}

/// Batch-rename a folder by updating the source prefix on all matching
/// memories (source-only updates take the engine's fast path).
async fn rename_folder(
    State(state): State<AppState>,
    Json(request): Json<RenameFolderRequest>,
) -> ApiResult<Json<Value>> {
    if request.old_name.is_empty() || request.new_name.is_empty() {
        return Err(bad_request("old_name and new_name are required"));
    }
    let targets = state
        .engine
        .folder_rename_targets(&request.old_name, &request.new_name)
        .await;
    if targets.is_empty() {
        return Err(recall_core::RecallError::not_found(
            "folder",
            &request.old_name,
        )
        .into());
    }

    let mut updated = 0usize;
    let mut errors = 0usize;
    for (memory_id, new_source) in targets {
        match state
            .engine
            .update_memory(memory_id, None, Some(&new_source), None)
            .await
        {
            Ok(_) => updated += 1,
            Err(e) => {
                tracing::warn!("Folder rename skip id={memory_id}: {e}");
                errors += 1;
            }
        }
    }
    Ok(Json(json!({
        "success": true,
        "updated": updated,
        "errors": errors,
        "old_name": request.old_name,
        "new_name": request.new_name,
    })))
}
