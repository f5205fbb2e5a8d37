//! Stats, metrics, index rebuild, backups, cloud sync, and maintenance.

use super::{ApiResult, bad_request};
use crate::state::AppState;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use chrono::Utc;
use recall_core::RecallError;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Component, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .route("/index/build", post(build_index))
        .route("/backups", get(list_backups))
        .route("/backup", post(create_backup))
        .route("/restore", post(restore_backup))
        .route("/sync/status", get(sync_status))
        .route("/sync/upload", post(sync_upload))
        .route("/sync/download", post(sync_download))
        .route("/sync/snapshots", get(sync_snapshots))
        .route("/sync/restore/{backup_name}", post(sync_restore))
        .route("/maintenance/embedder/reload", post(reload_embedder))
}

/// Full index statistics.
async fn stats(State(state): State<AppState>) -> Json<recall_engine::EngineStats> {
    Json(state.engine.stats().await)
}

/// Service-level metrics: latency, errors, queue depth, memory trend,
/// process RSS, and embedder reload counters.
async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let light = state.engine.stats_light().await;
    state.metrics.record_memory_sample(light.total_memories);

    let (requests, routes) = state.metrics.requests_snapshot();
    Json(json!({
        "uptime_sec": state.metrics.uptime_sec(),
        "extract": {
            "queue_depth": state.queue_depth(),
            "queue_max": state.settings.extract_queue_max,
            "queue_remaining": state.queue_remaining(),
            "workers": state.settings.extract_workers,
            "jobs_tracked": state.jobs.len().await,
        },
        "memory": {
            "current_total": light.total_memories,
            "trend": state.metrics.trend_snapshot(),
            "process": crate::reload::read_process_memory_kb(),
        },
        "embedder_reload": state.reload_metrics.snapshot(),
        "requests": requests,
        "routes": routes,
    }))
}

#[derive(Debug, Deserialize)]
struct BuildIndexRequest {
    #[serde(default)]
    sources: Option<Vec<String>>,
}

/// Rebuild the index from workspace files using markdown-aware chunking.
async fn build_index(
    State(state): State<AppState>,
    Json(request): Json<BuildIndexRequest>,
) -> ApiResult<Json<Value>> {
    info!("Rebuilding index...");
    let workspace = state.settings.workspace_dir.clone();

    let mut sources: Vec<PathBuf> = Vec::new();
    match request.sources {
        None => {
            sources.push(workspace.join("MEMORY.md"));
            if let Ok(mut entries) = tokio::fs::read_dir(workspace.join("memory")).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "md") {
                        sources.push(path);
                    }
                }
            }
        }
        Some(requested) => {
            for raw in requested {
                let relative = PathBuf::from(&raw);
                let traverses = relative.components().any(|component| {
                    matches!(component, Component::ParentDir | Component::RootDir)
                });
                if traverses {
                    warn!("Path traversal blocked in index build: {raw}");
                    continue;
                }
                sources.push(workspace.join(relative));
            }
        }
    }

    let mut existing = Vec::new();
    for source in sources {
        if tokio::fs::try_exists(&source).await.unwrap_or(false) {
            existing.push(source);
        }
    }

    let report = state.engine.rebuild_from_files(&existing).await?;
    info!(
        files = report.files_processed,
        memories = report.memories_added,
        "Index rebuilt"
    );
    Ok(Json(json!({
        "success": true,
        "files_processed": report.files_processed,
        "memories_added": report.memories_added,
        "backup_location": report.backup_location,
        "message": "Index rebuilt successfully",
    })))
}

/// List available local backups.
async fn list_backups(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let backups = state.engine.list_backups().await?;
    let count = backups.len();
    Ok(Json(json!({ "backups": backups, "count": count })))
}

#[derive(Debug, Deserialize)]
struct BackupQuery {
    #[serde(default = "default_backup_prefix")]
    prefix: String,
}

fn default_backup_prefix() -> String {
    "manual".to_string()
}

/// Create a manual backup.
async fn create_backup(
    State(state): State<AppState>,
    Query(query): Query<BackupQuery>,
) -> ApiResult<Json<Value>> {
    if query.prefix.len() > 50 {
        return Err(bad_request("prefix must be at most 50 characters"));
    }
    let backup_path = state.engine.create_backup(&query.prefix).await?;
    Ok(Json(json!({
        "success": true,
        "backup_path": backup_path.display().to_string(),
        "message": "Backup created successfully",
    })))
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    backup_name: String,
}

/// Restore metadata and vectors from a named local backup.
async fn restore_backup(
    State(state): State<AppState>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult<Json<Value>> {
    info!(backup = %request.backup_name, "Restoring from backup");
    let result = state.engine.restore_from_backup(&request.backup_name).await?;
    Ok(Json(json!({
        "success": true,
        "restored_from": result.restored_from,
        "total_memories": result.total_memories,
        "message": "Restored successfully",
    })))
}

fn cloud_required(state: &AppState) -> ApiResult<&recall_storage::CloudSync> {
    state
        .engine
        .cloud()
        .ok_or_else(|| RecallError::failed_precondition("Cloud sync not configured").into())
}

/// Cloud sync status: latest local and remote snapshots.
async fn sync_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let Some(cloud) = state.engine.cloud() else {
        return Ok(Json(json!({
            "enabled": false,
            "message": "Cloud sync not configured",
        })));
    };

    let remote = cloud.list_remote_snapshots().await?;
    let local = state.engine.list_backups().await?;
    Ok(Json(json!({
        "enabled": true,
        "latest_remote": remote.first().map(|snapshot| snapshot.name.clone()),
        "latest_local": local.first().map(|backup| backup.name.clone()),
        "remote_count": remote.len(),
        "local_count": local.len(),
    })))
}

/// Manually trigger a backup upload to the cloud (the upload rides the
/// snapshot path).
async fn sync_upload(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    cloud_required(&state)?;
    info!("Manual cloud upload triggered");
    let backup_path = state.engine.create_backup("manual").await?;
    let backup_name = backup_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(Json(json!({
        "success": true,
        "backup_name": backup_name,
        "message": "Backup created and uploaded to cloud",
    })))
}

#[derive(Debug, Deserialize)]
struct SyncDownloadQuery {
    #[serde(default)]
    backup_name: Option<String>,
    #[serde(default)]
    confirm: bool,
}

/// Download a backup from the cloud (requires confirmation).
async fn sync_download(
    State(state): State<AppState>,
    Query(query): Query<SyncDownloadQuery>,
) -> ApiResult<Json<Value>> {
    let cloud = cloud_required(&state)?;
    if !query.confirm {
        return Err(RecallError::failed_precondition(
            "Confirmation required. Set confirm=true to proceed. \
             WARNING: This will download from cloud.",
        )
        .into());
    }

    let backup_name = match query.backup_name {
        Some(name) => name,
        None => cloud
            .latest_snapshot()
            .await?
            .ok_or_else(|| RecallError::not_found("cloud backup", "latest"))?,
    };

    info!(backup = %backup_name, "Downloading backup from cloud");
    let report = cloud
        .download_backup(&backup_name, state.engine.backup_dir())
        .await?;
    Ok(Json(json!({
        "success": true,
        "backup_name": report.backup_name,
        "files_downloaded": report.files_downloaded,
        "local_path": report.local_path,
        "message": format!("Downloaded {backup_name} from cloud. Use /restore to apply it."),
    })))
}

/// List remote snapshots in cloud storage.
async fn sync_snapshots(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let cloud = cloud_required(&state)?;
    let snapshots = cloud.list_remote_snapshots().await?;
    let count = snapshots.len();
    Ok(Json(json!({ "snapshots": snapshots, "count": count })))
}

#[derive(Debug, Deserialize)]
struct SyncRestoreQuery {
    #[serde(default)]
    confirm: bool,
}

/// Download and restore a cloud backup in one step.
async fn sync_restore(
    State(state): State<AppState>,
    Path(backup_name): Path<String>,
    Query(query): Query<SyncRestoreQuery>,
) -> ApiResult<Json<Value>> {
    let cloud = cloud_required(&state)?;
    if !query.confirm {
        return Err(RecallError::failed_precondition(
            "Confirmation required. Set confirm=true to proceed. \
             WARNING: This will overwrite local data.",
        )
        .into());
    }

    info!(backup = %backup_name, "Downloading and restoring from cloud");
    let downloaded = cloud
        .download_backup(&backup_name, state.engine.backup_dir())
        .await?;
    let restored = state.engine.restore_from_backup(&backup_name).await?;
    Ok(Json(json!({
        "success": true,
        "downloaded": downloaded,
        "restored": restored,
        "message": format!("Successfully restored {backup_name} from cloud"),
    })))
}

/// Reload the in-process embedder runtime and release old inference objects.
async fn reload_embedder(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    {
        let mut manual = state.reload_metrics.manual.lock();
        manual.requests_total += 1;
        manual.last_requested_at = Some(Utc::now());
    }

    match state.engine.reload_embedder().await {
        Ok(report) => {
            let trim = state.trimmer.maybe_trim("embedder_reload");
            let elapsed_ms = (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0;
            {
                let mut manual = state.reload_metrics.manual.lock();
                manual.succeeded_total += 1;
                manual.last_completed_at = Some(Utc::now());
                manual.last_reload_duration_ms = elapsed_ms;
                manual.last_trim_reason = Some(trim.reason.clone());
                manual.last_error = None;
                manual.last_error_at = None;
            }
            Ok(Json(json!({
                "success": true,
                "reloaded": report.reloaded,
                "model": report.model,
                "dimension": report.dimension,
                "trim": trim,
            })))
        }
        Err(e) => {
            let elapsed_ms = (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0;
            {
                let mut manual = state.reload_metrics.manual.lock();
                manual.failed_total += 1;
                manual.last_completed_at = Some(Utc::now());
                manual.last_reload_duration_ms = elapsed_ms;
                manual.last_error = Some(e.to_string());
                manual.last_error_at = Some(Utc::now());
            }
            error!("Embedder reload failed: {e}");
            Err(e.into())
        }
    }
}
