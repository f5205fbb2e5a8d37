//! Async extraction endpoints: enqueue with back-pressure, job polling, and
//! provider status.

use super::{ApiResult, bad_request};
use crate::jobs::new_job_id;
use crate::state::{AppState, ExtractTask};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use recall_core::RecallError;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::atomic::Ordering;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/memory/extract", post(enqueue_extraction))
        .route("/memory/extract/{job_id}", get(extraction_job))
        .route("/extract/status", get(extract_status))
}

#[derive(Debug, Deserialize)]
struct ExtractRequest {
    messages: String,
    #[serde(default)]
    source: String,
    #[serde(default = "default_context")]
    context: String,
}

fn default_context() -> String {
    "stop".to_string()
}

/// Queue extraction and return `202` immediately. Client disconnects do not
/// cancel the job.
async fn enqueue_extraction(
    State(state): State<AppState>,
    Json(request): Json<ExtractRequest>,
) -> ApiResult<Response> {
    if request.messages.is_empty()
        || request.messages.len() > state.settings.max_extract_message_chars
    {
        return Err(bad_request(format!(
            "messages must be 1..={} characters",
            state.settings.max_extract_message_chars
        )));
    }

    if state.provider.is_none() {
        if !state.settings.extract_fallback_add {
            return Ok((
                StatusCode::NOT_IMPLEMENTED,
                Json(json!({
                    "detail": "Extraction not configured. Set EXTRACT_PROVIDER env var."
                })),
            )
                .into_response());
        }
        return run_inline_fallback(&state, &request).await;
    }

    let job_id = new_job_id();
    state
        .jobs
        .insert_queued(&job_id, &request.source, &request.context, request.messages.len())
        .await;

    let task = ExtractTask {
        job_id: job_id.clone(),
        messages: request.messages,
        source: request.source.clone(),
        context: request.context.clone(),
    };
    match state.extract_tx.try_send(task) {
        Ok(()) => {
            state.queue_depth.fetch_add(1, Ordering::Relaxed);
        }
        Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
            // The job we just registered will never be processed.
            state.jobs.remove(&job_id).await;
            let queue_depth = state.queue_depth();
            let workers = state.settings.extract_workers.max(1);
            let retry_after_sec = ((queue_depth / workers) as u64 + 1).clamp(1, 30);
            warn!(
                depth = queue_depth,
                max = state.settings.extract_queue_max,
                "Extract queue full"
            );
            return Ok((
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_sec.to_string())],
                Json(json!({
                    "detail": {
                        "error": "extract_queue_full",
                        "message": "Extraction queue is full. Retry later.",
                        "queue_depth": queue_depth,
                        "queue_max": state.settings.extract_queue_max,
                        "retry_after_sec": retry_after_sec,
                    }
                })),
            )
                .into_response());
        }
    }

    state.jobs.trim_finished().await;
    info!(
        job_id = %job_id,
        source = %request.source,
        context = %request.context,
        queue_depth = state.queue_depth(),
        "Extract queued"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job_id,
            "status": "queued",
            "queue_depth": state.queue_depth(),
            "result_url": format!("/memory/extract/{job_id}"),
        })),
    )
        .into_response())
}

/// Provider-less deployments with fallback-add enabled run the heuristic
/// extractor inline and report a finished job.
async fn run_inline_fallback(state: &AppState, request: &ExtractRequest) -> ApiResult<Response> {
    let job_id = new_job_id();
    state
        .jobs
        .insert_queued(&job_id, &request.source, &request.context, request.messages.len())
        .await;
    state.jobs.set_mode(&job_id, "fallback_add").await;

    match recall_extract::run_fallback_extraction(
        &state.engine,
        &request.messages,
        &request.source,
        &request.context,
    )
    .await
    {
        Ok(result) => {
            info!(
                job_id = %job_id,
                extracted = result.extracted_count,
                stored = result.stored_count,
                "Extract fallback completed"
            );
            state.jobs.mark_completed(&job_id, result).await;
        }
        Err(e) => {
            warn!(job_id = %job_id, "Extract fallback failed: {e}");
            state.jobs.mark_failed(&job_id, e.to_string()).await;
        }
    }
    state.jobs.trim_finished().await;

    let status = state
        .jobs
        .get(&job_id)
        .await
        .map(|job| job.status)
        .unwrap_or(crate::jobs::JobStatus::Failed);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job_id,
            "status": status,
            "queue_depth": state.queue_depth(),
            "result_url": format!("/memory/extract/{job_id}"),
        })),
    )
        .into_response())
}

/// Get queued extraction job status/result.
async fn extraction_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<crate::jobs::ExtractJob>> {
    state
        .jobs
        .get(&job_id)
        .await
        .map(Json)
        .ok_or_else(|| RecallError::not_found("extraction job", &job_id).into())
}

/// Check extraction provider health and queue configuration.
async fn extract_status(State(state): State<AppState>) -> Json<Value> {
    let mut payload = json!({
        "queue_depth": state.queue_depth(),
        "queue_max": state.settings.extract_queue_max,
        "queue_remaining": state.queue_remaining(),
        "workers": state.settings.extract_workers,
        "jobs_tracked": state.jobs.len().await,
        "fallback_add_enabled": state.settings.extract_fallback_add,
    });

    match &state.provider {
        None => {
            payload["enabled"] = json!(false);
        }
        Some(provider) => {
            payload["enabled"] = json!(true);
            payload["provider"] = json!(provider.provider_name());
            payload["model"] = json!(provider.model());
            payload["status"] = if provider.health_check().await {
                json!("healthy")
            } else {
                json!("unhealthy")
            };
        }
    }
    Json(payload)
}
