//! Background loops: extraction workers, job reaper, periodic memory trim,
//! and embedder auto-reload. All are cancellable via one token; workers
//! finish their in-flight job before exiting.

use crate::state::{AppState, ExtractTask};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Spawn every background task. The returned handles complete after the
/// token is cancelled.
pub fn spawn_background_tasks(
    state: AppState,
    extract_rx: mpsc::Receiver<ExtractTask>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let shared_rx = Arc::new(Mutex::new(extract_rx));
    for worker_id in 1..=state.settings.extract_workers {
        handles.push(tokio::spawn(extract_worker(
            worker_id,
            state.clone(),
            shared_rx.clone(),
            cancel.clone(),
        )));
    }

    handles.push(tokio::spawn(job_reaper(state.clone(), cancel.clone())));

    if state.settings.trim_enabled && state.settings.trim_periodic_sec > 0.0 {
        handles.push(tokio::spawn(periodic_trim(state.clone(), cancel.clone())));
    }

    if state.settings.auto_reload_enabled {
        handles.push(tokio::spawn(auto_reload(state, cancel)));
    }

    handles
}

async fn extract_worker(
    worker_id: usize,
    state: AppState,
    rx: Arc<Mutex<mpsc::Receiver<ExtractTask>>>,
    cancel: CancellationToken,
) {
    info!(worker_id, "Extraction worker started");
    loop {
        // Cancellation is honored between jobs, never mid-job.
        let task = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = task else {
            info!(worker_id, "Extraction worker stopped");
            break;
        };

        state.queue_depth.fetch_sub(1, Ordering::Relaxed);
        state.jobs.mark_running(&task.job_id, state.queue_depth()).await;

        process_task(&state, &task).await;

        state
            .trimmer
            .maybe_trim(&format!("extract:{}", task.context));
        state.jobs.trim_finished().await;
    }
}

async fn process_task(state: &AppState, task: &ExtractTask) {
    let Some(provider) = state.provider.as_deref() else {
        state
            .jobs
            .mark_failed(&task.job_id, "extraction provider unavailable".to_string())
            .await;
        return;
    };

    let mut outcome = recall_extract::run_extraction(
        provider,
        &state.engine,
        &task.messages,
        &task.source,
        &task.context,
    )
    .await;

    if state.settings.extract_fallback_add && outcome.provider_runtime_failure() {
        match recall_extract::run_fallback_extraction(
            &state.engine,
            &task.messages,
            &task.source,
            &task.context,
        )
        .await
        {
            Ok(fallback) => {
                outcome = recall_extract::merge_runtime_fallback(&outcome, fallback);
                info!(
                    job_id = %task.job_id,
                    source = %task.source,
                    extracted = outcome.extracted_count,
                    stored = outcome.stored_count,
                    "Extract runtime fallback completed"
                );
            }
            Err(e) => {
                error!(job_id = %task.job_id, "Extraction fallback failed: {e}");
                state.jobs.mark_failed(&task.job_id, e.to_string()).await;
                return;
            }
        }
    }

    state.jobs.mark_completed(&task.job_id, outcome).await;
}

/// Trim stale extraction jobs every 60 seconds.
async fn job_reaper(state: AppState, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => state.jobs.trim_finished().await,
        }
    }
}

/// Attempt a periodic memory trim to reclaim allocator high-water marks.
async fn periodic_trim(state: AppState, cancel: CancellationToken) {
    let mut interval =
        tokio::time::interval(Duration::from_secs_f64(state.settings.trim_periodic_sec));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let result = state.trimmer.maybe_trim("periodic");
                if result.trimmed {
                    debug!("Periodic memory trim complete");
                }
            }
        }
    }
}

/// Auto-reload the embedder when RSS stays high and the service is idle.
async fn auto_reload(state: AppState, cancel: CancellationToken) {
    let controller = crate::reload::AutoReloadController::new(
        crate::reload::ReloadPolicy::from_env(),
    );
    let mut interval =
        tokio::time::interval(Duration::from_secs_f64(controller.policy().check_sec));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                run_auto_reload_check(&state, &controller).await;
            }
        }
    }
}

async fn run_auto_reload_check(state: &AppState, controller: &crate::reload::AutoReloadController) {
    let process_stats = crate::reload::read_process_memory_kb();
    let rss_kb = process_stats.get("rss_kb").copied().unwrap_or(0);
    let active = state.metrics.active_requests();
    let queue_depth = state.queue_depth() as u64;

    let decision = controller.evaluate(rss_kb, active, queue_depth);
    state
        .reload_metrics
        .record_check(decision.reason, rss_kb, decision.trigger);
    if !decision.trigger {
        return;
    }

    warn!(
        rss_kb,
        active, queue_depth, "Auto embedder reload triggered"
    );
    let started = Instant::now();

    match state.engine.reload_embedder().await {
        Ok(_report) => {
            let trim = state.trimmer.maybe_trim("auto_embedder_reload");
            let elapsed_ms = (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0;
            let mut auto = state.reload_metrics.auto.lock();
            auto.succeeded_total += 1;
            auto.last_completed_at = Some(Utc::now());
            auto.last_reload_duration_ms = elapsed_ms;
            auto.last_trim_reason = Some(trim.reason);
            auto.last_error = None;
            auto.last_error_at = None;
            drop(auto);
            info!(elapsed_ms, "Auto embedder reload complete");
        }
        Err(e) => {
            let elapsed_ms = (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0;
            let mut auto = state.reload_metrics.auto.lock();
            auto.failed_total += 1;
            auto.last_completed_at = Some(Utc::now());
            auto.last_reload_duration_ms = elapsed_ms;
            auto.last_error = Some(e.to_string());
            auto.last_error_at = Some(Utc::now());
            drop(auto);
            error!("Auto embedder reload failed: {e}");
        }
    }
}
