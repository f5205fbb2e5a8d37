//! Shared application state and server settings.

use crate::auth::AuthState;
use crate::jobs::JobStore;
use crate::metrics::RequestMetrics;
use crate::reload::ReloadMetrics;
use crate::trim::MemoryTrimmer;
use recall_core::{env_bool, env_float, env_int, env_str};
use recall_engine::MemoryEngine;
use recall_extract::LlmProvider;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

pub const SERVICE_NAME: &str = "memories";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A queued extraction request.
#[derive(Debug, Clone)]
pub struct ExtractTask {
    pub job_id: String,
    pub messages: String,
    pub source: String,
    pub context: String,
}

/// Server-level knobs resolved from the environment once at startup.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub api_key: Option<String>,
    pub workspace_dir: PathBuf,
    pub max_extract_message_chars: usize,
    pub extract_workers: usize,
    pub extract_queue_max: usize,
    pub extract_job_retention_sec: u64,
    pub extract_jobs_max: usize,
    pub extract_fallback_add: bool,
    pub trim_enabled: bool,
    pub trim_cooldown_sec: f64,
    pub trim_periodic_sec: f64,
    pub auto_reload_enabled: bool,
}

impl ServerSettings {
    pub fn from_env() -> Self {
        let workers = env_int("EXTRACT_MAX_INFLIGHT", 2, 1) as usize;
        Self {
            api_key: env_str("API_KEY"),
            workspace_dir: PathBuf::from(
                env_str("WORKSPACE_DIR").unwrap_or_else(|| "/workspace".to_string()),
            ),
            max_extract_message_chars: env_int("MAX_EXTRACT_MESSAGE_CHARS", 120_000, 1) as usize,
            extract_workers: workers,
            extract_queue_max: env_int("EXTRACT_QUEUE_MAX", (workers * 20) as u64, 1) as usize,
            extract_job_retention_sec: env_int("EXTRACT_JOB_RETENTION_SEC", 300, 60),
            extract_jobs_max: env_int("EXTRACT_JOBS_MAX", 200, 10) as usize,
            extract_fallback_add: env_bool("EXTRACT_FALLBACK_ADD", false),
            trim_enabled: env_bool("MEMORY_TRIM_ENABLED", true),
            trim_cooldown_sec: env_float("MEMORY_TRIM_COOLDOWN_SEC", 15.0, 0.0),
            trim_periodic_sec: env_float("MEMORY_TRIM_PERIODIC_SEC", 5.0, 0.0),
            auto_reload_enabled: env_bool("EMBEDDER_AUTO_RELOAD_ENABLED", false),
        }
    }
}

/// Everything the handlers and background loops share.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MemoryEngine>,
    pub provider: Option<Arc<dyn LlmProvider>>,
    pub jobs: Arc<JobStore>,
    pub extract_tx: mpsc::Sender<ExtractTask>,
    pub queue_depth: Arc<AtomicUsize>,
    pub settings: Arc<ServerSettings>,
    pub trimmer: Arc<MemoryTrimmer>,
    pub metrics: Arc<RequestMetrics>,
    pub reload_metrics: Arc<ReloadMetrics>,
    pub auth: Arc<AuthState>,
}

impl AppState {
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn queue_remaining(&self) -> usize {
        self.settings
            .extract_queue_max
            .saturating_sub(self.queue_depth())
    }
}
