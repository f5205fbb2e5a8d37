//! Service entry point: wire the engine, provider, and background governor
//! together and serve the REST surface.

use clap::Parser;
use recall_core::env_int;
use recall_embed::{EmbedSettings, make_embedder};
use recall_engine::{EngineOptions, MemoryEngine};
use recall_server::governor::spawn_background_tasks;
use recall_server::routes::build_router;
use recall_server::state::{AppState, ServerSettings};
use recall_server::{auth, jobs, metrics, reload, trim};
use recall_storage::{CloudSync, LocalVectorStore, QdrantSettings, QdrantVectorStore, VectorStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "recall", about = "Semantic memory service")]
struct Args {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Data directory for metadata, backups, and the local vector store
    #[arg(long, env = "DATA_DIR", default_value = "/data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Starting Recall memory service...");

    let settings = Arc::new(ServerSettings::from_env());

    // Embedder factory: reload builds a fresh instance from the same
    // resolved settings.
    let embed_settings = EmbedSettings::from_env();
    let factory_settings = embed_settings.clone();
    let embedder_factory: recall_engine::EmbedderFactory =
        Arc::new(move || make_embedder(&factory_settings));

    let qdrant_settings = QdrantSettings::from_env();
    let store: Arc<dyn VectorStore> = if qdrant_settings.url.is_some() {
        Arc::new(QdrantVectorStore::connect(qdrant_settings).await?)
    } else {
        info!("QDRANT_URL empty - using embedded local vector store");
        Arc::new(LocalVectorStore::open(args.data_dir.join("qdrant")).await?)
    };

    let engine = Arc::new(
        MemoryEngine::new(EngineOptions {
            data_dir: args.data_dir.clone(),
            store,
            embedder_factory,
            cloud: CloudSync::from_env(),
            max_backups: env_int("MAX_BACKUPS", 10, 1) as usize,
        })
        .await?,
    );
    let stats = engine.stats_light().await;
    info!(
        "Loaded {} memories ({} model, {} dims)",
        stats.total_memories, stats.model, stats.dimension
    );

    let provider = match recall_extract::provider_from_env() {
        Ok(provider) => provider,
        Err(e) => {
            warn!("Extraction setup failed: {e}");
            None
        }
    };
    if provider.is_none() {
        info!("Extraction disabled (EXTRACT_PROVIDER not set)");
    }

    let (extract_tx, extract_rx) = mpsc::channel(settings.extract_queue_max);
    let state = AppState {
        engine: engine.clone(),
        provider,
        jobs: Arc::new(jobs::JobStore::new(
            settings.extract_job_retention_sec,
            settings.extract_jobs_max,
        )),
        extract_tx,
        queue_depth: Arc::new(AtomicUsize::new(0)),
        settings: settings.clone(),
        trimmer: Arc::new(trim::MemoryTrimmer::new(
            settings.trim_enabled,
            settings.trim_cooldown_sec,
        )),
        metrics: Arc::new(metrics::RequestMetrics::from_env()),
        reload_metrics: Arc::new(reload::ReloadMetrics::new(
            settings.auto_reload_enabled,
            reload::ReloadPolicy::from_env(),
        )),
        auth: Arc::new(auth::AuthState::new()),
    };

    let cancel = CancellationToken::new();
    let background = spawn_background_tasks(state.clone(), extract_rx, cancel.clone());

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
    info!("Listening on {}:{}", args.host, args.port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Workers honor cancellation between jobs; in-flight jobs finish first.
    cancel.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            warn!("background task join failed: {e}");
        }
    }

    info!("Shutting down - saving index...");
    engine.save().await?;
    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("shutdown signal listener failed: {e}");
    }
}
