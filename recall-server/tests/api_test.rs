//! HTTP surface tests over the assembled router with a local store, hash
//! embedder, and scripted provider.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use recall_embed::{Embedder, HashEmbedder};
use recall_engine::{EmbedderFactory, EngineOptions, MemoryEngine};
use recall_extract::{LlmProvider, MockProvider};
use recall_server::governor::spawn_background_tasks;
use recall_server::state::{AppState, ExtractTask, ServerSettings};
use recall_server::{auth, build_router, jobs, metrics, reload, trim};
use recall_storage::LocalVectorStore;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct TestApp {
    app: Router,
    state: AppState,
    rx: Option<mpsc::Receiver<ExtractTask>>,
}

fn test_settings(queue_max: usize, api_key: Option<&str>, fallback: bool) -> ServerSettings {
    ServerSettings {
        api_key: api_key.map(str::to_owned),
        workspace_dir: std::env::temp_dir(),
        max_extract_message_chars: 120_000,
        extract_workers: 1,
        extract_queue_max: queue_max,
        extract_job_retention_sec: 300,
        extract_jobs_max: 200,
        extract_fallback_add: fallback,
        trim_enabled: false,
        trim_cooldown_sec: 15.0,
        trim_periodic_sec: 0.0,
        auto_reload_enabled: false,
    }
}

async fn test_app(
    dir: &Path,
    provider: Option<Arc<dyn LlmProvider>>,
    settings: ServerSettings,
) -> TestApp {
    let factory: EmbedderFactory =
        Arc::new(|| Ok(Box::new(HashEmbedder::new(768)) as Box<dyn Embedder>));
    let engine = Arc::new(
        MemoryEngine::new(EngineOptions {
            data_dir: dir.to_path_buf(),
            store: Arc::new(LocalVectorStore::in_memory()),
            embedder_factory: factory,
            cloud: None,
            max_backups: 10,
        })
        .await
        .unwrap(),
    );

    let settings = Arc::new(settings);
    let (extract_tx, extract_rx) = mpsc::channel(settings.extract_queue_max);
    let state = AppState {
        engine,
        provider,
        jobs: Arc::new(jobs::JobStore::new(
            settings.extract_job_retention_sec,
            settings.extract_jobs_max,
        )),
        extract_tx,
        queue_depth: Arc::new(AtomicUsize::new(0)),
        settings: settings.clone(),
        trimmer: Arc::new(trim::MemoryTrimmer::new(false, 0.0)),
        metrics: Arc::new(metrics::RequestMetrics::new(50, 10)),
        reload_metrics: Arc::new(reload::ReloadMetrics::new(
            false,
            reload::ReloadPolicy {
                rss_kb_threshold: 1_200_000,
                check_sec: 15.0,
                required_high_streak: 3,
                min_interval_sec: 900.0,
                window_sec: 3600.0,
                max_per_window: 2,
                max_active_requests: 2,
                max_queue_depth: 0,
            },
        )),
        auth: Arc::new(auth::AuthState::new()),
    };
    TestApp {
        app: build_router(state.clone()),
        state,
        rx: Some(extract_rx),
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    send_with_headers(app, method, uri, body, &[]).await
}

async fn send_with_headers(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_and_readiness() {
    let dir = tempfile::tempdir().unwrap();
    let harness = test_app(dir.path(), None, test_settings(10, None, false)).await;

    let (status, body) = send(&harness.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "memories");
    // No API key configured: detailed stats included.
    assert_eq!(body["total_memories"], 0);

    let (status, body) = send(&harness.app, "GET", "/health/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
    assert_eq!(body["qdrant_count"], 0);
    assert_eq!(body["metadata_count"], 0);
}

#[tokio::test]
async fn test_add_search_get_delete_flow() {
    let dir = tempfile::tempdir().unwrap();
    let harness = test_app(dir.path(), None, test_settings(10, None, false)).await;
    let app = &harness.app;

    let (status, body) = send(
        app,
        "POST",
        "/memory/add",
        Some(json!({"text": "Python is great for data science", "source": "lang.md"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let id = body["id"].as_i64().unwrap();

    let (status, body) = send(
        app,
        "POST",
        "/search",
        Some(json!({"query": "Python", "k": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(
        body["results"][0]["text"],
        "Python is great for data science"
    );
    assert!(body["results"][0]["similarity"].as_f64().unwrap() > 0.3);

    let (status, body) = send(app, "GET", &format!("/memory/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "lang.md");

    let (status, _) = send(app, "GET", "/memory/9999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(app, "DELETE", &format!("/memory/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted_id"], id);

    let (status, _) = send(app, "DELETE", &format!("/memory/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_hybrid_search_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let harness = test_app(dir.path(), None, test_settings(10, None, false)).await;
    let app = &harness.app;

    for (text, source) in [
        ("Python is great for data science", "lang.md"),
        ("JavaScript runs in browsers", "lang.md"),
        ("FastAPI is a Python web framework", "lang.md"),
    ] {
        let (status, _) = send(
            app,
            "POST",
            "/memory/add",
            Some(json!({"text": text, "source": source})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(
        app,
        "POST",
        "/search",
        Some(json!({"query": "Python web framework", "k": 3, "hybrid": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["text"], "FastAPI is a Python web framework");
    assert!(body["results"][0]["rrf_score"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_validation_errors() {
    let dir = tempfile::tempdir().unwrap();
    let harness = test_app(dir.path(), None, test_settings(10, None, false)).await;
    let app = &harness.app;

    let (status, _) = send(app, "POST", "/search", Some(json!({"query": "", "k": 2}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        app,
        "POST",
        "/search",
        Some(json!({"query": "q", "k": 500})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(app, "PATCH", "/memory/1", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        app,
        "POST",
        "/restore",
        Some(json!({"backup_name": "../escape"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sync_requires_cloud_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let harness = test_app(dir.path(), None, test_settings(10, None, false)).await;
    let app = &harness.app;

    let (status, body) = send(app, "GET", "/sync/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);

    let (status, _) = send(app, "POST", "/sync/upload", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(app, "GET", "/sync/snapshots", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_api_key_auth() {
    let dir = tempfile::tempdir().unwrap();
    let harness = test_app(dir.path(), None, test_settings(10, Some("sekrit"), false)).await;
    let app = &harness.app;

    // Health stays open but hides stats without the key.
    let (status, body) = send(app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("total_memories").is_none());

    let (status, _) = send(app, "GET", "/stats", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send_with_headers(
        app,
        "GET",
        "/stats",
        None,
        &[("x-api-key", "wrong")],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send_with_headers(
        app,
        "GET",
        "/stats",
        None,
        &[("x-api-key", "sekrit")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_memories"], 0);
}

#[tokio::test]
async fn test_extract_not_configured() {
    let dir = tempfile::tempdir().unwrap();
    let harness = test_app(dir.path(), None, test_settings(10, None, false)).await;

    let (status, _) = send(
        &harness.app,
        "POST",
        "/memory/extract",
        Some(json!({"messages": "some conversation"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);

    let (status, body) = send(&harness.app, "GET", "/extract/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
}

#[tokio::test]
async fn test_extract_queue_full_returns_429() {
    let dir = tempfile::tempdir().unwrap();
    let provider: Arc<dyn LlmProvider> = Arc::new(MockProvider::new(vec![], true));
    // Queue of one and NO workers draining it.
    let harness = test_app(dir.path(), Some(provider), test_settings(1, None, false)).await;
    let app = &harness.app;

    let (status, first) = send(
        app,
        "POST",
        "/memory/extract",
        Some(json!({"messages": "conversation one", "source": "s"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["status"], "queued");

    let request = Request::builder()
        .method("POST")
        .uri("/memory/extract")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"messages": "conversation two", "source": "s"}).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get("Retry-After")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["detail"]["error"], "extract_queue_full");
    assert!(body["detail"]["retry_after_sec"].as_u64().unwrap() >= 1);

    // The rejected job is not tracked.
    assert_eq!(harness.state.jobs.len().await, 1);
}

#[tokio::test]
async fn test_extract_worker_completes_job() {
    let dir = tempfile::tempdir().unwrap();
    let facts = r#"[{"category": "DECISION", "text": "Uses Drizzle ORM"}]"#;
    let decisions = r#"[{"action":"ADD","fact_index":0}]"#;
    let provider: Arc<dyn LlmProvider> =
        Arc::new(MockProvider::new(vec![facts, decisions], true));
    let mut harness = test_app(dir.path(), Some(provider), test_settings(10, None, false)).await;

    let cancel = CancellationToken::new();
    let handles = spawn_background_tasks(
        harness.state.clone(),
        harness.rx.take().unwrap(),
        cancel.clone(),
    );

    let (status, body) = send(
        &harness.app,
        "POST",
        "/memory/extract",
        Some(json!({"messages": "we chose drizzle", "source": "claude-code/app"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert_eq!(body["result_url"], format!("/memory/extract/{job_id}"));

    // Poll until the worker finishes the job.
    let mut completed = Value::Null;
    for _ in 0..100 {
        let (status, job) = send(
            &harness.app,
            "GET",
            &format!("/memory/extract/{job_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        if job["status"] == "completed" {
            completed = job;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(completed["status"], "completed");
    assert_eq!(completed["result"]["stored_count"], 1);
    assert_eq!(completed["result"]["extracted_count"], 1);

    assert_eq!(harness.state.engine.count_memories(None).await, 1);

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_inline_fallback_when_no_provider() {
    let dir = tempfile::tempdir().unwrap();
    let harness = test_app(dir.path(), None, test_settings(10, None, true)).await;

    let (status, body) = send(
        &harness.app,
        "POST",
        "/memory/extract",
        Some(json!({
            "messages": "Assistant: We decided to use postgres for the primary database.",
            "source": "proj/app"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "completed");

    let job_id = body["job_id"].as_str().unwrap();
    let (_, job) = send(
        &harness.app,
        "GET",
        &format!("/memory/extract/{job_id}"),
        None,
    )
    .await;
    assert_eq!(job["mode"], "fallback_add");
    assert_eq!(job["result"]["stored_count"], 1);
    assert_eq!(harness.state.engine.count_memories(None).await, 1);
}

#[tokio::test]
async fn test_metrics_endpoint_shape() {
    let dir = tempfile::tempdir().unwrap();
    let harness = test_app(dir.path(), None, test_settings(10, None, false)).await;
    let app = &harness.app;

    send(app, "GET", "/health", None).await;
    let (status, body) = send(app, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["extract"]["queue_max"], 10);
    assert_eq!(body["extract"]["workers"], 1);
    assert!(body["requests"]["total_count"].as_u64().unwrap() >= 1);
    assert!(body["routes"].get("GET /health").is_some());
    assert_eq!(body["embedder_reload"]["enabled"], false);
}

#[tokio::test]
async fn test_backup_and_restore_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let harness = test_app(dir.path(), None, test_settings(10, None, false)).await;
    let app = &harness.app;

    send(
        app,
        "POST",
        "/memory/add",
        Some(json!({"text": "durable fact to restore", "source": "a.md"})),
    )
    .await;

    let (status, body) = send(app, "POST", "/backup?prefix=pin", None).await;
    assert_eq!(status, StatusCode::OK);
    let backup_path = body["backup_path"].as_str().unwrap();
    let backup_name = std::path::Path::new(backup_path)
        .file_name()
        .unwrap()
        .to_string_lossy()
        .to_string();

    send(
        app,
        "POST",
        "/memory/add",
        Some(json!({"text": "ephemeral fact added after the pin", "source": "b.md"})),
    )
    .await;

    let (status, body) = send(
        app,
        "POST",
        "/restore",
        Some(json!({"backup_name": backup_name})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_memories"], 1);

    let (status, body) = send(app, "GET", "/memories?offset=0&limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["memories"][0]["text"], "durable fact to restore");

    let (status, body) = send(app, "GET", "/backups", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["count"].as_u64().unwrap() >= 2); // pin + pre_restore
}
