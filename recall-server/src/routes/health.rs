//! Health and readiness probes.

use crate::auth::keys_match;
use crate::state::{AppState, SERVICE_NAME, SERVICE_VERSION};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
}

/// Lightweight health check (no filesystem I/O). Unauthenticated callers get
/// the minimal payload; authenticated callers get stats.
async fn health(State(state): State<AppState>, headers: HeaderMap) -> Json<serde_json::Value> {
    let mut body = json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    });

    let authenticated = match state.settings.api_key.as_deref() {
        None => true,
        Some(expected) => headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .map(|provided| keys_match(provided, expected))
            .unwrap_or(false),
    };
    if authenticated {
        let stats = state.engine.stats_light().await;
        body["total_memories"] = json!(stats.total_memories);
        body["dimension"] = json!(stats.dimension);
        body["model"] = json!(stats.model);
    }
    Json(body)
}

/// Readiness check for orchestrators and cutover automation.
async fn health_ready(State(state): State<AppState>) -> Response {
    let status = state.engine.is_ready().await;
    if status.ready {
        Json(status).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"detail": status}))).into_response()
    }
}
