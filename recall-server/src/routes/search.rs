//! Search endpoints (vector-only and hybrid).

use super::{ApiResult, bad_request};
use crate::state::AppState;
use axum::{Json, Router, extract::State, routing::post};
use serde::Deserialize;
use serde_json::{Value, json};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/search", post(search))
        .route("/search/batch", post(search_batch))
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub hybrid: bool,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default)]
    pub source_prefix: Option<String>,
}

fn default_k() -> usize {
    5
}

fn default_vector_weight() -> f64 {
    0.7
}

#[derive(Debug, Deserialize)]
struct SearchBatchRequest {
    queries: Vec<SearchRequest>,
}

fn validate(request: &SearchRequest) -> ApiResult<()> {
    if request.query.is_empty() || request.query.len() > 10_000 {
        return Err(bad_request("query must be 1..=10000 characters"));
    }
    if request.k == 0 || request.k > 100 {
        return Err(bad_request("k must be 1..=100"));
    }
    if let Some(threshold) = request.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(bad_request("threshold must be within [0, 1]"));
        }
    }
    if !(0.0..=1.0).contains(&request.vector_weight) {
        return Err(bad_request("vector_weight must be within [0, 1]"));
    }
    Ok(())
}

async fn run_one(state: &AppState, request: &SearchRequest) -> ApiResult<Value> {
    validate(request)?;
    let results = if request.hybrid {
        state
            .engine
            .hybrid_search(
                &request.query,
                request.k,
                request.threshold,
                request.vector_weight,
                request.source_prefix.as_deref(),
            )
            .await?
    } else {
        state
            .engine
            .search(
                &request.query,
                request.k,
                request.threshold,
                request.source_prefix.as_deref(),
            )
            .await?
    };
    let count = results.len();
    Ok(json!({
        "query": request.query,
        "results": results,
        "count": count,
    }))
}

/// Search for similar memories (vector-only or hybrid).
async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Json<Value>> {
    tracing::info!(
        query = %request.query.chars().take(80).collect::<String>(),
        k = request.k,
        hybrid = request.hybrid,
        "Search"
    );
    Ok(Json(run_one(&state, &request).await?))
}

/// Run multiple searches in one request.
async fn search_batch(
    State(state): State<AppState>,
    Json(request): Json<SearchBatchRequest>,
) -> ApiResult<Json<Value>> {
    if request.queries.is_empty() || request.queries.len() > 200 {
        return Err(bad_request("queries must contain 1..=200 entries"));
    }
    let mut outputs = Vec::with_capacity(request.queries.len());
    for item in &request.queries {
        outputs.push(run_one(&state, item).await?);
    }
    let count = outputs.len();
    Ok(Json(json!({
        "results": outputs,
        "count": count,
    })))
}
