//! Request metrics middleware and the `/metrics` snapshot.
//!
//! The metrics table lives behind its own mutex and is only touched by this
//! middleware and the `/metrics` handler; write paths never see it.

use axum::{extract::Request, middleware::Next, response::Response};
use chrono::{DateTime, Utc};
use recall_core::env_int;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

static NUMERIC_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/[0-9]+(/|$)").unwrap());
static HEX_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/[0-9a-f]{8,}(/|$)").unwrap());

/// Collapse ids out of paths so each route gets one bucket.
pub fn normalize_metrics_path(path: &str) -> String {
    let normalized = NUMERIC_SEGMENT.replace_all(path, "/{id}$1");
    HEX_SEGMENT.replace_all(&normalized, "/{id}$1").to_string()
}

#[derive(Debug)]
struct RouteBucket {
    count: u64,
    error_count: u64,
    total_latency_ms: f64,
    max_latency_ms: f64,
    last_status_code: u16,
    latency_samples_ms: VecDeque<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendSample {
    pub timestamp: DateTime<Utc>,
    pub total_memories: usize,
}

pub struct RequestMetrics {
    started_at: Instant,
    active: AtomicI64,
    latency_samples: usize,
    trend_samples: usize,
    routes: parking_lot::Mutex<HashMap<String, RouteBucket>>,
    trend: parking_lot::Mutex<VecDeque<TrendSample>>,
}

impl RequestMetrics {
    pub fn from_env() -> Self {
        Self::new(
            env_int("METRICS_LATENCY_SAMPLES", 200, 20) as usize,
            env_int("METRICS_TREND_SAMPLES", 120, 5) as usize,
        )
    }

    pub fn new(latency_samples: usize, trend_samples: usize) -> Self {
        Self {
            started_at: Instant::now(),
            active: AtomicI64::new(0),
            latency_samples,
            trend_samples,
            routes: parking_lot::Mutex::new(HashMap::new()),
            trend: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    pub fn uptime_sec(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn active_requests(&self) -> u64 {
        self.active.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn record(&self, route_key: &str, latency_ms: f64, status_code: u16) {
        let mut routes = self.routes.lock();
        let bucket = routes
            .entry(route_key.to_string())
            .or_insert_with(|| RouteBucket {
                count: 0,
                error_count: 0,
                total_latency_ms: 0.0,
                max_latency_ms: 0.0,
                last_status_code: 0,
                latency_samples_ms: VecDeque::new(),
            });
        bucket.count += 1;
        if status_code >= 400 {
            bucket.error_count += 1;
        }
        bucket.total_latency_ms += latency_ms;
        bucket.max_latency_ms = bucket.max_latency_ms.max(latency_ms);
        bucket.last_status_code = status_code;
        if bucket.latency_samples_ms.len() >= self.latency_samples {
            bucket.latency_samples_ms.pop_front();
        }
        bucket.latency_samples_ms.push_back(latency_ms);
    }

    pub fn record_memory_sample(&self, total_memories: usize) {
        let mut trend = self.trend.lock();
        if trend.len() >= self.trend_samples {
            trend.pop_front();
        }
        trend.push_back(TrendSample {
            timestamp: Utc::now(),
            total_memories,
        });
    }

    pub fn trend_snapshot(&self) -> Value {
        let samples: Vec<TrendSample> = self.trend.lock().iter().cloned().collect();
        let delta = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) if samples.len() >= 2 => {
                last.total_memories as i64 - first.total_memories as i64
            }
            _ => 0,
        };
        json!({
            "window_size": self.trend_samples,
            "delta": delta,
            "samples": samples,
        })
    }

    pub fn requests_snapshot(&self) -> (Value, Value) {
        let routes = self.routes.lock();
        let mut total_count = 0u64;
        let mut total_errors = 0u64;
        let mut routes_payload = serde_json::Map::new();
        for (route_key, bucket) in routes.iter() {
            total_count += bucket.count;
            total_errors += bucket.error_count;
            let mut samples: Vec<f64> = bucket.latency_samples_ms.iter().copied().collect();
            samples.sort_by(f64::total_cmp);
            let p95 = percentile(&samples, 95.0);
            let avg = if bucket.count > 0 {
                bucket.total_latency_ms / bucket.count as f64
            } else {
                0.0
            };
            routes_payload.insert(
                route_key.clone(),
                json!({
                    "count": bucket.count,
                    "error_count": bucket.error_count,
                    "error_rate_pct": rate_pct(bucket.error_count, bucket.count),
                    "avg_latency_ms": round2(avg),
                    "p95_latency_ms": round2(p95),
                    "max_latency_ms": round2(bucket.max_latency_ms),
                    "last_status_code": bucket.last_status_code,
                }),
            );
        }
        let requests = json!({
            "total_count": total_count,
            "error_count": total_errors,
            "error_rate_pct": rate_pct(total_errors, total_count),
            "active_http_requests": self.active_requests(),
        });
        (requests, Value::Object(routes_payload))
    }
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

fn rate_pct(errors: u64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    round2(errors as f64 / count as f64 * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Axum middleware: maintain the active-request gauge and per-route latency
/// buckets.
pub async fn track_requests(
    axum::extract::State(state): axum::extract::State<crate::state::AppState>,
    request: Request,
    next: Next,
) -> Response {
    let metrics = state.metrics.clone();
    let route_key = format!(
        "{} {}",
        request.method(),
        normalize_metrics_path(request.uri().path())
    );
    let start = Instant::now();
    metrics.active.fetch_add(1, Ordering::Relaxed);
    let response = next.run(request).await;
    metrics.active.fetch_sub(1, Ordering::Relaxed);
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    metrics.record(&route_key, latency_ms, response.status().as_u16());
    response
}
