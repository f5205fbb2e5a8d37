//! API-key auth middleware.
//!
//! Constant-time key comparison with per-client-address rate limiting on
//! failures (fixed 60-second window, 10 failures). Health probes stay
//! unauthenticated so orchestrators can always reach them.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;

const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const MAX_FAILURES: usize = 10;

const OPEN_PATHS: [&str; 2] = ["/health", "/health/ready"];

pub struct AuthState {
    failures: parking_lot::Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            failures: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when the client has exhausted its failure budget.
    fn rate_limited(&self, ip: IpAddr) -> bool {
        let mut failures = self.failures.lock();
        let entries = failures.entry(ip).or_default();
        entries.retain(|at| at.elapsed() < FAILURE_WINDOW);
        entries.len() >= MAX_FAILURES
    }

    fn record_failure(&self, ip: IpAddr) {
        self.failures.lock().entry(ip).or_default().push(Instant::now());
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Constant-time equality; unequal lengths compare unequal.
pub fn keys_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub async fn verify_api_key(
    State(state): State<crate::state::AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.settings.api_key.as_deref() else {
        return next.run(request).await; // no auth configured
    };
    if OPEN_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let ip = client_ip(&request);
    if state.auth.rate_limited(ip) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(json!({"detail": "Too many failed authentication attempts"})),
        )
            .into_response();
    }

    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !keys_match(provided, expected) {
        state.auth.record_failure(ip);
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({"detail": "Invalid or missing API key"})),
        )
            .into_response();
    }

    next.run(request).await
}
