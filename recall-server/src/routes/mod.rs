//! REST surface: route assembly and the error -> status mapping.

pub mod admin;
pub mod extract;
pub mod health;
pub mod memory;
pub mod search;

use crate::state::AppState;
use axum::{
    Router,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
};
use recall_core::RecallError;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

/// Engine errors mapped onto HTTP statuses. Internal details never reach a
/// 5xx body.
pub struct ApiError(RecallError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<RecallError> for ApiError {
    fn from(error: RecallError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.0 {
            RecallError::NotFound { .. } => {
                (StatusCode::NOT_FOUND, detail(self.0.to_string())).into_response()
            }
            RecallError::InvalidArgument(message) => {
                (StatusCode::BAD_REQUEST, detail(message.clone())).into_response()
            }
            RecallError::FailedPrecondition(message) => {
                (StatusCode::CONFLICT, detail(message.clone())).into_response()
            }
            RecallError::ResourceExhausted {
                message,
                retry_after_sec,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_sec.to_string())],
                detail(message.clone()),
            )
                .into_response(),
            e if e.is_unavailable() => {
                error!("dependency unavailable: {e}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    detail("Service dependency unavailable".to_string()),
                )
                    .into_response()
            }
            e => {
                error!("internal error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    detail("Internal server error".to_string()),
                )
                    .into_response()
            }
        }
    }
}

fn detail(message: String) -> axum::Json<serde_json::Value> {
    axum::Json(json!({ "detail": message }))
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(RecallError::invalid_argument(message))
}

/// Assemble the full application router with auth, metrics, tracing, and
/// CORS layers.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(search::routes())
        .merge(memory::routes())
        .merge(admin::routes())
        .merge(extract::routes())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::verify_api_key,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::metrics::track_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
