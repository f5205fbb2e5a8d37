//! HTTP service wrapping the Recall memory engine.
//!
//! Layout mirrors the lifecycle: [`state`] wires the engine, provider, job
//! table, and queue into one `AppState`; [`routes`] exposes the REST
//! surface; [`governor`] owns the background loops (extraction workers, job
//! reaper, memory trim, embedder auto-reload); [`auth`] and [`metrics`] are
//! the two middleware layers.

pub mod auth;
pub mod governor;
pub mod jobs;
pub mod metrics;
pub mod reload;
pub mod routes;
pub mod state;
pub mod trim;

pub use routes::build_router;
pub use state::{AppState, ServerSettings};
