//! Environment parsing helpers and the persisted store configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Parse a boolean env var, accepting the usual truthy spellings.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(
            raw.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Parse an integer env var with a fallback and lower bound.
pub fn env_int(name: &str, default: u64, minimum: u64) -> u64 {
    let raw = std::env::var(name).unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return default.max(minimum);
    }
    match raw.parse::<u64>() {
        Ok(value) => value.max(minimum),
        Err(_) => {
            warn!("Invalid {}={:?}; using default {}", name, raw, default);
            default.max(minimum)
        }
    }
}

/// Parse a float env var with a fallback and lower bound.
pub fn env_float(name: &str, default: f64, minimum: f64) -> f64 {
    let raw = std::env::var(name).unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return default.max(minimum);
    }
    match raw.parse::<f64>() {
        Ok(value) => value.max(minimum),
        Err(_) => {
            warn!("Invalid {}={:?}; using default {:.2}", name, raw, default);
            default.max(minimum)
        }
    }
}

/// Read a trimmed string env var, empty meaning unset.
pub fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Persisted `config.json`: which embedder produced the vectors and when the
/// store last changed. Restored snapshots carry this file alongside metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub model: String,
    pub embed_provider: String,
    pub dimension: usize,
    pub storage_backend: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl StoreConfig {
    pub fn new(model: impl Into<String>, embed_provider: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            embed_provider: embed_provider.into(),
            dimension,
            storage_backend: "qdrant".to_string(),
            created_at: Utc::now(),
            last_updated: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_int_bounds() {
        // Unset falls back to the default, clamped by the minimum.
        assert_eq!(env_int("RECALL_TEST_UNSET_INT", 5, 1), 5);
        assert_eq!(env_int("RECALL_TEST_UNSET_INT", 0, 3), 3);
    }

    #[test]
    fn test_store_config_round_trip() {
        let mut config = StoreConfig::new("all-MiniLM-L6-v2", "onnx", 384);
        config.touch();
        let text = serde_json::to_string_pretty(&config).unwrap();
        let back: StoreConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.dimension, 384);
        assert!(back.last_updated.is_some());
    }
}
