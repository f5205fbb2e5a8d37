//! Memory record data model.
//!
//! A memory is a short text fact with a path-like `source`, timestamps, an
//! optional audit trail (`supersedes`, `previous_text`, `consolidated_from`)
//! and arbitrary user metadata. User metadata may never clobber the system
//! fields; reserved keys are silently dropped rather than rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// User-supplied metadata attached to a memory.
pub type Metadata = BTreeMap<String, Value>;

/// Keys owned by the system. User metadata patches cannot set any of these;
/// the add path additionally allows `entity_key` so upserts can tag records.
pub const RESERVED_KEYS: [&str; 7] = [
    "id",
    "text",
    "source",
    "timestamp",
    "created_at",
    "updated_at",
    "entity_key",
];

/// One stored memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub id: i64,
    pub text: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Legacy alias for `created_at`, kept for wire compatibility.
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidated_from: Option<Vec<i64>>,
    /// Remaining user metadata, flattened into the record on the wire.
    #[serde(flatten)]
    pub extra: Metadata,
}

impl MemoryRecord {
    /// Build a fresh record from the system fields plus user metadata.
    /// Reserved keys in `metadata` are dropped; the well-known audit keys
    /// are lifted into their typed fields.
    pub fn build(
        id: i64,
        text: impl Into<String>,
        source: impl Into<String>,
        now: DateTime<Utc>,
        metadata: Option<Metadata>,
    ) -> Self {
        let mut record = Self {
            id,
            text: text.into(),
            source: source.into(),
            created_at: now,
            updated_at: now,
            timestamp: now,
            entity_key: None,
            category: None,
            supersedes: None,
            previous_text: None,
            consolidated_from: None,
            extra: Metadata::new(),
        };
        if let Some(meta) = metadata {
            record.apply_user_metadata(meta, true);
        }
        record
    }

    /// Merge user metadata into this record. Reserved keys are ignored;
    /// `entity_key` is only honored when `allow_entity_key` (the add path).
    pub fn apply_user_metadata(&mut self, metadata: Metadata, allow_entity_key: bool) {
        for (key, value) in metadata {
            match key.as_str() {
                "entity_key" if allow_entity_key => {
                    self.entity_key = value.as_str().map(str::to_owned);
                }
                "category" => {
                    self.category = value.as_str().map(str::to_owned);
                }
                "supersedes" => {
                    self.supersedes = value.as_i64();
                }
                "previous_text" => {
                    self.previous_text = value.as_str().map(str::to_owned);
                }
                "consolidated_from" => {
                    self.consolidated_from = value.as_array().map(|items| {
                        items.iter().filter_map(Value::as_i64).collect()
                    });
                }
                _ if RESERVED_KEYS.contains(&key.as_str()) => {}
                _ => {
                    self.extra.insert(key, value);
                }
            }
        }
    }

    /// Payload stored alongside the vector point: the record minus its id.
    pub fn point_payload(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("id");
        }
        value
    }
}

/// A search hit: the record plus its retrieval score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMatch {
    #[serde(flatten)]
    pub record: MemoryRecord,
    /// Cosine similarity from the vector leg, rounded to 6 places.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    /// Reciprocal rank fusion score, rounded to 6 places.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrf_score: Option<f64>,
}

/// Round to six decimal places, the precision scores are reported with.
pub fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: &[(&str, Value)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_reserved_keys_stripped_on_build() {
        let record = MemoryRecord::build(
            7,
            "uses tokio",
            "proj/notes",
            Utc::now(),
            Some(meta(&[
                ("id", json!(999)),
                ("text", json!("evil")),
                ("created_at", json!("1999-01-01T00:00:00Z")),
                ("priority", json!("high")),
            ])),
        );
        assert_eq!(record.id, 7);
        assert_eq!(record.text, "uses tokio");
        assert_eq!(record.extra.get("priority"), Some(&json!("high")));
        assert!(!record.extra.contains_key("id"));
        assert!(!record.extra.contains_key("text"));
    }

    #[test]
    fn test_entity_key_allowed_on_add_only() {
        let now = Utc::now();
        let mut record = MemoryRecord::build(
            1,
            "t",
            "s",
            now,
            Some(meta(&[("entity_key", json!("db-choice"))])),
        );
        assert_eq!(record.entity_key.as_deref(), Some("db-choice"));

        record.apply_user_metadata(meta(&[("entity_key", json!("other"))]), false);
        assert_eq!(record.entity_key.as_deref(), Some("db-choice"));
    }

    #[test]
    fn test_audit_fields_lifted_from_metadata() {
        let record = MemoryRecord::build(
            2,
            "t",
            "s",
            Utc::now(),
            Some(meta(&[
                ("category", json!("decision")),
                ("supersedes", json!(1)),
                ("consolidated_from", json!([3, 4])),
            ])),
        );
        assert_eq!(record.category.as_deref(), Some("decision"));
        assert_eq!(record.supersedes, Some(1));
        assert_eq!(record.consolidated_from, Some(vec![3, 4]));
        assert!(record.extra.is_empty());
    }

    #[test]
    fn test_point_payload_drops_id() {
        let record = MemoryRecord::build(9, "t", "s", Utc::now(), None);
        let payload = record.point_payload();
        assert!(payload.get("id").is_none());
        assert_eq!(payload.get("text"), Some(&json!("t")));
    }

    #[test]
    fn test_round_trip_serialization() {
        let record = MemoryRecord::build(
            5,
            "fact",
            "a/b",
            Utc::now(),
            Some(meta(&[("weight", json!(0.5))])),
        );
        let text = serde_json::to_string(&record).unwrap();
        let back: MemoryRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_round6() {
        assert_eq!(round6(0.123_456_789), 0.123_457);
        assert_eq!(round6(1.0), 1.0);
    }
}
