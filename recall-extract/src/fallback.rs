//! Heuristic add-only extraction for provider outages.
//!
//! Intentionally conservative: a line must look like a decision, clear the
//! length and word-count bounds, and pass the novelty check before it is
//! stored. When unsure, emit nothing.

use crate::pipeline::ExtractionOutcome;
use recall_core::{Result, env_float, env_int};
use recall_engine::MemoryEngine;
use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;

static DECISION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(decide(?:d|s|ing)?|decision|prefer|standard|policy|we\s+should|we\s+will|let'?s|going\s+with|use\s+[a-z0-9_.-]+|remember\s+)\b",
    )
    .unwrap()
});
static SPEAKER_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(User|Assistant)\s*:\s*").unwrap());

/// Knobs for the fallback extractor.
#[derive(Debug, Clone)]
pub struct FallbackLimits {
    pub max_facts: usize,
    pub min_fact_chars: usize,
    pub max_fact_chars: usize,
    pub novelty_threshold: f64,
}

impl FallbackLimits {
    pub fn from_env() -> Self {
        Self {
            max_facts: env_int("EXTRACT_FALLBACK_MAX_FACTS", 1, 1) as usize,
            min_fact_chars: env_int("EXTRACT_FALLBACK_MIN_FACT_CHARS", 24, 5) as usize,
            max_fact_chars: env_int("EXTRACT_FALLBACK_MAX_FACT_CHARS", 280, 32) as usize,
            novelty_threshold: env_float("EXTRACT_FALLBACK_NOVELTY_THRESHOLD", 0.88, 0.0)
                .min(1.0),
        }
    }
}

impl Default for FallbackLimits {
    fn default() -> Self {
        Self {
            max_facts: 1,
            min_fact_chars: 24,
            max_fact_chars: 280,
            novelty_threshold: 0.88,
        }
    }
}

fn normalize_candidate(line: &str) -> String {
    let compact = line.split_whitespace().collect::<Vec<_>>().join(" ");
    SPEAKER_PREFIX.replace(&compact, "").trim().to_string()
}

/// Extract a tiny set of high-confidence fact candidates from raw
/// transcript text.
pub fn fallback_extract_facts(messages: &str, limits: &FallbackLimits) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for raw_line in messages.lines() {
        let line = normalize_candidate(raw_line);
        if line.is_empty()
            || line.ends_with('?')
            || line.chars().count() < limits.min_fact_chars
            || line.chars().count() > limits.max_fact_chars
            || line.split_whitespace().count() < 4
            || !DECISION_PATTERN.is_match(&line)
        {
            continue;
        }
        let lowered = line.to_lowercase();
        if ["ok ", "okay ", "sure ", "thanks", "thank you"]
            .iter()
            .any(|prefix| lowered.starts_with(prefix))
        {
            continue;
        }
        if seen.insert(line.clone()) {
            candidates.push(line);
        }
        if candidates.len() >= limits.max_facts {
            break;
        }
    }
    candidates
}

/// Fallback add-only extraction path for disabled or runtime-failed
/// providers.
pub async fn run_fallback_extraction(
    engine: &MemoryEngine,
    messages: &str,
    source: &str,
    context: &str,
) -> Result<ExtractionOutcome> {
    let limits = FallbackLimits::from_env();
    let facts = fallback_extract_facts(messages, &limits);
    let source_value = if source.is_empty() {
        "extract/fallback"
    } else {
        source
    };

    let mut outcome = ExtractionOutcome {
        extracted_count: facts.len(),
        mode: Some("fallback_add".to_string()),
        ..Default::default()
    };

    for fact in facts {
        let (is_new, similar) = engine.is_novel(&fact, limits.novelty_threshold).await?;
        if is_new {
            let mut metadata = recall_core::Metadata::new();
            metadata.insert("extraction_mode".to_string(), json!("fallback_add"));
            metadata.insert("context".to_string(), json!(context));
            let ids = engine
                .add_memories(
                    std::slice::from_ref(&fact),
                    &[source_value.to_string()],
                    Some(&[Some(metadata)]),
                    false,
                    recall_engine::DEFAULT_DEDUP_THRESHOLD,
                )
                .await?;
            if let Some(&id) = ids.first() {
                outcome.stored_count += 1;
                outcome.actions.push(json!({
                    "action": "add",
                    "text": fact,
                    "id": id,
                    "mode": "fallback_add",
                }));
            }
        } else {
            outcome.actions.push(json!({
                "action": "noop",
                "text": fact,
                "mode": "fallback_add",
                "matched_id": similar.as_ref().map(|m| m.record.id),
                "similarity": similar.as_ref().and_then(|m| m.similarity),
            }));
        }
    }

    Ok(outcome)
}

/// Merge a fallback result over a failed primary result, annotating the
/// fallback trigger for the caller.
pub fn merge_runtime_fallback(
    primary: &ExtractionOutcome,
    fallback: ExtractionOutcome,
) -> ExtractionOutcome {
    ExtractionOutcome {
        fallback_triggered: Some(true),
        fallback_reason: primary.error.clone(),
        fallback_source_stage: primary.error_stage.clone(),
        primary_error: primary.error_message.clone(),
        ..fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_lines_extracted() {
        let limits = FallbackLimits {
            max_facts: 5,
            ..Default::default()
        };
        let transcript = "\
User: should we use postgres or mysql?\n\
Assistant: We decided to use postgres for the main database layer.\n\
ok sounds good to me then\n\
Assistant: deploy finished\n";
        let facts = fallback_extract_facts(transcript, &limits);
        assert_eq!(
            facts,
            vec!["We decided to use postgres for the main database layer."]
        );
    }

    #[test]
    fn test_questions_and_short_lines_skipped() {
        let limits = FallbackLimits::default();
        assert!(fallback_extract_facts("Should we use redis for caching maybe?", &limits).is_empty());
        assert!(fallback_extract_facts("use redis", &limits).is_empty());
    }

    #[test]
    fn test_speaker_prefix_stripped_and_deduped() {
        let limits = FallbackLimits {
            max_facts: 5,
            ..Default::default()
        };
        let transcript = "\
Assistant: Going with axum for the HTTP framework layer.\n\
assistant: Going with axum for the HTTP framework layer.\n";
        let facts = fallback_extract_facts(transcript, &limits);
        assert_eq!(facts.len(), 1);
        assert!(!facts[0].to_lowercase().starts_with("assistant"));
    }

    #[test]
    fn test_max_facts_cap() {
        let limits = FallbackLimits {
            max_facts: 1,
            ..Default::default()
        };
        let transcript = "\
We decided to use postgres for the primary database.\n\
We decided to use redis for the cache layer.\n";
        assert_eq!(fallback_extract_facts(transcript, &limits).len(), 1);
    }

    #[test]
    fn test_merge_annotates_fallback() {
        let primary = ExtractionOutcome {
            error: Some("provider_runtime_failure".to_string()),
            error_stage: Some("extract_facts".to_string()),
            error_message: Some("boom".to_string()),
            ..Default::default()
        };
        let fallback = ExtractionOutcome {
            stored_count: 1,
            mode: Some("fallback_add".to_string()),
            ..Default::default()
        };
        let merged = merge_runtime_fallback(&primary, fallback);
        assert_eq!(merged.fallback_triggered, Some(true));
        assert_eq!(merged.fallback_reason.as_deref(), Some("provider_runtime_failure"));
        assert_eq!(merged.primary_error.as_deref(), Some("boom"));
        assert_eq!(merged.stored_count, 1);
    }
}
