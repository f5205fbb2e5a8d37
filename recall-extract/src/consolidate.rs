//! Consolidation and pruning for long-lived memory stores.
//!
//! Finds clusters of redundant memories via hybrid retrieval, merges each
//! cluster into 1-2 concise records through the LLM provider, and surfaces
//! stale never-retrieved memories as prune candidates.

use crate::pipeline::parse_json_array;
use crate::provider::LlmProvider;
use chrono::Utc;
use recall_core::{Metadata, MemoryRecord, Result};
use recall_engine::MemoryEngine;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};

const CONSOLIDATION_PROMPT: &str = r#"These {n} memories are about the same topic in the {project} project.
Consolidate them into 1-2 concise memories that capture ALL unique information.
Drop redundant or overlapping details. Preserve: decisions and reasoning, bug fixes, conventions.

Memories to consolidate:
{memories_json}

Output a JSON array of consolidated text strings. Each must be self-contained."#;

const CONSOLIDATION_SYSTEM: &str =
    "You are a memory consolidation assistant. Output only valid JSON.";

// Categories that use the longer retention threshold.
const LONG_LIVED_CATEGORIES: [&str; 2] = ["decision", "learning"];

/// Group memories by semantic similarity into clusters of at least
/// `min_cluster_size`, using the hybrid `rrf_score` as the similarity proxy.
pub async fn find_clusters(
    engine: &MemoryEngine,
    source_prefix: &str,
    similarity_threshold: f64,
    min_cluster_size: usize,
) -> Result<Vec<Vec<MemoryRecord>>> {
    let candidates = engine
        .list_memories(0, usize::MAX, (!source_prefix.is_empty()).then_some(source_prefix))
        .await
        .memories;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let mut clustered: HashSet<i64> = HashSet::new();
    let mut clusters: Vec<Vec<MemoryRecord>> = Vec::new();

    for seed in &candidates {
        if clustered.contains(&seed.id) {
            continue;
        }
        let prefix = (!source_prefix.is_empty()).then_some(source_prefix);
        let similar = engine
            .hybrid_search(&seed.text, 10, None, 0.7, prefix)
            .await?;

        let mut cluster = vec![seed.clone()];
        let mut cluster_ids: HashSet<i64> = HashSet::from([seed.id]);
        for hit in similar {
            if hit.record.id == seed.id || clustered.contains(&hit.record.id) {
                continue;
            }
            let score = hit.rrf_score.or(hit.similarity).unwrap_or(0.0);
            if score >= similarity_threshold {
                cluster_ids.insert(hit.record.id);
                cluster.push(hit.record);
            }
        }

        if cluster.len() >= min_cluster_size {
            clustered.extend(cluster_ids);
            clusters.push(cluster);
        }
    }

    Ok(clusters)
}

fn dominant_category(cluster: &[MemoryRecord]) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for record in cluster {
        *counts
            .entry(record.category.as_deref().unwrap_or("detail"))
            .or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|&(_, count)| count)
        .map(|(category, _)| category.to_string())
        .unwrap_or_else(|| "detail".to_string())
}

fn infer_project(cluster: &[MemoryRecord]) -> String {
    for record in cluster {
        let parts: Vec<&str> = record.source.split('/').collect();
        if parts.len() > 1 && !parts[parts.len() - 1].is_empty() {
            return parts[parts.len() - 1].to_string();
        }
        if let Some(first) = parts.first() {
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    "unknown".to_string()
}

/// Result of consolidating one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationResult {
    pub merged_count: usize,
    pub new_count: usize,
    pub old_ids: Vec<i64>,
    pub new_texts: Vec<String>,
    pub dry_run: bool,
}

/// LLM-merge a cluster of similar memories into 1-2 concise facts. On a live
/// run the old records are deleted and the merged texts stored with a
/// `consolidated_from` audit trail.
pub async fn consolidate_cluster(
    provider: &dyn LlmProvider,
    engine: &MemoryEngine,
    cluster: &[MemoryRecord],
    dry_run: bool,
) -> Result<ConsolidationResult> {
    let old_ids: Vec<i64> = cluster.iter().map(|record| record.id).collect();
    let project = infer_project(cluster);
    let category = dominant_category(cluster);

    let memories_json: Vec<Value> = cluster
        .iter()
        .map(|record| {
            json!({
                "id": record.id,
                "text": record.text,
                "category": record.category.as_deref().unwrap_or("DETAIL"),
            })
        })
        .collect();

    let prompt = CONSOLIDATION_PROMPT
        .replace("{n}", &cluster.len().to_string())
        .replace("{project}", &project)
        .replace(
            "{memories_json}",
            &serde_json::to_string_pretty(&memories_json)?,
        );

    let completion = provider.complete(CONSOLIDATION_SYSTEM, &prompt).await?;

    let parsed = parse_json_array(&completion.text);
    let new_texts: Vec<String> = if parsed.is_empty() {
        // Fallback: treat the entire response as one consolidated memory.
        vec![completion.text.trim().to_string()]
    } else {
        parsed
            .into_iter()
            .map(|value| match value {
                Value::String(text) => text,
                other => other.to_string(),
            })
            .collect()
    };

    if !dry_run {
        engine.delete_memories(&old_ids).await?;

        let source = cluster
            .first()
            .map(|record| record.source.clone())
            .unwrap_or_else(|| "consolidated".to_string());
        let metadata: Vec<Option<Metadata>> = new_texts
            .iter()
            .map(|_| {
                let mut meta = Metadata::new();
                meta.insert("category".to_string(), json!(category));
                meta.insert("consolidated_from".to_string(), json!(old_ids));
                Some(meta)
            })
            .collect();
        let sources = vec![source; new_texts.len()];
        engine
            .add_memories(&new_texts, &sources, Some(&metadata), false, 0.90)
            .await?;
    }

    Ok(ConsolidationResult {
        merged_count: cluster.len(),
        new_count: new_texts.len(),
        old_ids,
        new_texts,
        dry_run,
    })
}

/// Identify stale, never-retrieved memories that exceed their category's age
/// threshold.
pub fn find_prune_candidates(
    all_memories: &[MemoryRecord],
    unretrieved_ids: &[i64],
    detail_days: i64,
    decision_days: i64,
) -> Vec<MemoryRecord> {
    let unretrieved: HashSet<i64> = unretrieved_ids.iter().copied().collect();
    let now = Utc::now();

    all_memories
        .iter()
        .filter(|record| unretrieved.contains(&record.id))
        .filter(|record| {
            let age_days = (now - record.created_at).num_days();
            let category = record
                .category
                .as_deref()
                .unwrap_or("detail")
                .to_lowercase();
            let threshold = if LONG_LIVED_CATEGORIES.contains(&category.as_str()) {
                decision_days
            } else {
                detail_days
            };
            age_days > threshold
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: i64, text: &str, category: Option<&str>, age_days: i64) -> MemoryRecord {
        let mut record = MemoryRecord::build(id, text, "proj/app", Utc::now(), None);
        record.category = category.map(str::to_owned);
        record.created_at = Utc::now() - Duration::days(age_days);
        record
    }

    #[test]
    fn test_dominant_category() {
        let cluster = vec![
            record(1, "a", Some("decision"), 0),
            record(2, "b", Some("decision"), 0),
            record(3, "c", Some("detail"), 0),
        ];
        assert_eq!(dominant_category(&cluster), "decision");
    }

    #[test]
    fn test_infer_project_from_source() {
        let cluster = vec![record(1, "a", None, 0)];
        assert_eq!(infer_project(&cluster), "app");
    }

    #[test]
    fn test_prune_thresholds_by_category() {
        let memories = vec![
            record(1, "old detail", Some("detail"), 90),
            record(2, "old decision", Some("decision"), 90),
            record(3, "ancient decision", Some("decision"), 200),
            record(4, "old but retrieved", Some("detail"), 90),
        ];
        let candidates = find_prune_candidates(&memories, &[1, 2, 3], 60, 120);
        let ids: Vec<i64> = candidates.iter().map(|record| record.id).collect();
        // detail over 60d and decision over 120d qualify; the retrieved one
        // never does.
        assert_eq!(ids, vec![1, 3]);
    }
}
