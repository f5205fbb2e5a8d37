//! Extraction pipeline: extract facts -> AUDN decisions -> apply.

use crate::provider::LlmProvider;
use recall_core::{Result, env_int};
use recall_engine::MemoryEngine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

// --- Prompts ---

const FACT_EXTRACTION_PROMPT: &str = r#"Extract durable facts worth remembering from this conversation about the {project} project.

Categorize each fact:
- DECISION: Architectural choices, library selections, design patterns, preferences. WHY something was chosen matters more than WHAT.
- LEARNING: Bug root causes + fixes, gotchas discovered, workarounds, performance findings.
- DETAIL: File paths, API signatures, config values that are project-specific conventions.

Skip anything that fails this test: "Would this still be useful 30 days from now?"

DO NOT extract:
- Task completion status ("done", "all tests pass", "deployed successfully")
- Commit hashes, PR numbers, or branch names
- Counts or metrics ("44 tests", "5 files changed")
- Session-specific context ("currently working on...", "next step is...")
- Generic programming knowledge any developer would know

Output a JSON array of objects: [{"category": "DECISION"|"LEARNING"|"DETAIL", "text": "..."}]
Each fact must be self-contained and understandable without the conversation.
If nothing worth storing, output []."#;

const FACT_EXTRACTION_PROMPT_AGGRESSIVE: &str = r#"Extract durable facts worth remembering from this conversation about the {project} project.
This context is about to be lost permanently. Be thorough but still apply the 30-day test.

Categorize each fact:
- DECISION: Architectural choices, library selections, design patterns, preferences. WHY > WHAT.
- LEARNING: Bug root causes + fixes, gotchas discovered, workarounds, performance findings.
- DETAIL: File paths, API signatures, config values, naming conventions — project-specific patterns.

Include DETAIL-category items you would normally skip — file paths, config patterns, naming conventions.

DO NOT extract:
- Task completion status ("done", "all tests pass", "deployed successfully")
- Commit hashes, PR numbers, or branch names
- Counts or metrics ("44 tests", "5 files changed")
- Session-specific context ("currently working on...", "next step is...")
- Generic programming knowledge any developer would know

Output a JSON array of objects: [{"category": "DECISION"|"LEARNING"|"DETAIL", "text": "..."}]
Each fact must be self-contained and understandable without the conversation.
If nothing worth storing, output []."#;

const AUDN_PROMPT: &str = r#"You are a memory manager. For each new fact, decide what to do given
the existing similar memories.

Actions:
- ADD: No similar memory exists. Store as new.
- UPDATE: An existing memory covers the same topic but the information
  has changed. Provide old_id and new_text that replaces it.
- DELETE: An existing memory is now contradicted or obsolete. Provide old_id.
- NOOP: The fact is already captured by an existing memory. Provide existing_id.

New facts:
{facts_json}

Existing similar memories (per fact):
{similar_json}

Output a JSON array of decisions. Each decision must have:
- "action": "ADD" | "UPDATE" | "DELETE" | "NOOP"
- "fact_index": index of the fact in the input array
- For UPDATE: "old_id" (int) and "new_text" (string)
- For DELETE: "old_id" (int)
- For NOOP: "existing_id" (int)"#;

const AUDN_SYSTEM: &str = "You are a memory manager. Output only valid JSON.";

/// Prompt-budget knobs, resolved once from the environment.
#[derive(Debug, Clone)]
pub struct ExtractLimits {
    pub max_facts: usize,
    pub max_fact_chars: usize,
    pub similar_text_chars: usize,
    pub similar_per_fact: usize,
}

impl ExtractLimits {
    pub fn from_env() -> Self {
        Self {
            max_facts: env_int("EXTRACT_MAX_FACTS", 30, 1) as usize,
            max_fact_chars: env_int("EXTRACT_MAX_FACT_CHARS", 500, 40) as usize,
            similar_text_chars: env_int("EXTRACT_SIMILAR_TEXT_CHARS", 280, 40) as usize,
            similar_per_fact: env_int("EXTRACT_SIMILAR_PER_FACT", 5, 1) as usize,
        }
    }
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_facts: 30,
            max_fact_chars: 500,
            similar_text_chars: 280,
            similar_per_fact: 5,
        }
    }
}

/// An extracted fact with its normalized category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub category: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct StageTokens {
    pub extract: TokenUsage,
    pub audn: TokenUsage,
}

/// Full pipeline result, including the fallback-merge annotations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtractionOutcome {
    pub actions: Vec<Value>,
    pub extracted_count: usize,
    pub stored_count: usize,
    pub updated_count: usize,
    pub deleted_count: usize,
    #[serde(default)]
    pub tokens: StageTokens,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_triggered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_source_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_error: Option<String>,
}

impl ExtractionOutcome {
    pub fn provider_runtime_failure(&self) -> bool {
        self.error.as_deref() == Some("provider_runtime_failure")
    }
}

/// Collapse whitespace and cap length, appending `...` when truncated.
pub fn clip_text(text: &str, max_chars: usize) -> String {
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() <= max_chars {
        return compact;
    }
    let kept: String = compact.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept.trim_end())
}

/// Parse a JSON array from LLM output, tolerating direct JSON, fenced code
/// blocks, and a bare `[ ... ]` substring.
pub fn parse_json_array(text: &str) -> Vec<Value> {
    let text = text.trim();
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
        return items;
    }
    if text.contains("```") {
        for block in text.split("```") {
            let block = block.trim();
            let block = block.strip_prefix("json").map(str::trim).unwrap_or(block);
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(block) {
                return items;
            }
        }
    }
    if let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) {
        if end > start {
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&text[start..=end]) {
                return items;
            }
        }
    }
    Vec::new()
}

fn normalize_category(raw: Option<&str>) -> String {
    let category = raw.unwrap_or("detail").to_lowercase();
    match category.as_str() {
        "decision" | "learning" | "detail" => category,
        _ => "detail".to_string(),
    }
}

fn project_from_source(source: &str) -> &str {
    let project = match source.rsplit_once('/') {
        Some((_, tail)) => tail,
        None => source,
    };
    if project.is_empty() { "this" } else { project }
}

/// Extract categorized facts from conversation text. Returns the facts, an
/// optional provider error message, and token usage.
pub async fn extract_facts(
    provider: &dyn LlmProvider,
    messages: &str,
    context: &str,
    source: &str,
    limits: &ExtractLimits,
) -> (Vec<Fact>, Option<String>, TokenUsage) {
    let system = if context == "pre_compact" {
        FACT_EXTRACTION_PROMPT_AGGRESSIVE
    } else {
        FACT_EXTRACTION_PROMPT
    };
    let system = system.replace("{project}", project_from_source(source));

    let completion = match provider.complete(&system, messages).await {
        Ok(completion) => completion,
        Err(e) => {
            error!("Fact extraction failed: {e}");
            return (Vec::new(), Some(e.to_string()), TokenUsage::default());
        }
    };
    let tokens = TokenUsage {
        input: completion.input_tokens,
        output: completion.output_tokens,
    };

    let mut facts = Vec::new();
    for item in parse_json_array(&completion.text) {
        match item {
            Value::Object(object) => {
                let Some(raw_text) = object.get("text").and_then(Value::as_str) else {
                    continue;
                };
                let text = clip_text(raw_text, limits.max_fact_chars);
                if !text.is_empty() {
                    facts.push(Fact {
                        category: normalize_category(
                            object.get("category").and_then(Value::as_str),
                        ),
                        text,
                    });
                }
            }
            // Backward compat: plain string -> detail
            Value::String(raw_text) if !raw_text.trim().is_empty() => {
                let text = clip_text(&raw_text, limits.max_fact_chars);
                if !text.is_empty() {
                    facts.push(Fact {
                        category: "detail".to_string(),
                        text,
                    });
                }
            }
            _ => {}
        }
    }

    if facts.len() > limits.max_facts {
        info!(
            "Extracted {} facts; keeping first {}",
            facts.len(),
            limits.max_facts
        );
        facts.truncate(limits.max_facts);
    }

    info!("Extracted {} facts (context={context})", facts.len());
    (facts, None, tokens)
}

/// Decide an AUDN action per fact. Providers without AUDN support fall back
/// to a novelty check that only ever yields ADD or NOOP.
pub async fn run_audn(
    provider: &dyn LlmProvider,
    engine: &MemoryEngine,
    facts: &[Fact],
    limits: &ExtractLimits,
) -> (Vec<Value>, TokenUsage) {
    if facts.is_empty() {
        return (Vec::new(), TokenUsage::default());
    }

    if !provider.supports_audn() {
        let mut decisions = Vec::with_capacity(facts.len());
        for (index, fact) in facts.iter().enumerate() {
            let action = match engine
                .is_novel(&fact.text, recall_engine::DEFAULT_NOVELTY_THRESHOLD)
                .await
            {
                Ok((true, _)) => "ADD",
                Ok((false, _)) => "NOOP",
                Err(e) => {
                    warn!("novelty check failed, defaulting to ADD: {e}");
                    "ADD"
                }
            };
            decisions.push(json!({"action": action, "fact_index": index}));
        }
        return (decisions, TokenUsage::default());
    }

    // Gather neighbours per fact via hybrid retrieval.
    let mut facts_payload = Vec::with_capacity(facts.len());
    let mut similar_payload = Map::new();
    for (index, fact) in facts.iter().enumerate() {
        facts_payload.push(json!({
            "index": index,
            "text": clip_text(&fact.text, limits.max_fact_chars),
            "category": fact.category,
        }));
        let neighbours = engine
            .hybrid_search(&fact.text, limits.similar_per_fact, None, 0.7, None)
            .await
            .unwrap_or_default();
        let entries: Vec<Value> = neighbours
            .iter()
            .take(limits.similar_per_fact)
            .map(|neighbour| {
                let similarity = neighbour
                    .similarity
                    .or(neighbour.rrf_score)
                    .unwrap_or(0.0);
                json!({
                    "id": neighbour.record.id,
                    "text": clip_text(&neighbour.record.text, limits.similar_text_chars),
                    "similarity": (similarity * 1_000.0).round() / 1_000.0,
                })
            })
            .collect();
        similar_payload.insert(index.to_string(), Value::Array(entries));
    }

    let prompt = AUDN_PROMPT
        .replace(
            "{facts_json}",
            &Value::Array(facts_payload).to_string(),
        )
        .replace(
            "{similar_json}",
            &Value::Object(similar_payload).to_string(),
        );

    match provider.complete(AUDN_SYSTEM, &prompt).await {
        Ok(completion) => {
            let tokens = TokenUsage {
                input: completion.input_tokens,
                output: completion.output_tokens,
            };
            let decisions = parse_json_array(&completion.text)
                .into_iter()
                .filter_map(|mut decision| {
                    let object = decision.as_object_mut()?;
                    let action = object.get("action")?.as_str()?.to_uppercase();
                    object.insert("action".to_string(), json!(action));
                    Some(decision)
                })
                .collect();
            (decisions, tokens)
        }
        Err(e) => {
            error!("AUDN cycle failed: {e}");
            let decisions = (0..facts.len())
                .map(|index| json!({"action": "ADD", "fact_index": index}))
                .collect();
            (decisions, TokenUsage::default())
        }
    }
}

/// Apply AUDN decisions. Per-action failures are captured per fact and do
/// not abort the job.
pub async fn execute_actions(
    engine: &MemoryEngine,
    decisions: &[Value],
    facts: &[Fact],
    source: &str,
) -> ExtractionOutcome {
    let mut outcome = ExtractionOutcome::default();

    for decision in decisions {
        let action = decision
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_uppercase();
        let fact_index = decision
            .get("fact_index")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        let fact = usize::try_from(fact_index)
            .ok()
            .and_then(|index| facts.get(index));
        let fact_text = fact.map(|f| f.text.clone()).unwrap_or_default();
        let category = fact
            .map(|f| f.category.clone())
            .unwrap_or_else(|| "detail".to_string());

        let applied: Result<()> = async {
            match action.as_str() {
                "ADD" => {
                    let mut metadata = recall_core::Metadata::new();
                    metadata.insert("category".to_string(), json!(category));
                    let ids = engine
                        .add_memories(
                            std::slice::from_ref(&fact_text),
                            &[source.to_string()],
                            Some(&[Some(metadata)]),
                            true,
                            recall_engine::DEFAULT_DEDUP_THRESHOLD,
                        )
                        .await?;
                    outcome.actions.push(json!({
                        "action": "add",
                        "text": &fact_text,
                        "id": ids.first(),
                    }));
                    outcome.stored_count += 1;
                }
                "UPDATE" => {
                    let old_id = decision.get("old_id").and_then(Value::as_i64);
                    let new_text = decision
                        .get("new_text")
                        .and_then(Value::as_str)
                        .unwrap_or(&fact_text)
                        .to_string();
                    if let Some(old_id) = old_id {
                        engine.delete_memory(old_id).await?;
                    }
                    let mut metadata = recall_core::Metadata::new();
                    metadata.insert("category".to_string(), json!(category));
                    if let Some(old_id) = old_id {
                        metadata.insert("supersedes".to_string(), json!(old_id));
                    }
                    let ids = engine
                        .add_memories(
                            std::slice::from_ref(&new_text),
                            &[source.to_string()],
                            Some(&[Some(metadata)]),
                            false,
                            recall_engine::DEFAULT_DEDUP_THRESHOLD,
                        )
                        .await?;
                    outcome.actions.push(json!({
                        "action": "update",
                        "old_id": old_id,
                        "text": new_text,
                        "new_id": ids.first(),
                    }));
                    outcome.updated_count += 1;
                }
                "DELETE" => {
                    if let Some(old_id) = decision.get("old_id").and_then(Value::as_i64) {
                        engine.delete_memory(old_id).await?;
                        outcome.actions.push(json!({
                            "action": "delete",
                            "old_id": old_id,
                        }));
                        outcome.deleted_count += 1;
                    }
                }
                "NOOP" => {
                    outcome.actions.push(json!({
                        "action": "noop",
                        "text": &fact_text,
                        "existing_id": decision.get("existing_id"),
                    }));
                }
                _ => {}
            }
            Ok(())
        }
        .await;

        if let Err(e) = applied {
            error!(
                "Failed to execute {action} for fact '{}': {e}",
                clip_text(&fact_text, 50)
            );
            outcome.actions.push(json!({
                "action": "error",
                "text": fact_text,
                "error": e.to_string(),
            }));
        }
    }

    outcome
}

/// Full extraction pipeline: extract facts -> AUDN -> execute.
pub async fn run_extraction(
    provider: &dyn LlmProvider,
    engine: &MemoryEngine,
    messages: &str,
    source: &str,
    context: &str,
) -> ExtractionOutcome {
    let limits = ExtractLimits::from_env();

    let (facts, extract_error, extract_tokens) =
        extract_facts(provider, messages, context, source, &limits).await;

    if let Some(message) = extract_error {
        return ExtractionOutcome {
            error: Some("provider_runtime_failure".to_string()),
            error_stage: Some("extract_facts".to_string()),
            error_message: Some(message),
            tokens: StageTokens {
                extract: extract_tokens,
                audn: TokenUsage::default(),
            },
            ..Default::default()
        };
    }

    if facts.is_empty() {
        return ExtractionOutcome {
            tokens: StageTokens {
                extract: extract_tokens,
                audn: TokenUsage::default(),
            },
            ..Default::default()
        };
    }

    let (decisions, audn_tokens) = run_audn(provider, engine, &facts, &limits).await;

    let mut outcome = execute_actions(engine, &decisions, &facts, source).await;
    outcome.extracted_count = facts.len();
    outcome.tokens = StageTokens {
        extract: extract_tokens,
        audn: audn_tokens,
    };

    info!(
        "Extraction complete: {} extracted, {} stored, {} updated, {} deleted",
        outcome.extracted_count,
        outcome.stored_count,
        outcome.updated_count,
        outcome.deleted_count
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_direct_json() {
        let items = parse_json_array(r#"[{"a": 1}, {"a": 2}]"#);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_parse_fenced_block() {
        let items = parse_json_array("Here you go:\n```json\n[\"one\", \"two\"]\n```\nDone.");
        assert_eq!(items, vec![json!("one"), json!("two")]);
    }

    #[test]
    fn test_parse_embedded_array() {
        let items = parse_json_array("The decisions are [1, 2, 3] as requested.");
        assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_parse_garbage_yields_empty() {
        assert!(parse_json_array("no json here").is_empty());
        assert!(parse_json_array("{\"an\": \"object\"}").is_empty());
    }

    #[test]
    fn test_clip_text_collapses_and_truncates() {
        assert_eq!(clip_text("  a \n b\t c ", 100), "a b c");
        let clipped = clip_text(&"word ".repeat(50), 43);
        assert!(clipped.chars().count() <= 43);
        assert!(clipped.ends_with("..."));
    }

    #[test]
    fn test_normalize_category() {
        assert_eq!(normalize_category(Some("DECISION")), "decision");
        assert_eq!(normalize_category(Some("mystery")), "detail");
        assert_eq!(normalize_category(None), "detail");
    }

    #[test]
    fn test_project_from_source() {
        assert_eq!(project_from_source("claude-code/my-app"), "my-app");
        assert_eq!(project_from_source("solo"), "solo");
        assert_eq!(project_from_source(""), "this");
    }
}
