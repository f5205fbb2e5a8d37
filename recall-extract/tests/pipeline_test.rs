//! Extraction pipeline tests against a real engine (local store, hash
//! embedder) and a scripted provider.

use recall_embed::{Embedder, HashEmbedder};
use recall_engine::{EmbedderFactory, EngineOptions, MemoryEngine};
use recall_extract::{
    MockProvider, fallback::FallbackLimits, merge_runtime_fallback, run_extraction,
    run_fallback_extraction,
};
use recall_storage::LocalVectorStore;
use std::path::Path;
use std::sync::Arc;

const DIM: usize = 768;

async fn engine_in(dir: &Path) -> MemoryEngine {
    let factory: EmbedderFactory =
        Arc::new(|| Ok(Box::new(HashEmbedder::new(DIM)) as Box<dyn Embedder>));
    MemoryEngine::new(EngineOptions {
        data_dir: dir.to_path_buf(),
        store: Arc::new(LocalVectorStore::in_memory()),
        embedder_factory: factory,
        cloud: None,
        max_backups: 10,
    })
    .await
    .unwrap()
}

async fn seed_typescript_memory(engine: &MemoryEngine) -> i64 {
    engine
        .add_memories(
            &["TypeScript strict mode".to_string()],
            &["claude-code/app".to_string()],
            None,
            false,
            0.90,
        )
        .await
        .unwrap()[0]
}

const FACTS_JSON: &str = r#"[
    {"category": "DECISION", "text": "Uses Drizzle ORM"},
    {"category": "DETAIL", "text": "TypeScript strict mode"}
]"#;

#[tokio::test]
async fn test_audn_add_and_noop() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    let existing_id = seed_typescript_memory(&engine).await;

    let decisions = format!(
        r#"[{{"action":"ADD","fact_index":0}},{{"action":"NOOP","fact_index":1,"existing_id":{existing_id}}}]"#
    );
    let provider = MockProvider::new(vec![FACTS_JSON, &decisions], true);

    let outcome = run_extraction(
        &provider,
        &engine,
        "conversation text",
        "claude-code/app",
        "stop",
    )
    .await;

    assert_eq!(outcome.extracted_count, 2);
    assert_eq!(outcome.stored_count, 1);
    assert_eq!(outcome.updated_count, 0);
    assert_eq!(outcome.deleted_count, 0);
    assert!(outcome.error.is_none());
    assert_eq!(engine.count_memories(None).await, 2);

    // Token usage reported per stage.
    assert_eq!(outcome.tokens.extract.input, 10);
    assert_eq!(outcome.tokens.audn.input, 10);

    // The new record carries its category.
    let results = engine.search("Uses Drizzle ORM", 1, None, None).await.unwrap();
    assert_eq!(results[0].record.category.as_deref(), Some("decision"));

    let noop = outcome
        .actions
        .iter()
        .find(|action| action["action"] == "noop")
        .unwrap();
    assert_eq!(noop["existing_id"], serde_json::json!(existing_id));
}

#[tokio::test]
async fn test_audn_update_supersedes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    let old_id = seed_typescript_memory(&engine).await;

    let facts = r#"[{"category": "DECISION", "text": "TypeScript strict mode disabled"}]"#;
    let decisions = format!(
        r#"[{{"action":"UPDATE","fact_index":0,"old_id":{old_id},"new_text":"TypeScript strict mode disabled"}}]"#
    );
    let provider = MockProvider::new(vec![facts, &decisions], true);

    let outcome = run_extraction(&provider, &engine, "chat", "claude-code/app", "stop").await;
    assert_eq!(outcome.updated_count, 1);
    assert!(engine.get_memory(old_id).await.unwrap_err().is_not_found());

    let results = engine
        .search("TypeScript strict mode disabled", 1, None, None)
        .await
        .unwrap();
    assert_eq!(results[0].record.supersedes, Some(old_id));
}

#[tokio::test]
async fn test_novelty_fallback_for_non_audn_provider() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    seed_typescript_memory(&engine).await;

    // One scripted response: the fact extraction. The decision stage runs on
    // the engine's novelty check instead of a second LLM call.
    let provider = MockProvider::new(vec![FACTS_JSON], false);

    let outcome = run_extraction(&provider, &engine, "chat", "claude-code/app", "stop").await;
    assert_eq!(outcome.extracted_count, 2);
    assert_eq!(outcome.stored_count, 1); // drizzle added, typescript noop'd
    assert_eq!(engine.count_memories(None).await, 2);
    assert_eq!(outcome.tokens.audn.input, 0);
}

#[tokio::test]
async fn test_provider_failure_reports_runtime_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;

    let provider = MockProvider::new(vec![], true); // exhausted immediately

    let outcome = run_extraction(&provider, &engine, "chat", "s", "stop").await;
    assert!(outcome.provider_runtime_failure());
    assert_eq!(outcome.error_stage.as_deref(), Some("extract_facts"));
    assert_eq!(outcome.stored_count, 0);
    assert_eq!(engine.count_memories(None).await, 0);
}

#[tokio::test]
async fn test_runtime_fallback_merge_path() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;

    let provider = MockProvider::new(vec![], true);
    let primary = run_extraction(
        &provider,
        &engine,
        "Assistant: We decided to use postgres for the primary database.",
        "",
        "stop",
    )
    .await;
    assert!(primary.provider_runtime_failure());

    let fallback = run_fallback_extraction(
        &engine,
        "Assistant: We decided to use postgres for the primary database.",
        "",
        "stop",
    )
    .await
    .unwrap();
    let merged = merge_runtime_fallback(&primary, fallback);

    assert_eq!(merged.fallback_triggered, Some(true));
    assert_eq!(merged.stored_count, 1);
    assert_eq!(merged.mode.as_deref(), Some("fallback_add"));
    assert_eq!(engine.count_memories(None).await, 1);

    // The stored record lands under the fallback source with its mode tag.
    let page = engine.list_memories(0, 10, Some("extract/fallback")).await;
    assert_eq!(page.total, 1);
    assert_eq!(
        page.memories[0].extra.get("extraction_mode"),
        Some(&serde_json::json!("fallback_add"))
    );
}

#[tokio::test]
async fn test_empty_facts_short_circuits() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;

    let provider = MockProvider::new(vec!["[]"], true);
    let outcome = run_extraction(&provider, &engine, "nothing useful", "s", "stop").await;
    assert_eq!(outcome.extracted_count, 0);
    assert!(outcome.actions.is_empty());
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn test_fallback_novelty_noop() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;

    let line = "We decided to use postgres for the primary database.";
    let transcript = format!("Assistant: {line}\n");
    let limits = FallbackLimits::default();
    assert_eq!(
        recall_extract::fallback_extract_facts(&transcript, &limits),
        vec![line.to_string()]
    );

    run_fallback_extraction(&engine, &transcript, "s", "stop")
        .await
        .unwrap();
    // Second pass sees the stored fact and noops.
    let second = run_fallback_extraction(&engine, &transcript, "s", "stop")
        .await
        .unwrap();
    assert_eq!(second.stored_count, 0);
    assert_eq!(engine.count_memories(None).await, 1);
    assert_eq!(second.actions[0]["action"], "noop");
}
