//! End-to-end engine tests over the local vector store and the
//! deterministic hash embedder. Similarity magnitudes reflect the hash
//! embedder's token-overlap geometry; orderings match a real model.

use recall_core::RecallError;
use recall_embed::{Embedder, HashEmbedder};
use recall_engine::{EmbedderFactory, EngineOptions, MemoryEngine};
use recall_storage::LocalVectorStore;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const DIM: usize = 768;

fn hash_factory(dimension: usize) -> EmbedderFactory {
    Arc::new(move || Ok(Box::new(HashEmbedder::new(dimension)) as Box<dyn Embedder>))
}

async fn engine_in(dir: &Path) -> MemoryEngine {
    MemoryEngine::new(EngineOptions {
        data_dir: dir.to_path_buf(),
        store: Arc::new(LocalVectorStore::in_memory()),
        embedder_factory: hash_factory(DIM),
        cloud: None,
        max_backups: 10,
    })
    .await
    .unwrap()
}

async fn add_lang_corpus(engine: &MemoryEngine) -> Vec<i64> {
    engine
        .add_memories(
            &[
                "Python is great for data science".to_string(),
                "JavaScript runs in browsers".to_string(),
                "Docker packages deps".to_string(),
            ],
            &[
                "lang.md".to_string(),
                "lang.md".to_string(),
                "devops.md".to_string(),
            ],
            None,
            false,
            0.90,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_add_and_search() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    let ids = add_lang_corpus(&engine).await;
    assert_eq!(ids, vec![0, 1, 2]);

    let results = engine.search("Python", 2, None, None).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].record.text, "Python is great for data science");
    assert!(results[0].similarity.unwrap() > 0.3);

    let ready = engine.is_ready().await;
    assert!(ready.ready);
    assert_eq!(ready.qdrant_count, Some(3));
}

#[tokio::test]
async fn test_hybrid_search_lexical_boost() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    add_lang_corpus(&engine).await;
    engine
        .add_memories(
            &["FastAPI is a Python web framework".to_string()],
            &["lang.md".to_string()],
            None,
            false,
            0.90,
        )
        .await
        .unwrap();

    let results = engine
        .hybrid_search("Python web framework", 3, None, 0.7, None)
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].record.text, "FastAPI is a Python web framework");
    assert!(results[0].rrf_score.unwrap() > 0.0);
}

#[tokio::test]
async fn test_search_source_prefix_filter() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    add_lang_corpus(&engine).await;

    let results = engine
        .search("Python", 3, None, Some("devops"))
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.record.source.starts_with("devops")));
}

#[tokio::test]
async fn test_empty_store_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;

    assert!(engine.search("anything", 5, None, None).await.unwrap().is_empty());
    assert!(
        engine
            .hybrid_search("anything", 5, None, 0.7, None)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(engine.find_duplicates(0.9).await.unwrap().is_empty());
    let (novel, top) = engine.is_novel("anything", 0.88).await.unwrap();
    assert!(novel);
    assert!(top.is_none());
}

#[tokio::test]
async fn test_k_clamped_to_store_size() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    add_lang_corpus(&engine).await;
    let results = engine.search("Python", 50, None, None).await.unwrap();
    assert!(results.len() <= 3);
}

#[tokio::test]
async fn test_delete_restores_count() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    add_lang_corpus(&engine).await;

    let ids = engine
        .add_memories(
            &["ephemeral note that will be removed".to_string()],
            &["tmp.md".to_string()],
            None,
            false,
            0.90,
        )
        .await
        .unwrap();
    assert_eq!(engine.count_memories(None).await, 4);

    let deleted = engine.delete_memory(ids[0]).await.unwrap();
    assert_eq!(deleted.deleted_id, ids[0]);
    assert_eq!(engine.count_memories(None).await, 3);
    assert!(engine.is_ready().await.ready);

    let err = engine.get_memory(ids[0]).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_batch_reports_missing() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    let ids = add_lang_corpus(&engine).await;

    let result = engine
        .delete_memories(&[ids[0], ids[1], 999])
        .await
        .unwrap();
    assert_eq!(result.deleted_count, 2);
    assert_eq!(result.missing_ids, vec![999]);
    assert_eq!(engine.count_memories(None).await, 1);
}

#[tokio::test]
async fn test_delete_by_prefix_and_source() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    add_lang_corpus(&engine).await;

    assert_eq!(engine.delete_by_prefix("lang").await.unwrap(), 2);
    assert_eq!(engine.delete_by_source("devops").await.unwrap(), 1);
    assert_eq!(engine.count_memories(None).await, 0);
    assert!(engine.is_ready().await.ready);
}

#[tokio::test]
async fn test_supersede_audit_trail() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    let ids = engine
        .add_memories(
            &["Uses Prisma".to_string()],
            &["s".to_string()],
            None,
            false,
            0.90,
        )
        .await
        .unwrap();
    let old_id = ids[0];

    let result = engine.supersede(old_id, "Uses Drizzle", "s").await.unwrap();
    let new_id = result.new_id.unwrap();
    assert!(new_id > old_id);
    assert_eq!(result.previous_text, "Uses Prisma");

    let record = engine.get_memory(new_id).await.unwrap();
    assert_eq!(record.supersedes, Some(old_id));
    assert_eq!(record.previous_text.as_deref(), Some("Uses Prisma"));
    assert!(engine.get_memory(old_id).await.unwrap_err().is_not_found());
    assert_eq!(engine.count_memories(None).await, 1);
}

#[tokio::test]
async fn test_monotonic_ids_after_top_delete() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    let ids = add_lang_corpus(&engine).await;
    let top = *ids.iter().max().unwrap();
    engine.delete_memory(top).await.unwrap();

    let new_ids = engine
        .add_memories(
            &["fresh fact after deleting the newest".to_string()],
            &["s".to_string()],
            None,
            false,
            0.90,
        )
        .await
        .unwrap();
    assert!(new_ids[0] > top);
}

#[tokio::test]
async fn test_update_source_only_fast_path_keeps_vector() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    let ids = engine
        .add_memories(
            &["original text here".to_string()],
            &["a.md".to_string()],
            None,
            false,
            0.90,
        )
        .await
        .unwrap();
    let id = ids[0];

    let before = engine.search("original text here", 1, None, None).await.unwrap();
    let similarity_before = before[0].similarity.unwrap();
    let backups_before = engine.list_backups().await.unwrap().len();
    let created_before = engine.get_memory(id).await.unwrap().created_at;

    let result = engine
        .update_memory(id, None, Some("b.md"), None)
        .await
        .unwrap();
    assert_eq!(result.updated_fields, vec!["source"]);

    // No snapshot on the fast path.
    assert_eq!(engine.list_backups().await.unwrap().len(), backups_before);

    let record = engine.get_memory(id).await.unwrap();
    assert_eq!(record.source, "b.md");
    assert_eq!(record.created_at, created_before);
    assert_eq!(record.timestamp, created_before);
    assert!(record.updated_at >= created_before);

    // Vector untouched: the original text still matches identically.
    let after = engine.search("original text here", 1, None, None).await.unwrap();
    assert_eq!(after[0].similarity.unwrap(), similarity_before);
    assert_eq!(after[0].record.source, "b.md");
}

#[tokio::test]
async fn test_update_text_reembeds_and_rebuilds_sparse() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    let ids = engine
        .add_memories(
            &["original text here".to_string()],
            &["a.md".to_string()],
            None,
            false,
            0.90,
        )
        .await
        .unwrap();

    engine
        .update_memory(ids[0], Some("rewritten fact text"), None, None)
        .await
        .unwrap();

    let results = engine.search("rewritten fact text", 1, None, None).await.unwrap();
    assert_eq!(results[0].record.id, ids[0]);
    assert!(results[0].similarity.unwrap() > 0.9);

    // Sparse leg reflects the new tokens too.
    let hybrid = engine
        .hybrid_search("rewritten fact", 1, None, 0.5, None)
        .await
        .unwrap();
    assert_eq!(hybrid[0].record.id, ids[0]);
}

#[tokio::test]
async fn test_update_ignores_reserved_patch_keys() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    let ids = engine
        .add_memories(
            &["patched memory".to_string()],
            &["a.md".to_string()],
            None,
            false,
            0.90,
        )
        .await
        .unwrap();

    let mut patch = recall_core::Metadata::new();
    patch.insert("id".to_string(), json!(4242));
    patch.insert("entity_key".to_string(), json!("hijack"));
    patch.insert("priority".to_string(), json!("high"));
    engine
        .update_memory(ids[0], None, None, Some(patch))
        .await
        .unwrap();

    let record = engine.get_memory(ids[0]).await.unwrap();
    assert_eq!(record.id, ids[0]);
    assert_eq!(record.entity_key, None);
    assert_eq!(record.extra.get("priority"), Some(&json!("high")));
}

#[tokio::test]
async fn test_upsert_idempotent_by_key() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;

    let first = engine
        .upsert_memory("Uses Drizzle", "s", "orm-choice", None)
        .await
        .unwrap();
    assert_eq!(first.action, "created");

    let second = engine
        .upsert_memory("Uses Drizzle", "s", "orm-choice", None)
        .await
        .unwrap();
    assert_eq!(second.action, "updated");
    assert_eq!(second.id, first.id);
    assert_eq!(engine.count_memories(None).await, 1);

    let record = engine.get_memory(first.id).await.unwrap();
    assert_eq!(record.entity_key.as_deref(), Some("orm-choice"));
}

#[tokio::test]
async fn test_is_novel_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    engine
        .add_memories(
            &["TypeScript strict mode".to_string()],
            &["s".to_string()],
            None,
            false,
            0.90,
        )
        .await
        .unwrap();

    let (novel, top) = engine.is_novel("TypeScript strict mode", 0.88).await.unwrap();
    assert!(!novel);
    assert!(top.unwrap().similarity.unwrap() > 0.99);

    let (novel, _) = engine.is_novel("quantum blueberry pancakes", 0.88).await.unwrap();
    assert!(novel);
}

#[tokio::test]
async fn test_dedup_keeps_lowest_id() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    let ids = engine
        .add_memories(
            &[
                "uses postgres database".to_string(),
                "uses postgres database".to_string(),
                "completely different topic entirely".to_string(),
            ],
            &["a".to_string(), "a".to_string(), "b".to_string()],
            None,
            false,
            0.90,
        )
        .await
        .unwrap();

    let dry = engine.deduplicate(0.9, true).await.unwrap();
    assert_eq!(dry.duplicate_pairs, 1);
    assert_eq!(dry.would_remove, Some(1));
    assert!(dry.dry_run);
    assert_eq!(engine.count_memories(None).await, 3);

    let live = engine.deduplicate(0.9, false).await.unwrap();
    assert_eq!(live.removed, Some(1));
    assert_eq!(live.remaining, Some(2));

    // Earliest entry survives.
    assert!(engine.get_memory(ids[0]).await.is_ok());
    assert!(engine.get_memory(ids[1]).await.unwrap_err().is_not_found());
    assert!(engine.is_ready().await.ready);
}

#[tokio::test]
async fn test_add_dedup_filters_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    engine
        .add_memories(
            &["uses postgres database".to_string()],
            &["a".to_string()],
            None,
            false,
            0.90,
        )
        .await
        .unwrap();

    let ids = engine
        .add_memories(
            &["uses postgres database".to_string()],
            &["a".to_string()],
            None,
            true,
            0.90,
        )
        .await
        .unwrap();
    assert!(ids.is_empty());
    assert_eq!(engine.count_memories(None).await, 1);
}

#[tokio::test]
async fn test_reserved_keys_stripped_on_add() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    let mut metadata = recall_core::Metadata::new();
    metadata.insert("id".to_string(), json!(999));
    metadata.insert("priority".to_string(), json!("high"));

    let ids = engine
        .add_memories(
            &["metadata carrying memory".to_string()],
            &["s".to_string()],
            Some(&[Some(metadata)]),
            false,
            0.90,
        )
        .await
        .unwrap();

    let record = engine.get_memory(ids[0]).await.unwrap();
    assert_eq!(record.id, ids[0]);
    assert_ne!(record.id, 999);
    assert_eq!(record.extra.get("priority"), Some(&json!("high")));
}

#[tokio::test]
async fn test_snapshot_restore_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    add_lang_corpus(&engine).await;

    let backup_path = engine.create_backup("pin").await.unwrap();
    let backup_name = backup_path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .to_string();

    let extra: Vec<String> = (0..5).map(|i| format!("extra fact number {i}")).collect();
    let sources: Vec<String> = (0..5).map(|_| "extra.md".to_string()).collect();
    engine
        .add_memories(&extra, &sources, None, false, 0.90)
        .await
        .unwrap();
    assert_eq!(engine.count_memories(None).await, 8);

    let restored = engine.restore_from_backup(&backup_name).await.unwrap();
    assert_eq!(restored.total_memories, 3);
    assert_eq!(engine.count_memories(None).await, 3);
    assert!(engine.is_ready().await.ready);

    // The pre-snapshot top hit comes back.
    let results = engine
        .hybrid_search("Python data science", 1, None, 0.7, None)
        .await
        .unwrap();
    assert_eq!(results[0].record.text, "Python is great for data science");
}

#[tokio::test]
async fn test_restore_rejects_bad_names() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    for bad in ["../escape", "a/b", "a\\b"] {
        let err = engine.restore_from_backup(bad).await.unwrap_err();
        assert!(matches!(err, RecallError::InvalidArgument(_)), "{bad}");
    }
    let err = engine.restore_from_backup("missing_19990101_000000").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_persistence_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = engine_in(dir.path()).await;
        add_lang_corpus(&engine).await;
    }
    // Fresh engine over an empty in-memory store: vectors are rebuilt from
    // the persisted metadata on load.
    let engine = engine_in(dir.path()).await;
    assert_eq!(engine.count_memories(None).await, 3);
    assert!(engine.is_ready().await.ready);
    let results = engine.search("Python", 1, None, None).await.unwrap();
    assert_eq!(results[0].record.text, "Python is great for data science");
}

#[tokio::test]
async fn test_rebuild_from_files_restarts_ids() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    add_lang_corpus(&engine).await;

    let doc = dir.path().join("notes.md");
    tokio::fs::write(
        &doc,
        "# Decisions\n\nThe service uses axum for the HTTP layer and tokio for the runtime.\n\n# Learnings\n\nQdrant point ids must be numeric for this store to work correctly.",
    )
    .await
    .unwrap();

    let report = engine.rebuild_from_files(&[doc]).await.unwrap();
    assert_eq!(report.files_processed, 1);
    assert_eq!(report.memories_added, 2);
    assert!(report.backup_location.contains("pre_rebuild"));

    let page = engine.list_memories(0, 10, None).await;
    let ids: Vec<i64> = page.memories.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![0, 1]);
    assert!(page.memories[0].source.ends_with(":chunk_0"));
    assert!(engine.is_ready().await.ready);
}

#[tokio::test]
async fn test_list_memories_and_folders() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    engine
        .add_memories(
            &[
                "alpha fact one".to_string(),
                "alpha fact two".to_string(),
                "beta fact".to_string(),
            ],
            &[
                "proj/a.md".to_string(),
                "proj/b.md".to_string(),
                "other.md".to_string(),
            ],
            None,
            false,
            0.90,
        )
        .await
        .unwrap();

    let page = engine.list_memories(0, 2, Some("proj")).await;
    assert_eq!(page.total, 2);
    assert_eq!(page.memories.len(), 2);
    assert_eq!(engine.count_memories(Some("proj")).await, 2);

    let (folders, total) = engine.list_folders().await;
    assert_eq!(total, 3);
    let names: Vec<&str> = folders.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["other.md", "proj"]);
    assert_eq!(folders[1].count, 2);
}

#[tokio::test]
async fn test_reload_embedder_same_dimension() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path()).await;
    add_lang_corpus(&engine).await;

    let report = engine.reload_embedder().await.unwrap();
    assert!(report.reloaded);
    assert_eq!(report.dimension, DIM);

    // Searches still work after the swap.
    let results = engine.search("Python", 1, None, None).await.unwrap();
    assert_eq!(results[0].record.text, "Python is great for data science");
}

#[tokio::test]
async fn test_reload_embedder_rejects_dimension_change() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_factory = calls.clone();
    let factory: EmbedderFactory = Arc::new(move || {
        let dimension = if calls_in_factory.fetch_add(1, Ordering::SeqCst) == 0 {
            DIM
        } else {
            DIM / 2
        };
        Ok(Box::new(HashEmbedder::new(dimension)) as Box<dyn Embedder>)
    });
    let engine = MemoryEngine::new(EngineOptions {
        data_dir: dir.path().to_path_buf(),
        store: Arc::new(LocalVectorStore::in_memory()),
        embedder_factory: factory,
        cloud: None,
        max_backups: 10,
    })
    .await
    .unwrap();

    let err = engine.reload_embedder().await.unwrap_err();
    assert!(matches!(err, RecallError::InvalidArgument(_)));
    assert_eq!(engine.dimension(), DIM);
}

#[tokio::test]
async fn test_legacy_cutover_archives_index() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = engine_in(dir.path()).await;
        add_lang_corpus(&engine).await;
        engine.save().await.unwrap();
    }
    // Drop a legacy vector file next to the metadata, then boot again.
    tokio::fs::write(dir.path().join("index.faiss"), b"legacy-bytes")
        .await
        .unwrap();

    let engine = engine_in(dir.path()).await;
    assert_eq!(engine.count_memories(None).await, 3);

    let marker = dir.path().join("migrations").join("faiss_to_qdrant.done");
    assert!(marker.exists());
    assert!(!dir.path().join("index.faiss").exists());

    let marker_json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&marker).unwrap()).unwrap();
    assert_eq!(marker_json["migration"], "faiss_to_qdrant");
    assert_eq!(marker_json["metadata_count"], 3);

    // Runs at most once: a second boot with a new legacy file is skipped
    // because the marker exists.
    drop(engine);
    tokio::fs::write(dir.path().join("index.faiss"), b"again")
        .await
        .unwrap();
    let engine = engine_in(dir.path()).await;
    assert!(dir.path().join("index.faiss").exists());
    drop(engine);
}
