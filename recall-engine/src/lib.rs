//! Memory engine for the Recall service.
//!
//! Owns the metadata log, the sparse BM25 mirror, and the id allocation
//! rules, and coordinates the embedder and vector store behind a locked
//! write path. See [`engine::MemoryEngine`] for the public contract.

pub mod bm25;
pub mod chunker;
pub mod engine;

pub use bm25::{Bm25Index, tokenize};
pub use chunker::chunk_markdown;
pub use engine::{
    DEFAULT_DEDUP_THRESHOLD, DEFAULT_NOVELTY_THRESHOLD, DeduplicateReport,
    DeleteBatchResult, DeleteResult, DuplicatePair, EmbedderFactory, EngineOptions,
    EngineStats, FolderInfo, MemoryEngine, MemoryPage, ReadyStatus, RebuildReport,
    ReloadReport, RestoreResult, StatsLight, SupersedeResult, UpdateResult, UpsertEntry,
    UpsertBatchResult, UpsertOutcome,
};
