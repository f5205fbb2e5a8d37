//! LLM-driven memory extraction for the Recall service.
//!
//! Two-call pipeline: the provider first distills atomic facts from a
//! conversation, then decides an AUDN action (Add/Update/Delete/Noop) per
//! fact against the most similar existing memories. A conservative
//! regex-based fallback extractor covers provider outages, and the
//! consolidation module merges redundant memory clusters.

pub mod consolidate;
pub mod fallback;
pub mod pipeline;
pub mod provider;

pub use consolidate::{consolidate_cluster, find_clusters, find_prune_candidates};
pub use fallback::{fallback_extract_facts, merge_runtime_fallback, run_fallback_extraction};
pub use pipeline::{
    ExtractLimits, ExtractionOutcome, Fact, StageTokens, TokenUsage, run_extraction,
};
pub use provider::{
    AnthropicProvider, Completion, LlmProvider, MockProvider, OllamaProvider, OpenAiProvider,
    provider_from_env,
};
