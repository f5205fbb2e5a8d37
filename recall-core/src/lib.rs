//! Core types for the Recall memory service.
//!
//! This crate holds the pieces every other crate depends on:
//! - the shared error type and `Result` alias
//! - the memory record data model and reserved-key rules
//! - the persisted store configuration and env parsing helpers

pub mod config;
pub mod error;
pub mod types;

pub use config::{StoreConfig, env_bool, env_float, env_int, env_str};
pub use error::{RecallError, Result};
pub use types::{Metadata, MemoryRecord, RESERVED_KEYS, SearchMatch, round6};
