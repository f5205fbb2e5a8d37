//! Entity-scoped lock manager for write serialization.
//!
//! Writers that touch the same entity serialize; writers on different
//! entities proceed in parallel up to the engine's global write mutex.
//! Multi-key acquisition always happens in sorted order, so no two callers
//! can deadlock against each other.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Sentinel key taken by whole-store operations (restore, full delete).
pub const ALL_ENTITIES: &str = "__all__";

/// Key used when a caller supplies no usable keys.
pub const DEFAULT_ENTITY: &str = "__default__";

/// Entity key for a memory source.
pub fn entity_key(source: &str) -> String {
    let scoped = source.trim();
    if scoped.is_empty() {
        format!("default:{}", "__unknown__")
    } else {
        format!("default:{scoped}")
    }
}

/// Manages keyed locks with deterministic acquisition order.
#[derive(Default)]
pub struct EntityLockManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held entity locks. Dropping releases them in reverse acquisition order.
pub struct EntityGuard {
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

impl EntityLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.locks.lock();
        table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Normalize keys (trim, drop empties, dedupe, sort) and acquire each in
    /// order. An empty normalized set degrades to the default key.
    pub async fn acquire_many<I, S>(&self, keys: I) -> EntityGuard
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = keys
            .into_iter()
            .map(|key| key.as_ref().trim().to_string())
            .filter(|key| !key.is_empty())
            .collect();
        normalized.sort();
        normalized.dedup();
        if normalized.is_empty() {
            normalized.push(DEFAULT_ENTITY.to_string());
        }

        let mut guards = Vec::with_capacity(normalized.len());
        for key in &normalized {
            let lock = self.lock_for(key);
            guards.push(lock.lock_owned().await);
        }
        EntityGuard { guards }
    }
}
