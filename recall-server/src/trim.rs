//! Allocator trimming for long-lived processes.
//!
//! Heavy embedding batches leave the allocator holding a high-water mark of
//! freed pages. `malloc_trim(0)` returns them to the kernel on glibc; the
//! cooldown keeps the walk of the arena from becoming its own overhead.

use serde::Serialize;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct TrimResult {
    pub trimmed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_until_next: Option<f64>,
}

pub struct MemoryTrimmer {
    enabled: bool,
    cooldown_sec: f64,
    last_trim: parking_lot::Mutex<Option<Instant>>,
}

impl MemoryTrimmer {
    pub fn new(enabled: bool, cooldown_sec: f64) -> Self {
        Self {
            enabled,
            cooldown_sec: cooldown_sec.max(0.0),
            last_trim: parking_lot::Mutex::new(None),
        }
    }

    /// Attempt a trim unless disabled or inside the cooldown window.
    pub fn maybe_trim(&self, reason: &str) -> TrimResult {
        if !self.enabled {
            return TrimResult {
                trimmed: false,
                reason: "disabled".to_string(),
                seconds_until_next: None,
            };
        }

        {
            let mut last = self.last_trim.lock();
            if let Some(previous) = *last {
                let elapsed = previous.elapsed().as_secs_f64();
                if elapsed < self.cooldown_sec {
                    return TrimResult {
                        trimmed: false,
                        reason: "cooldown".to_string(),
                        seconds_until_next: Some(
                            ((self.cooldown_sec - elapsed) * 1000.0).round() / 1000.0,
                        ),
                    };
                }
            }
            *last = Some(Instant::now());
        }

        let trimmed = malloc_trim();
        debug!(reason, trimmed, "memory trim");
        TrimResult {
            trimmed,
            reason: if reason.is_empty() {
                "unspecified".to_string()
            } else {
                reason.to_string()
            },
            seconds_until_next: None,
        }
    }
}

#[cfg(target_os = "linux")]
fn malloc_trim() -> bool {
    // SAFETY: malloc_trim takes a pad size and touches no caller memory.
    unsafe { libc::malloc_trim(0) != 0 }
}

#[cfg(not(target_os = "linux"))]
fn malloc_trim() -> bool {
    false
}
