//! Embedder auto-reload policy and metrics.
//!
//! The controller samples resident-set size and only triggers a reload when
//! memory pressure is sustained AND the service is relatively idle: a
//! required streak of high samples, a minimum interval between reloads, a
//! sliding window cap, and ceilings on in-flight HTTP requests and
//! extraction queue depth.

use chrono::{DateTime, Utc};
use recall_core::{env_float, env_int};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Gates for the auto-reload decision, resolved from the environment.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadPolicy {
    pub rss_kb_threshold: u64,
    pub check_sec: f64,
    pub required_high_streak: u64,
    pub min_interval_sec: f64,
    pub window_sec: f64,
    pub max_per_window: u64,
    pub max_active_requests: u64,
    pub max_queue_depth: u64,
}

impl ReloadPolicy {
    pub fn from_env() -> Self {
        Self {
            rss_kb_threshold: env_int("EMBEDDER_AUTO_RELOAD_RSS_KB_THRESHOLD", 1_200_000, 100_000),
            check_sec: env_float("EMBEDDER_AUTO_RELOAD_CHECK_SEC", 15.0, 1.0),
            required_high_streak: env_int("EMBEDDER_AUTO_RELOAD_HIGH_STREAK", 3, 1),
            min_interval_sec: env_float("EMBEDDER_AUTO_RELOAD_MIN_INTERVAL_SEC", 900.0, 30.0),
            window_sec: env_float("EMBEDDER_AUTO_RELOAD_WINDOW_SEC", 3600.0, 60.0),
            max_per_window: env_int("EMBEDDER_AUTO_RELOAD_MAX_PER_WINDOW", 2, 1),
            max_active_requests: env_int("EMBEDDER_AUTO_RELOAD_MAX_ACTIVE_REQUESTS", 2, 0),
            max_queue_depth: env_int("EMBEDDER_AUTO_RELOAD_MAX_QUEUE_DEPTH", 0, 0),
        }
    }
}

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub trigger: bool,
    pub reason: &'static str,
}

struct ControllerState {
    high_streak: u64,
    last_reload: Option<Instant>,
    window: VecDeque<Instant>,
}

pub struct AutoReloadController {
    policy: ReloadPolicy,
    state: parking_lot::Mutex<ControllerState>,
}

impl AutoReloadController {
    pub fn new(policy: ReloadPolicy) -> Self {
        Self {
            policy,
            state: parking_lot::Mutex::new(ControllerState {
                high_streak: 0,
                last_reload: None,
                window: VecDeque::new(),
            }),
        }
    }

    pub fn policy(&self) -> &ReloadPolicy {
        &self.policy
    }

    /// Evaluate all gates for one RSS sample.
    pub fn evaluate(&self, rss_kb: u64, active_requests: u64, queue_depth: u64) -> Decision {
        let mut state = self.state.lock();

        if rss_kb < self.policy.rss_kb_threshold {
            state.high_streak = 0;
            return Decision {
                trigger: false,
                reason: "below_threshold",
            };
        }

        state.high_streak += 1;
        if state.high_streak < self.policy.required_high_streak {
            return Decision {
                trigger: false,
                reason: "building_streak",
            };
        }

        if let Some(last) = state.last_reload {
            if last.elapsed() < Duration::from_secs_f64(self.policy.min_interval_sec) {
                return Decision {
                    trigger: false,
                    reason: "min_interval",
                };
            }
        }

        let window = Duration::from_secs_f64(self.policy.window_sec);
        while state
            .window
            .front()
            .is_some_and(|&at| at.elapsed() > window)
        {
            state.window.pop_front();
        }
        if state.window.len() as u64 >= self.policy.max_per_window {
            return Decision {
                trigger: false,
                reason: "window_limit",
            };
        }

        if active_requests > self.policy.max_active_requests {
            return Decision {
                trigger: false,
                reason: "busy_requests",
            };
        }
        if queue_depth > self.policy.max_queue_depth {
            return Decision {
                trigger: false,
                reason: "busy_queue",
            };
        }

        let now = Instant::now();
        state.last_reload = Some(now);
        state.window.push_back(now);
        state.high_streak = 0;
        Decision {
            trigger: true,
            reason: "triggered",
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Serialize)]
pub struct AutoCounters {
    pub checks_total: u64,
    pub skipped_total: u64,
    pub triggered_total: u64,
    pub succeeded_total: u64,
    pub failed_total: u64,
    pub decision_reasons: BTreeMap<String, u64>,
    pub last_decision_reason: Option<String>,
    pub last_rss_kb: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_reload_duration_ms: f64,
    pub last_trim_reason: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ManualCounters {
    pub requests_total: u64,
    pub succeeded_total: u64,
    pub failed_total: u64,
    pub last_requested_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_reload_duration_ms: f64,
    pub last_trim_reason: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Counters for both auto and manual reloads, surfaced on `/metrics`.
pub struct ReloadMetrics {
    enabled: bool,
    policy: ReloadPolicy,
    pub auto: parking_lot::Mutex<AutoCounters>,
    pub manual: parking_lot::Mutex<ManualCounters>,
}

impl ReloadMetrics {
    pub fn new(enabled: bool, policy: ReloadPolicy) -> Self {
        Self {
            enabled,
            policy,
            auto: parking_lot::Mutex::new(AutoCounters::default()),
            manual: parking_lot::Mutex::new(ManualCounters::default()),
        }
    }

    pub fn record_check(&self, reason: &str, rss_kb: u64, triggered: bool) {
        let mut auto = self.auto.lock();
        auto.checks_total += 1;
        auto.last_decision_reason = Some(reason.to_string());
        auto.last_rss_kb = rss_kb;
        *auto.decision_reasons.entry(reason.to_string()).or_insert(0) += 1;
        if triggered {
            auto.triggered_total += 1;
            auto.last_triggered_at = Some(Utc::now());
        } else {
            auto.skipped_total += 1;
        }
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "enabled": self.enabled,
            "policy": &self.policy,
            "auto": &*self.auto.lock(),
            "manual": &*self.manual.lock(),
        })
    }
}

/// Read lightweight process memory stats from `/proc/self/status`.
pub fn read_process_memory_kb() -> BTreeMap<String, u64> {
    let mut stats = BTreeMap::from([
        ("rss_kb".to_string(), 0),
        ("rss_anon_kb".to_string(), 0),
        ("rss_file_kb".to_string(), 0),
        ("rss_high_water_kb".to_string(), 0),
        ("vmsize_kb".to_string(), 0),
    ]);
    let Ok(raw) = std::fs::read_to_string("/proc/self/status") else {
        return stats;
    };
    for line in raw.lines() {
        let Some((field, rest)) = line.split_once(':') else {
            continue;
        };
        let key = match field.trim() {
            "VmRSS" => "rss_kb",
            "RssAnon" => "rss_anon_kb",
            "RssFile" => "rss_file_kb",
            "VmHWM" => "rss_high_water_kb",
            "VmSize" => "vmsize_kb",
            _ => continue,
        };
        if let Some(value) = rest.trim().split_whitespace().next() {
            if let Ok(parsed) = value.parse::<u64>() {
                stats.insert(key.to_string(), parsed);
            }
        }
    }
    stats
}
