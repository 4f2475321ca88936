//! Model routing.
//!
//! Picks a backend model for a task from declared capabilities and
//! observed behavior. Only models whose capability set is a superset of
//! the requirement are candidates; among those the score is
//!
//!   matched * priority_weight + trust * trust_weight
//!     - latency_penalty - error_rate * error_weight
//!
//! where the latency penalty applies only when `fast_response` is
//! required. Trust is an EMA over success/failure, clamped to [0, 1].
//! A per-model circuit breaker removes persistently failing models from
//! rotation until a cooldown elapses, then admits a single probe.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use otto_common::config::{ModelProfileConfig, RouterConfig};
use otto_common::error::KernelError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

const INITIAL_TRUST: f64 = 0.8;
/// Scores closer than this are a tie; the faster model wins.
const SCORE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum BreakerState {
    Closed,
    Open { reopen_at: DateTime<Utc> },
    /// Cooldown elapsed and the single probe call is in flight; nothing
    /// else is admitted until it reports back.
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStats {
    pub trust: f64,
    pub avg_latency_ms: f64,
    pub calls: u64,
    pub errors: u64,
    pub breaker: BreakerState,
}

impl Default for ModelStats {
    fn default() -> Self {
        Self {
            trust: INITIAL_TRUST,
            avg_latency_ms: 0.0,
            calls: 0,
            errors: 0,
            breaker: BreakerState::Closed,
        }
    }
}

impl ModelStats {
    pub fn error_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.errors as f64 / self.calls as f64
        }
    }
}

#[derive(Debug, Clone)]
struct ModelProfile {
    name: String,
    capabilities: HashSet<String>,
    priority_weight: u32,
}

pub struct ModelRouter {
    profiles: Vec<ModelProfile>,
    stats: Mutex<HashMap<String, ModelStats>>,
    config: RouterConfig,
    snapshot_path: Option<PathBuf>,
}

impl ModelRouter {
    pub fn new(models: &[ModelProfileConfig], config: RouterConfig) -> Self {
        let profiles = models
            .iter()
            .map(|m| ModelProfile {
                name: m.name.clone(),
                capabilities: m.capabilities.iter().cloned().collect(),
                priority_weight: m.priority_weight,
            })
            .collect();
        Self {
            profiles,
            stats: Mutex::new(HashMap::new()),
            config,
            snapshot_path: None,
        }
    }

    /// Attach a JSON snapshot file; previously persisted stats are
    /// loaded if present.
    pub fn with_snapshot(mut self, path: PathBuf) -> Self {
        if let Ok(raw) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<HashMap<String, ModelStats>>(&raw) {
                Ok(loaded) => {
                    info!("Loaded stats for {} models from {:?}", loaded.len(), path);
                    *self.stats.lock().unwrap() = loaded;
                }
                Err(e) => warn!("Ignoring corrupt model stats snapshot: {}", e),
            }
        }
        self.snapshot_path = Some(path);
        self
    }

    /// Select the best available model for the required capabilities.
    pub fn get_model(&self, required: &[String]) -> Result<String, KernelError> {
        let mut stats = self.stats.lock().unwrap();
        let now = Utc::now();

        let mut best: Option<(f64, f64, &str)> = None;
        for profile in &self.profiles {
            if !required.iter().all(|c| profile.capabilities.contains(c)) {
                continue;
            }
            let entry = stats.entry(profile.name.clone()).or_default();
            if !breaker_admits(entry, now) {
                continue;
            }
            let score = self.score(profile, entry, required);
            debug!("Model {} scored {:.4}", profile.name, score);
            let better = match best {
                None => true,
                Some((best_score, best_latency, _)) => {
                    score > best_score + SCORE_EPSILON
                        || ((score - best_score).abs() <= SCORE_EPSILON
                            && entry.avg_latency_ms < best_latency)
                }
            };
            if better {
                best = Some((score, entry.avg_latency_ms, profile.name.as_str()));
            }
        }

        best.map(|(_, _, name)| name.to_string()).ok_or_else(|| {
            KernelError::ModelUnavailable(format!(
                "no model satisfies capabilities {:?}",
                required
            ))
        })
    }

    fn score(&self, profile: &ModelProfile, stats: &ModelStats, required: &[String]) -> f64 {
        let matched = required.len() as f64;
        let mut score = matched * profile.priority_weight as f64
            + stats.trust * self.config.trust_weight
            - stats.error_rate() * self.config.error_weight;
        if required.iter().any(|c| c == "fast_response") {
            score -= stats.avg_latency_ms / 10_000.0;
        }
        score
    }

    /// Record one call outcome: EMA trust update, rolling latency,
    /// error window, and breaker transitions.
    pub fn record_performance(&self, model: &str, success: bool, latency_ms: f64) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(model.to_string()).or_default();

        let outcome = if success { 1.0 } else { 0.0 };
        entry.trust = ((1.0 - self.config.ema_alpha) * entry.trust
            + self.config.ema_alpha * outcome)
            .clamp(0.0, 1.0);

        entry.calls += 1;
        if !success {
            entry.errors += 1;
        }
        entry.avg_latency_ms += (latency_ms - entry.avg_latency_ms) / entry.calls as f64;

        match entry.breaker {
            BreakerState::HalfOpen => {
                if success {
                    info!("Model {} recovered, closing breaker", model);
                    entry.breaker = BreakerState::Closed;
                    entry.calls = 1;
                    entry.errors = 0;
                } else {
                    let reopen_at =
                        Utc::now() + Duration::seconds(self.config.breaker_cooldown_secs);
                    warn!("Model {} failed its probe, reopening breaker", model);
                    entry.breaker = BreakerState::Open { reopen_at };
                }
            }
            BreakerState::Closed => {
                if entry.calls >= self.config.breaker_min_calls
                    && entry.error_rate() > self.config.breaker_error_rate
                {
                    let reopen_at =
                        Utc::now() + Duration::seconds(self.config.breaker_cooldown_secs);
                    warn!(
                        "Model {} tripped the circuit breaker (error rate {:.2})",
                        model,
                        entry.error_rate()
                    );
                    entry.breaker = BreakerState::Open { reopen_at };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    pub fn stats_for(&self, model: &str) -> Option<ModelStats> {
        self.stats.lock().unwrap().get(model).cloned()
    }
}

/// Whether the breaker lets this model be selected now. An Open breaker
/// past its cooldown moves to HalfOpen and admits the single probe; the
/// model stays out of rotation until that probe reports back through
/// `record_performance`.
fn breaker_admits(stats: &mut ModelStats, now: DateTime<Utc>) -> bool {
    match stats.breaker {
        BreakerState::Closed => true,
        BreakerState::HalfOpen => false,
        BreakerState::Open { reopen_at } => {
            if now >= reopen_at {
                stats.breaker = BreakerState::HalfOpen;
                true
            } else {
                false
            }
        }
    }
}

impl crate::flush::FlushTarget for ModelRouter {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = self.stats.lock().unwrap().clone();
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write model stats: {:?}", path))?;
        Ok(())
    }
}
