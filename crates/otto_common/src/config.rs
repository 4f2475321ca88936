//! Kernel configuration.
//!
//! Loaded from a TOML file when present, otherwise defaults apply.
//! Every threshold the kernel branches on lives here so tests can pin
//! them explicitly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub data_dir: PathBuf,
    /// Base URL of the local Ollama daemon.
    pub ollama_url: String,
    pub queue: QueueConfig,
    pub budgets: BudgetConfig,
    pub reflex: ReflexConfig,
    pub safety: SafetyConfig,
    pub router: RouterConfig,
    pub worker: WorkerConfig,
    pub flush: FlushConfig,
    pub models: Vec<ModelProfileConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Bounded capacity per priority band.
    pub band_capacity: usize,
    /// Band at or below which an item counts as urgent.
    pub urgent_band: i32,
    /// Band at or above which an item counts as proactive/background.
    pub proactive_band: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            band_capacity: 64,
            urgent_band: 10,
            proactive_band: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Soft budget for shallow reasoning; overrun notifies, never cancels.
    pub shallow_ms: u64,
    /// Soft budget for deep/research-like work.
    pub deep_ms: u64,
    /// Reflex path target.
    pub reflex_ms: u64,
    /// Hard ceiling; the only timeout that cancels a request.
    pub hard_ceiling_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            shallow_ms: 3_000,
            deep_ms: 10_000,
            reflex_ms: 500,
            hard_ceiling_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflexConfig {
    /// Minimum match confidence before the reflex path may fire.
    pub confidence_threshold: f64,
    /// Consecutive failures after which a pattern is blacklisted for good.
    pub blacklist_threshold: u32,
    /// Reflex-to-fallback cycles per session before deep triage is forced.
    pub recursion_limit: u32,
    /// Reinforcements before a deliberated pattern is promoted to reflex.
    pub promote_min_count: u32,
    pub promote_min_confidence: f64,
}

impl Default for ReflexConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            blacklist_threshold: 3,
            recursion_limit: 3,
            promote_min_count: 3,
            promote_min_confidence: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Roots that path-bearing parameters must resolve inside.
    pub sandbox_roots: Vec<PathBuf>,
    pub confirmation_expiry_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            sandbox_roots: vec![PathBuf::from("/home"), PathBuf::from("/tmp/otto")],
            confirmation_expiry_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Weight of the trust score in model selection.
    pub trust_weight: f64,
    /// Weight of the error rate penalty.
    pub error_weight: f64,
    /// EMA smoothing factor for trust updates.
    pub ema_alpha: f64,
    /// Error rate that trips the circuit breaker.
    pub breaker_error_rate: f64,
    /// Calls observed before the breaker may trip.
    pub breaker_min_calls: u64,
    pub breaker_cooldown_secs: i64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            trust_weight: 0.5,
            error_weight: 5.0,
            ema_alpha: 0.2,
            breaker_error_rate: 0.5,
            breaker_min_calls: 10,
            breaker_cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Bounded worker pool size for blocking work.
    pub pool_size: usize,
    /// Dispatch retries before pool exhaustion is fatal for the request.
    pub dispatch_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            dispatch_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Debounce window for coalesced disk writes.
    pub debounce_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self { debounce_ms: 2_000 }
    }
}

/// Static part of a model profile; runtime stats live in the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfileConfig {
    pub name: String,
    pub capabilities: Vec<String>,
    /// 1-4, higher is preferred.
    pub priority_weight: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/otto"),
            ollama_url: "http://127.0.0.1:11434".into(),
            queue: QueueConfig::default(),
            budgets: BudgetConfig::default(),
            reflex: ReflexConfig::default(),
            safety: SafetyConfig::default(),
            router: RouterConfig::default(),
            worker: WorkerConfig::default(),
            flush: FlushConfig::default(),
            models: vec![
                ModelProfileConfig {
                    name: "qwen2.5:3b".into(),
                    capabilities: vec![
                        "general".into(),
                        "reasoning".into(),
                        "fast_response".into(),
                    ],
                    priority_weight: 2,
                },
                ModelProfileConfig {
                    name: "qwen2.5:7b".into(),
                    capabilities: vec![
                        "general".into(),
                        "reasoning".into(),
                        "coding".into(),
                        "researching".into(),
                    ],
                    priority_weight: 3,
                },
            ],
        }
    }
}

impl KernelConfig {
    /// Load configuration from a TOML file. A missing file yields the
    /// defaults; a malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("Failed to parse config: {:?}", path))?;
        Ok(config)
    }
}
