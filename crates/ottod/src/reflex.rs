//! Reflex cache.
//!
//! Maps normalized trigger phrases straight to action proposals,
//! skipping deliberation entirely. The cache protects itself three
//! ways: a confidence threshold gates matching, repeated failures
//! blacklist a pattern permanently (with a negative lesson recorded),
//! and a per-session guard forces full reasoning when reflex fallbacks
//! recur.
//!
//! New patterns come from two places: explicit learning after a
//! successful execution, and automatic promotion of deliberated
//! trigger/action pairs that keep recurring.

use crate::lessons::{LessonStore, Polarity};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use otto_common::config::ReflexConfig;
use otto_common::proposal::{ActionProposal, ParamMap};
use otto_common::request::RequestId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex};
use tracing::{debug, info, warn};

/// Leading words that mark a query rather than a command. Queries need
/// reasoning and never become reflexes.
const INTERROGATIVES: &[&str] = &[
    "who", "what", "when", "where", "why", "how", "which", "can", "could", "should", "would",
    "is", "are", "do", "does", "did", "will",
];

/// Triggers longer than this are too specific to generalize.
const MAX_TRIGGER_WORDS: usize = 5;

/// Built-in command shapes that never need deliberation. Matched on the
/// normalized input after the learned table; the named `action` and
/// `target` groups become proposal parameters.
static COMMAND_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        // Single-word target only; longer phrasing goes to deliberation.
        (r"^(?P<action>open|launch|start) (?P<target>[a-z0-9]{2,40})$", "system_control"),
        (r"^(?P<action>play|pause|resume|stop|next|previous)(?: the)?(?: music| track| song| media)?$",
         "media_control"),
        (r"^(?P<action>mute|unmute)(?: the)?(?: volume| sound)?$", "system_control"),
        (r"^(?P<action>lock)(?: the)? screen$", "system_control"),
    ]
    .iter()
    .map(|(pattern, skill)| (Regex::new(pattern).unwrap(), *skill))
    .collect()
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflexPattern {
    pub trigger: String,
    pub skill: String,
    pub params: ParamMap,
    pub confidence: f64,
    pub success_count: u32,
    /// Consecutive failures; reset on success.
    pub failure_count: u32,
    /// Permanent once set. The pattern row stays so it cannot be
    /// relearned.
    pub blacklisted: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// A deliberated trigger/action pair being counted toward promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PromotionCandidate {
    skill: String,
    params: ParamMap,
    count: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReflexState {
    patterns: HashMap<String, ReflexPattern>,
    candidates: HashMap<String, PromotionCandidate>,
}

#[derive(Debug, Default)]
struct SessionState {
    fallbacks: u32,
}

pub struct ReflexCache {
    state: Mutex<ReflexState>,
    sessions: Mutex<HashMap<String, SessionState>>,
    lessons: Arc<LessonStore>,
    config: ReflexConfig,
    snapshot_path: Option<PathBuf>,
}

pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl ReflexCache {
    pub fn new(config: ReflexConfig, lessons: Arc<LessonStore>) -> Self {
        Self {
            state: Mutex::new(ReflexState::default()),
            sessions: Mutex::new(HashMap::new()),
            lessons,
            config,
            snapshot_path: None,
        }
    }

    /// Attach a JSON snapshot; previously persisted patterns (including
    /// blacklist entries) are loaded if present.
    pub fn with_snapshot(self, path: PathBuf) -> Self {
        if let Ok(raw) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<ReflexState>(&raw) {
                Ok(loaded) => {
                    info!("Loaded {} reflex patterns from {:?}", loaded.patterns.len(), path);
                    *self.state.lock().unwrap() = loaded;
                }
                Err(e) => warn!("Ignoring corrupt reflex snapshot: {}", e),
            }
        }
        Self {
            snapshot_path: Some(path),
            ..self
        }
    }

    /// Match the normalized trigger against the learned table, then the
    /// built-in command shapes. Blacklisted or low-confidence patterns
    /// never fire and also suppress the built-in fallback for that
    /// trigger.
    pub fn match_trigger(&self, input: &str, request_id: RequestId) -> Option<ActionProposal> {
        let key = normalize(input);
        let mut state = self.state.lock().unwrap();
        if let Some(pattern) = state.patterns.get_mut(&key) {
            if pattern.blacklisted || pattern.confidence < self.config.confidence_threshold {
                return None;
            }
            pattern.last_used = Utc::now();
            debug!("Reflex hit for '{}' -> {}", key, pattern.skill);
            return Some(
                ActionProposal::new(pattern.skill.clone(), pattern.params.clone(), request_id)
                    .with_trigger(key.clone()),
            );
        }
        drop(state);
        Self::match_command(&key, request_id)
    }

    fn match_command(key: &str, request_id: RequestId) -> Option<ActionProposal> {
        for (pattern, skill) in COMMAND_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(key) {
                let mut params = ParamMap::new();
                if let Some(action) = caps.name("action") {
                    params.insert("action".into(), serde_json::json!(action.as_str()));
                }
                if let Some(target) = caps.name("target") {
                    params.insert("target".into(), serde_json::json!(target.as_str()));
                }
                debug!("Built-in command hit for '{}' -> {}", key, skill);
                return Some(ActionProposal::new(*skill, params, request_id));
            }
        }
        None
    }

    /// Learn a new pattern from a successful execution. Refused for
    /// queries, long triggers, and previously blacklisted triggers.
    pub fn learn_pattern(
        &self,
        trigger: &str,
        skill: &str,
        params: ParamMap,
        confidence: f64,
    ) -> bool {
        let key = normalize(trigger);
        if !Self::trigger_is_learnable(trigger, &key) {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if state.patterns.get(&key).is_some_and(|p| p.blacklisted) {
            debug!("Refusing to relearn blacklisted trigger '{}'", key);
            return false;
        }
        let now = Utc::now();
        state.patterns.insert(
            key.clone(),
            ReflexPattern {
                trigger: key.clone(),
                skill: skill.to_string(),
                params,
                confidence,
                success_count: 0,
                failure_count: 0,
                blacklisted: false,
                created_at: now,
                last_used: now,
            },
        );
        info!("Learned reflex pattern '{}' -> {}", key, skill);
        true
    }

    fn trigger_is_learnable(raw: &str, normalized: &str) -> bool {
        if raw.contains('?') {
            return false;
        }
        let words: Vec<&str> = normalized.split_whitespace().collect();
        if words.is_empty() || words.len() > MAX_TRIGGER_WORDS {
            return false;
        }
        !INTERROGATIVES.contains(&words[0])
    }

    /// Count a deliberated trigger/action pair toward automatic
    /// promotion. Promotes once the pair has recurred enough.
    pub fn reinforce(&self, trigger: &str, skill: &str, params: &ParamMap) {
        let key = normalize(trigger);
        if !Self::trigger_is_learnable(trigger, &key) {
            return;
        }
        let promote = {
            let mut state = self.state.lock().unwrap();
            if state.patterns.contains_key(&key) {
                return;
            }
            let candidate =
                state
                    .candidates
                    .entry(key.clone())
                    .or_insert_with(|| PromotionCandidate {
                        skill: skill.to_string(),
                        params: params.clone(),
                        count: 0,
                    });
            if candidate.skill != skill {
                // The trigger no longer maps to one action; restart the count.
                candidate.skill = skill.to_string();
                candidate.params = params.clone();
                candidate.count = 1;
                return;
            }
            candidate.count += 1;
            if candidate.count >= self.config.promote_min_count {
                state.candidates.remove(&key)
            } else {
                None
            }
        };
        if let Some(candidate) = promote {
            info!(
                "Promoting recurring pattern '{}' -> {} to reflex",
                key, candidate.skill
            );
            self.learn_pattern(
                trigger,
                &candidate.skill,
                candidate.params,
                self.config.promote_min_confidence,
            );
        }
    }

    pub fn report_success(&self, trigger: &str) {
        let key = normalize(trigger);
        let mut state = self.state.lock().unwrap();
        if let Some(pattern) = state.patterns.get_mut(&key) {
            pattern.success_count += 1;
            pattern.failure_count = 0;
            pattern.confidence = (pattern.confidence + 0.05).min(1.0);
        }
    }

    /// Record a reflex execution failure. Crossing the threshold
    /// blacklists the pattern for good and stores a negative lesson.
    pub fn report_failure(&self, trigger: &str) {
        let key = normalize(trigger);
        let lesson = {
            let mut state = self.state.lock().unwrap();
            let Some(pattern) = state.patterns.get_mut(&key) else {
                return;
            };
            pattern.failure_count += 1;
            pattern.confidence = (pattern.confidence - 0.2).max(0.0);
            if pattern.failure_count >= self.config.blacklist_threshold && !pattern.blacklisted {
                pattern.blacklisted = true;
                warn!(
                    "Blacklisting reflex pattern '{}' after {} failures",
                    key, pattern.failure_count
                );
                Some((key.clone(), pattern.skill.clone()))
            } else {
                None
            }
        };
        if let Some((trigger, skill)) = lesson {
            let fact = format!("reflex action '{}' keeps failing for this request", skill);
            if let Err(e) = self
                .lessons
                .save(&trigger, &fact, Polarity::Negative, "reflex")
            {
                warn!("Failed to record blacklist lesson: {}", e);
            }
        }
    }

    /// Record one reflex-to-fallback cycle for a session. Returns the
    /// cycle count so far.
    pub fn note_fallback(&self, session: &str) -> u32 {
        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions.entry(session.to_string()).or_default();
        state.fallbacks += 1;
        state.fallbacks
    }

    /// Whether this session has hit the fallback limit and must skip
    /// the reflex path.
    pub fn force_deep(&self, session: &str) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(session)
            .is_some_and(|s| s.fallbacks >= self.config.recursion_limit)
    }

    pub fn reset_session(&self, session: &str) {
        self.sessions.lock().unwrap().remove(session);
    }

    pub fn is_blacklisted(&self, trigger: &str) -> bool {
        let key = normalize(trigger);
        self.state
            .lock()
            .unwrap()
            .patterns
            .get(&key)
            .is_some_and(|p| p.blacklisted)
    }

    pub fn pattern(&self, trigger: &str) -> Option<ReflexPattern> {
        let key = normalize(trigger);
        self.state.lock().unwrap().patterns.get(&key).cloned()
    }

    pub fn pattern_count(&self) -> usize {
        self.state.lock().unwrap().patterns.len()
    }
}

impl crate::flush::FlushTarget for ReflexCache {
    fn name(&self) -> &'static str {
        "patterns"
    }

    fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let json = {
            let state = self.state.lock().unwrap();
            serde_json::to_string_pretty(&*state)?
        };
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write reflex snapshot: {:?}", path))?;
        Ok(())
    }
}
