//! Triage classifier.
//!
//! Routes each request down one of four paths before any model is
//! involved: the reflex fast path, shallow single-pass reasoning, deep
//! multi-step reasoning, or outright refusal. Each tier carries a soft
//! latency budget; overruns notify the caller, only the hard ceiling
//! cancels.
//!
//! Triage also consults lesson memory: a request resembling past
//! failures is escalated one tier so it gets more reasoning, not less.

use crate::lessons::{LessonStore, Polarity};
use crate::reflex::ReflexCache;
use otto_common::config::BudgetConfig;
use otto_common::proposal::ActionProposal;
use otto_common::request::Request;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Requests matching any of these are refused without reasoning.
static REFUSAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(steal|exfiltrate|harvest)\b.*\b(password|credential|token|cookie)s?\b",
        r"(?i)\bkeylogger\b",
        r"(?i)\b(ransomware|malware|botnet)\b",
        r"(?i)\bwipe\b.*\b(all|every|entire)\b.*\b(disk|drive|data)\b",
        r"(?i)\bdisable\b.*\b(safety|sandbox|confirmation)s?\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Markers of multi-step or research-like work.
const DEEP_MARKERS: &[&str] = &[
    "research", "investigate", "analyze", "compare", "summarize", "plan", "explain why",
    "look up", "find out", "latest",
];

const CODING_MARKERS: &[&str] =
    &["write code", "debug", "refactor", "implement", "compile", "stack trace"];

const RESEARCH_MARKERS: &[&str] =
    &["research", "look up", "find out", "search for", "latest", "news"];

/// Shallow answers get this many words of slack before the complexity
/// heuristic escalates to deep.
const SHALLOW_WORD_LIMIT: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Reflex,
    Shallow,
    Deep,
    Refuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    General,
    Research,
    Coding,
}

#[derive(Debug)]
pub struct TriageDecision {
    pub tier: Tier,
    pub intent: Intent,
    /// Soft budget for this tier; zero for refusals.
    pub budget_ms: u64,
    /// Model capabilities this tier needs.
    pub required_capabilities: Vec<String>,
    pub reason: String,
    /// Present only on the reflex path.
    pub proposal: Option<ActionProposal>,
}

pub struct TriageClassifier {
    reflex: Arc<ReflexCache>,
    lessons: Arc<LessonStore>,
    budgets: BudgetConfig,
}

impl TriageClassifier {
    pub fn new(reflex: Arc<ReflexCache>, lessons: Arc<LessonStore>, budgets: BudgetConfig) -> Self {
        Self {
            reflex,
            lessons,
            budgets,
        }
    }

    /// Classify a request. `allow_reflex` is false on re-triage after a
    /// failed reflex and when the session's fallback guard has tripped.
    pub fn classify(&self, request: &Request, allow_reflex: bool) -> TriageDecision {
        let payload = request.payload.trim();

        if let Some(pattern) = REFUSAL_PATTERNS.iter().find(|p| p.is_match(payload)) {
            return TriageDecision {
                tier: Tier::Refuse,
                intent: Intent::General,
                budget_ms: 0,
                required_capabilities: vec![],
                reason: format!("matched refusal pattern {}", pattern.as_str()),
                proposal: None,
            };
        }

        let forced_deep = self.reflex.force_deep(&request.source);
        if allow_reflex && !forced_deep {
            if let Some(proposal) = self.reflex.match_trigger(payload, request.id) {
                return TriageDecision {
                    tier: Tier::Reflex,
                    intent: Intent::General,
                    budget_ms: self.budgets.reflex_ms,
                    required_capabilities: vec![],
                    reason: "reflex pattern hit".into(),
                    proposal: Some(proposal),
                };
            }
        }

        let lower = payload.to_lowercase();
        let intent = if CODING_MARKERS.iter().any(|m| lower.contains(m)) {
            Intent::Coding
        } else if RESEARCH_MARKERS.iter().any(|m| lower.contains(m)) {
            Intent::Research
        } else {
            Intent::General
        };

        let mut deep = intent != Intent::General
            || lower.split_whitespace().count() > SHALLOW_WORD_LIMIT
            || DEEP_MARKERS.iter().any(|m| lower.contains(m));
        let mut reason = if deep {
            "complexity heuristic".to_string()
        } else {
            "short single-step request".to_string()
        };

        // A session that keeps falling out of the reflex path gets full
        // reasoning regardless of how simple the request looks.
        if forced_deep && !deep {
            deep = true;
            reason = "session switched to full reasoning".into();
        }

        // Requests resembling past failures get more reasoning.
        if !deep && self.resembles_past_failure(payload) {
            deep = true;
            reason = "escalated: resembles a past failure".into();
            debug!("Escalating '{}' to deep triage", payload);
        }

        let (tier, budget_ms) = if deep {
            (Tier::Deep, self.budgets.deep_ms)
        } else {
            (Tier::Shallow, self.budgets.shallow_ms)
        };

        let mut required_capabilities = vec!["general".to_string()];
        match tier {
            Tier::Deep => required_capabilities.push("reasoning".into()),
            Tier::Shallow => required_capabilities.push("fast_response".into()),
            _ => {}
        }
        match intent {
            Intent::Research => required_capabilities.push("researching".into()),
            Intent::Coding => required_capabilities.push("coding".into()),
            Intent::General => {}
        }

        TriageDecision {
            tier,
            intent,
            budget_ms,
            required_capabilities,
            reason,
            proposal: None,
        }
    }

    fn resembles_past_failure(&self, payload: &str) -> bool {
        match self.lessons.get_relevant(payload, 3) {
            Ok(records) => records.iter().any(|r| r.polarity == Polarity::Negative),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otto_common::config::ReflexConfig;
    use otto_common::proposal::ParamMap;
    use otto_common::request::{CancelToken, RequestId};

    fn request(payload: &str) -> Request {
        Request {
            id: RequestId::new(),
            priority: 20,
            seq: 0,
            payload: payload.into(),
            source: "terminal".into(),
            cancel: CancelToken::new(),
            enqueued_at: chrono::Utc::now(),
        }
    }

    fn classifier() -> (TriageClassifier, Arc<ReflexCache>, Arc<LessonStore>) {
        let lessons = Arc::new(LessonStore::open_in_memory().unwrap());
        let reflex = Arc::new(ReflexCache::new(ReflexConfig::default(), Arc::clone(&lessons)));
        let triage = TriageClassifier::new(
            Arc::clone(&reflex),
            Arc::clone(&lessons),
            BudgetConfig::default(),
        );
        (triage, reflex, lessons)
    }

    #[test]
    fn test_short_command_is_shallow() {
        let (triage, _, _) = classifier();
        let decision = triage.classify(&request("dim the lights"), true);
        assert_eq!(decision.tier, Tier::Shallow);
        assert_eq!(decision.budget_ms, 3_000);
        assert!(decision
            .required_capabilities
            .contains(&"fast_response".to_string()));
    }

    #[test]
    fn test_research_request_is_deep() {
        let (triage, _, _) = classifier();
        let decision = triage.classify(&request("research the latest rust release notes"), true);
        assert_eq!(decision.tier, Tier::Deep);
        assert_eq!(decision.intent, Intent::Research);
        assert_eq!(decision.budget_ms, 10_000);
        assert!(decision
            .required_capabilities
            .contains(&"researching".to_string()));
    }

    #[test]
    fn test_long_request_escalates_to_deep() {
        let (triage, _, _) = classifier();
        let decision = triage.classify(
            &request("could you please have a careful look at all of my open projects and tell me which one needs attention first"),
            true,
        );
        assert_eq!(decision.tier, Tier::Deep);
    }

    #[test]
    fn test_harmful_request_is_refused() {
        let (triage, _, _) = classifier();
        let decision = triage.classify(&request("steal the browser passwords"), true);
        assert_eq!(decision.tier, Tier::Refuse);
        assert_eq!(decision.budget_ms, 0);

        let decision = triage.classify(&request("disable the safety confirmations"), true);
        assert_eq!(decision.tier, Tier::Refuse);
    }

    #[test]
    fn test_reflex_hit_carries_proposal() {
        let (triage, reflex, _) = classifier();
        let mut params = ParamMap::new();
        params.insert("text".into(), serde_json::json!("lock"));
        reflex.learn_pattern("lock screen", "desktop", params, 0.9);

        let decision = triage.classify(&request("lock screen"), true);
        assert_eq!(decision.tier, Tier::Reflex);
        assert_eq!(decision.proposal.unwrap().skill, "desktop");
    }

    #[test]
    fn test_reflex_suppressed_on_retriage() {
        let (triage, reflex, _) = classifier();
        let mut params = ParamMap::new();
        params.insert("text".into(), serde_json::json!("lock"));
        reflex.learn_pattern("lock screen", "desktop", params, 0.9);

        let decision = triage.classify(&request("lock screen"), false);
        assert_ne!(decision.tier, Tier::Reflex);
        assert!(decision.proposal.is_none());
    }

    #[test]
    fn test_session_guard_forces_past_reflex() {
        let (triage, reflex, _) = classifier();
        let mut params = ParamMap::new();
        params.insert("text".into(), serde_json::json!("lock"));
        reflex.learn_pattern("lock screen", "desktop", params, 0.9);
        for _ in 0..3 {
            reflex.note_fallback("terminal");
        }

        let decision = triage.classify(&request("lock screen"), true);
        assert_ne!(decision.tier, Tier::Reflex);
    }

    #[test]
    fn test_tripped_session_classifies_deep() {
        let (triage, reflex, _) = classifier();
        for _ in 0..3 {
            reflex.note_fallback("terminal");
        }

        // A request that would normally be shallow goes deep, with the
        // deep budget and capability set.
        let decision = triage.classify(&request("dim the lights"), true);
        assert_eq!(decision.tier, Tier::Deep);
        assert_eq!(decision.budget_ms, 10_000);
        assert!(decision
            .required_capabilities
            .contains(&"reasoning".to_string()));
        assert!(decision.reason.contains("full reasoning"));
    }

    #[test]
    fn test_past_failure_escalates_shallow_to_deep() {
        let (triage, _, lessons) = classifier();
        lessons
            .save(
                "mount backup drive",
                "mounting the backup drive keeps timing out",
                Polarity::Negative,
                "executor",
            )
            .unwrap();

        let decision = triage.classify(&request("mount backup drive"), true);
        assert_eq!(decision.tier, Tier::Deep);
        assert!(decision.reason.contains("past failure"));
    }
}
