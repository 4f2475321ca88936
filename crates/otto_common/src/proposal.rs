//! Action proposals and risk tiers.
//!
//! Every proposed side effect, whether it came from the reflex path or
//! full deliberation, is described by an [`ActionProposal`] and consumed
//! exactly once by the safety envelope.

use crate::request::RequestId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Risk classification for a proposed action.
///
/// Total order: `Safe < Medium < Destructive`. Anything the classifier
/// cannot match explicitly defaults to `Medium` (fail-safe).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Safe,
    Medium,
    Destructive,
}

impl RiskTier {
    /// Medium and Destructive actions are withheld until confirmed.
    pub fn needs_confirmation(&self) -> bool {
        *self >= RiskTier::Medium
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Medium => write!(f, "medium"),
            Self::Destructive => write!(f, "destructive"),
        }
    }
}

pub type ParamMap = serde_json::Map<String, serde_json::Value>;

/// A concrete skill invocation awaiting the safety gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionProposal {
    pub id: Uuid,
    pub skill: String,
    pub params: ParamMap,
    /// Set by the safety envelope's classifier; `None` until classified.
    pub risk: Option<RiskTier>,
    /// Normalized trigger phrase, present when the reflex cache produced
    /// this proposal so execution outcomes can feed back into it.
    #[serde(default)]
    pub trigger: Option<String>,
    pub request_id: RequestId,
}

impl ActionProposal {
    pub fn new(skill: impl Into<String>, params: ParamMap, request_id: RequestId) -> Self {
        Self {
            id: Uuid::new_v4(),
            skill: skill.into(),
            params,
            risk: None,
            trigger: None,
            request_id,
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    /// Flattened parameter view used by pattern-based risk checks.
    pub fn params_text(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => format!("{}={}", k, s),
                other => format!("{}={}", k, other),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A Medium or Destructive proposal parked until the session confirms,
/// rejects, or the expiry passes (treated as reject).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub proposal_id: Uuid,
    pub session: String,
    pub expires_at: DateTime<Utc>,
}

impl PendingConfirmation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
