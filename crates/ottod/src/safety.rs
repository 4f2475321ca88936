//! Safety envelope.
//!
//! Every proposed action passes through here exactly once, immediately
//! before execution. Classification is fail-safe: anything that cannot
//! be matched explicitly is Medium and therefore needs confirmation.
//!
//! A session holds at most one pending confirmation at a time; further
//! confirmable proposals queue behind it in arrival order. An expired
//! confirmation is a rejection.

use chrono::{DateTime, Duration, Utc};
use otto_common::capability::CapabilityRegistry;
use otto_common::config::SafetyConfig;
use otto_common::error::KernelError;
use otto_common::proposal::{ActionProposal, PendingConfirmation, RiskTier};
use otto_common::redact;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};
use tracing::{info, warn};

/// Parameter substrings that make any action Destructive.
const DESTRUCTIVE_MARKERS: &[&str] = &[
    "rm -rf", "rm -r ", "mkfs", "dd if=", "shred", "shutdown", "reboot", "poweroff",
    "format c:", "> /dev/", "truncate -s 0",
];

/// Shell chaining operators; a chained command is Destructive because
/// the tail cannot be classified.
const SHELL_CHAIN_OPS: &[&str] = &[";", "&&", "||", "|", "$(", "`"];

/// Parameter keys whose values are treated as filesystem paths.
const PATH_PARAM_KEYS: &[&str] = &["path", "file", "dest", "target", "directory", "source"];

/// Blocked outright at validation, confirmation or not.
static PROHIBITED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"rm\s+-rf?\s+/\s*$",
        r"rm\s+-rf?\s+/\s",
        r"mkfs\.",
        r"dd\s+if=.*of=/dev/",
        r":\(\)\s*\{.*\}\s*;?\s*:",
        r"(?i)curl\s+[^|]*\|\s*(ba)?sh",
        r"(?i)wget\s+[^|]*\|\s*(ba)?sh",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Lines dropped from inbound payloads before triage sees them.
static INJECTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+instructions",
        r"(?i)disregard\s+your\s+(rules|instructions|guidelines)",
        r"(?i)you\s+are\s+now\s+(an?\s+)?unrestricted",
        r"(?i)reveal\s+your\s+system\s+prompt",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const MAX_INPUT_LEN: usize = 4_096;

#[derive(Default)]
struct SessionGate {
    pending: Option<(PendingConfirmation, ActionProposal)>,
    queued: VecDeque<ActionProposal>,
}

pub struct SafetyEnvelope {
    capabilities: CapabilityRegistry,
    config: SafetyConfig,
    gates: Mutex<HashMap<String, SessionGate>>,
    validations: AtomicU64,
}

impl SafetyEnvelope {
    pub fn new(capabilities: CapabilityRegistry, config: SafetyConfig) -> Self {
        Self {
            capabilities,
            config,
            gates: Mutex::new(HashMap::new()),
            validations: AtomicU64::new(0),
        }
    }

    /// Classify a proposal's risk tier and record it on the proposal.
    pub fn classify(&self, proposal: &mut ActionProposal) -> RiskTier {
        let text = proposal.params_text().to_lowercase();

        let tier = if DESTRUCTIVE_MARKERS.iter().any(|m| text.contains(m)) {
            RiskTier::Destructive
        } else if proposal.skill == "shell" && SHELL_CHAIN_OPS.iter().any(|op| text.contains(op)) {
            RiskTier::Destructive
        } else {
            let check = self
                .capabilities
                .check_permission(&proposal.skill, &proposal.params);
            match check
                .capability
                .as_deref()
                .and_then(|name| self.capabilities.get(name))
            {
                Some(cap) => cap.risk,
                // Unmatched actions are Medium, never Safe.
                None => RiskTier::Medium,
            }
        };
        proposal.risk = Some(tier);
        tier
    }

    /// Final gate, run exactly once immediately before execution.
    pub fn validate_action(&self, proposal: &ActionProposal) -> Result<(), KernelError> {
        self.validations.fetch_add(1, Ordering::SeqCst);

        if proposal.risk.is_none() {
            return Err(KernelError::Validation(
                "proposal reached execution unclassified".into(),
            ));
        }

        let check = self
            .capabilities
            .check_permission(&proposal.skill, &proposal.params);
        if !check.allowed {
            return Err(KernelError::CapabilityDenied(check.reason));
        }

        let text = proposal.params_text();
        if let Some(pattern) = PROHIBITED_PATTERNS.iter().find(|p| p.is_match(&text)) {
            warn!(
                "Blocked proposal {} ({}): prohibited pattern",
                proposal.id, proposal.skill
            );
            return Err(KernelError::SafetyBlocked(format!(
                "prohibited pattern {}",
                pattern.as_str()
            )));
        }

        for key in PATH_PARAM_KEYS {
            if let Some(value) = proposal.params.get(*key).and_then(|v| v.as_str()) {
                self.check_sandbox(value)?;
            }
        }
        Ok(())
    }

    /// Times `validate_action` has run. One execution, one validation.
    pub fn validation_count(&self) -> u64 {
        self.validations.load(Ordering::SeqCst)
    }

    fn check_sandbox(&self, raw: &str) -> Result<(), KernelError> {
        let path = Path::new(raw);
        if !path.is_absolute() {
            return Ok(());
        }
        let normalized = lexical_normalize(path)
            .ok_or_else(|| KernelError::SafetyBlocked(format!("path escapes root: {}", raw)))?;
        if self
            .config
            .sandbox_roots
            .iter()
            .any(|root| normalized.starts_with(root))
        {
            Ok(())
        } else {
            Err(KernelError::SafetyBlocked(format!(
                "path outside sandbox roots: {}",
                raw
            )))
        }
    }

    /// Strip control characters and prompt-injection lines from an
    /// inbound payload; long payloads are truncated.
    pub fn sanitize_input(&self, input: &str) -> String {
        let mut cleaned: String = input
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect();
        if cleaned.len() > MAX_INPUT_LEN {
            let mut cut = MAX_INPUT_LEN;
            while !cleaned.is_char_boundary(cut) {
                cut -= 1;
            }
            cleaned.truncate(cut);
        }
        cleaned
            .lines()
            .filter(|line| {
                let keep = !INJECTION_PATTERNS.iter().any(|p| p.is_match(line));
                if !keep {
                    warn!("Dropped injection-shaped line from input");
                }
                keep
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Redact secret-shaped content from anything leaving the kernel.
    pub fn sanitize_output(&self, output: &str) -> String {
        redact::redact(output)
    }

    /// Park a confirmable proposal. If the session already has one
    /// pending, the new proposal queues behind it.
    pub fn request_confirmation(
        &self,
        session: &str,
        proposal: ActionProposal,
    ) -> PendingConfirmation {
        let mut gates = self.gates.lock().unwrap();
        let gate = gates.entry(session.to_string()).or_default();
        if gate.pending.is_some() {
            info!(
                "Session {} already awaiting confirmation; queueing proposal {}",
                session, proposal.id
            );
            let pending = PendingConfirmation {
                proposal_id: proposal.id,
                session: session.to_string(),
                expires_at: self.expiry_from(Utc::now()),
            };
            gate.queued.push_back(proposal);
            return pending;
        }
        let pending = PendingConfirmation {
            proposal_id: proposal.id,
            session: session.to_string(),
            expires_at: self.expiry_from(Utc::now()),
        };
        gate.pending = Some((pending.clone(), proposal));
        pending
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.config.confirmation_expiry_secs as i64)
    }

    /// Confirm the session's pending proposal. Returns it for execution,
    /// or `None` if nothing is pending or it already expired (expiry is
    /// a rejection). The next queued proposal, if any, becomes pending.
    pub fn confirm(&self, session: &str) -> Option<ActionProposal> {
        let mut gates = self.gates.lock().unwrap();
        let gate = gates.get_mut(session)?;
        let (pending, proposal) = gate.pending.take()?;
        Self::promote_next(gate, session, self.expiry_from(Utc::now()));
        if pending.is_expired(Utc::now()) {
            info!(
                "Confirmation for proposal {} arrived after expiry; rejecting",
                pending.proposal_id
            );
            return None;
        }
        Some(proposal)
    }

    /// Reject the session's pending proposal. Returns the discarded
    /// proposal if one was pending.
    pub fn reject(&self, session: &str) -> Option<ActionProposal> {
        let mut gates = self.gates.lock().unwrap();
        let gate = gates.get_mut(session)?;
        let (_, proposal) = gate.pending.take()?;
        Self::promote_next(gate, session, self.expiry_from(Utc::now()));
        Some(proposal)
    }

    fn promote_next(gate: &mut SessionGate, session: &str, expires_at: DateTime<Utc>) {
        if let Some(next) = gate.queued.pop_front() {
            let pending = PendingConfirmation {
                proposal_id: next.id,
                session: session.to_string(),
                expires_at,
            };
            gate.pending = Some((pending, next));
        }
    }

    /// Drop expired pending confirmations across all sessions and
    /// promote whatever queued behind them. Returns the discarded
    /// proposals.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Vec<ActionProposal> {
        let mut gates = self.gates.lock().unwrap();
        let mut expired = Vec::new();
        for (session, gate) in gates.iter_mut() {
            while let Some((pending, _)) = &gate.pending {
                if !pending.is_expired(now) {
                    break;
                }
                let (pending, proposal) = gate.pending.take().unwrap();
                info!(
                    "Confirmation expired for proposal {} in session {}",
                    pending.proposal_id, session
                );
                expired.push(proposal);
                Self::promote_next(gate, session, self.expiry_from(now));
            }
        }
        expired
    }

    pub fn pending_for(&self, session: &str) -> Option<PendingConfirmation> {
        self.gates
            .lock()
            .unwrap()
            .get(session)
            .and_then(|gate| gate.pending.as_ref().map(|(p, _)| p.clone()))
    }
}

/// Purely lexical path normalization: resolves `.` and `..` without
/// touching the filesystem. `None` if `..` would climb past the root.
fn lexical_normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() || normalized.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    Some(normalized)
}
