//! Error types for the Otto dispatch kernel.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Malformed proposal: {0}")]
    Validation(String),

    #[error("Capability denied: {0}")]
    CapabilityDenied(String),

    #[error("Blocked by safety policy: {0}")]
    SafetyBlocked(String),

    #[error("No model available: {0}")]
    ModelUnavailable(String),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Reflex fallback recursion limit exceeded")]
    RecursionLimitExceeded,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KernelError {
    /// Caller-facing message. Safety and capability refusals are surfaced
    /// as plain refusals without internal policy detail.
    pub fn user_message(&self) -> String {
        match self {
            KernelError::SafetyBlocked(_) | KernelError::CapabilityDenied(_) => {
                "I can't do that. The action was declined by policy.".to_string()
            }
            KernelError::RecursionLimitExceeded => {
                "Switching to full reasoning for this session.".to_string()
            }
            KernelError::Cancelled => "Request cancelled.".to_string(),
            KernelError::Timeout(_) => "That took too long and was stopped.".to_string(),
            KernelError::ModelUnavailable(_) => {
                "No suitable model is available right now.".to_string()
            }
            other => format!("Something went wrong: {}", other),
        }
    }

    /// Whether this error ends the proposal outright (no retry, no fallback).
    pub fn is_terminal_for_proposal(&self) -> bool {
        matches!(
            self,
            KernelError::SafetyBlocked(_) | KernelError::CapabilityDenied(_)
        )
    }
}
