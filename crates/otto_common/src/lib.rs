//! Shared types for the Otto cognitive dispatch kernel.
//!
//! The daemon crate (`ottod`) holds the moving parts; this crate holds
//! the data model, capability registry, skill interface, secret
//! redaction, configuration, and the error taxonomy.

pub mod capability;
pub mod config;
pub mod error;
pub mod proposal;
pub mod redact;
pub mod request;
pub mod skill;

pub use capability::{Capability, CapabilityCheck, CapabilityRegistry};
pub use config::KernelConfig;
pub use error::KernelError;
pub use proposal::{ActionProposal, ParamMap, PendingConfirmation, RiskTier};
pub use request::{CancelToken, Request, RequestId};
pub use skill::{Skill, SkillRegistry};
