//! Capability registry.
//!
//! A capability is a named permission a skill must hold for a class of
//! actions. The registry is built explicitly at startup and consulted
//! read-only by the safety envelope and triage.

use crate::proposal::{ParamMap, RiskTier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Unique identifier, e.g. `internet_research`.
    pub name: String,
    pub description: String,
    pub risk: RiskTier,
    pub read_only: bool,
    pub requires_confirmation: bool,
    pub enabled: bool,
    /// Skills that implement this capability.
    pub linked_skills: Vec<String>,
}

/// Outcome of a permission check, kept explicit so callers can log the
/// exists/enabled split rather than a bare boolean.
#[derive(Debug, Clone)]
pub struct CapabilityCheck {
    pub allowed: bool,
    pub exists: bool,
    pub enabled: bool,
    pub reason: String,
    pub capability: Option<String>,
}

impl CapabilityCheck {
    fn denied(exists: bool, enabled: bool, reason: String, cap: Option<String>) -> Self {
        Self {
            allowed: false,
            exists,
            enabled,
            reason,
            capability: cap,
        }
    }

    fn granted(cap: &str) -> Self {
        Self {
            allowed: true,
            exists: true,
            enabled: true,
            reason: format!("Granted by capability '{}'", cap),
            capability: Some(cap.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Capability>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard capability set for a desktop assistant deployment.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Capability {
            name: "internet_research".into(),
            description: "Search the public internet and read page content.".into(),
            risk: RiskTier::Safe,
            read_only: true,
            requires_confirmation: false,
            enabled: true,
            linked_skills: vec!["research".into()],
        });
        registry.register(Capability {
            name: "filesystem_read".into(),
            description: "Read files and list directories.".into(),
            risk: RiskTier::Safe,
            read_only: true,
            requires_confirmation: false,
            enabled: true,
            linked_skills: vec!["filesystem".into()],
        });
        registry.register(Capability {
            name: "filesystem_write".into(),
            description: "Create, edit, or delete files.".into(),
            risk: RiskTier::Medium,
            read_only: false,
            requires_confirmation: true,
            enabled: true,
            linked_skills: vec!["filesystem".into()],
        });
        registry.register(Capability {
            name: "shell_exec".into(),
            description: "Execute shell commands on the host.".into(),
            risk: RiskTier::Destructive,
            read_only: false,
            requires_confirmation: true,
            enabled: true,
            linked_skills: vec!["shell".into()],
        });
        registry.register(Capability {
            name: "desktop_control".into(),
            description: "Clipboard, windows, and media control.".into(),
            risk: RiskTier::Medium,
            read_only: false,
            requires_confirmation: false,
            enabled: true,
            linked_skills: vec![
                "clipboard".into(),
                "media_control".into(),
                "system_control".into(),
            ],
        });
        registry
    }

    pub fn register(&mut self, cap: Capability) {
        self.capabilities.insert(cap.name.clone(), cap);
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.capabilities.get(name)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.capabilities.get_mut(name) {
            Some(cap) => {
                cap.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Map a skill invocation to its governing capability.
    ///
    /// Filesystem write-shaped actions map to `filesystem_write`;
    /// everything else on the filesystem skill is a read.
    fn capability_for(&self, skill: &str, params: &ParamMap) -> Option<String> {
        let direct = match skill {
            "research" => Some("internet_research"),
            "shell" => Some("shell_exec"),
            "clipboard" | "media_control" | "system_control" => Some("desktop_control"),
            "filesystem" => {
                let action = params
                    .get("action")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if matches!(action, "write" | "write_file" | "delete" | "remove" | "create_dir") {
                    Some("filesystem_write")
                } else {
                    Some("filesystem_read")
                }
            }
            _ => None,
        };
        if let Some(name) = direct {
            return Some(name.to_string());
        }
        // Fallback: scan linked skills
        self.capabilities
            .values()
            .find(|cap| cap.linked_skills.iter().any(|s| s == skill))
            .map(|cap| cap.name.clone())
    }

    pub fn check_permission(&self, skill: &str, params: &ParamMap) -> CapabilityCheck {
        let Some(name) = self.capability_for(skill, params) else {
            return CapabilityCheck::denied(
                false,
                false,
                format!("No capability registered for skill '{}'", skill),
                None,
            );
        };
        match self.get(&name) {
            None => CapabilityCheck::denied(
                false,
                false,
                format!("Capability '{}' is not installed", name),
                Some(name),
            ),
            Some(cap) if !cap.enabled => CapabilityCheck::denied(
                true,
                false,
                format!("Capability '{}' is disabled by policy", name),
                Some(name),
            ),
            Some(cap) => CapabilityCheck::granted(&cap.name),
        }
    }
}
