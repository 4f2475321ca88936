//! Skill interface and registry.
//!
//! Skills own their business logic externally; the kernel only sees this
//! fixed polymorphic interface. The registry is enumerated explicitly at
//! startup, and execution outcomes are tracked per skill.

use crate::error::KernelError;
use crate::proposal::ParamMap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Capabilities this skill needs to execute at all. The safety
    /// envelope performs the parameter-level capability mapping.
    fn required_capabilities(&self) -> Vec<String>;

    async fn execute(&self, params: &ParamMap) -> Result<String, KernelError>;
}

/// Rolling execution stats for one skill.
#[derive(Debug, Clone, Default)]
pub struct SkillStats {
    pub calls: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

impl SkillStats {
    fn record(&mut self, success: bool, latency_ms: f64) {
        self.calls += 1;
        if !success {
            self.failures += 1;
        }
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.calls as f64;
    }
}

#[derive(Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
    stats: Mutex<HashMap<String, SkillStats>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        self.skills.insert(skill.name().to_string(), skill);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.keys().cloned().collect();
        names.sort();
        names
    }

    /// One-line catalog used in deliberation prompts.
    pub fn catalog(&self) -> String {
        let mut entries: Vec<(&String, &Arc<dyn Skill>)> = self.skills.iter().collect();
        entries.sort_by_key(|(name, _)| name.as_str());
        entries
            .iter()
            .map(|(name, skill)| format!("- {}: {}", name, skill.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn record_execution(&self, name: &str, success: bool, latency_ms: f64) {
        let mut stats = self.stats.lock().unwrap();
        stats
            .entry(name.to_string())
            .or_default()
            .record(success, latency_ms);
    }

    pub fn stats(&self, name: &str) -> Option<SkillStats> {
        self.stats.lock().unwrap().get(name).cloned()
    }
}

/// Trivial skill that returns its `text` parameter. Used for wiring
/// checks and as the default registered skill in a bare deployment.
pub struct EchoSkill;

#[async_trait]
impl Skill for EchoSkill {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Repeat the given text back"
    }

    fn required_capabilities(&self) -> Vec<String> {
        vec![]
    }

    async fn execute(&self, params: &ParamMap) -> Result<String, KernelError> {
        let text = params
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| KernelError::Validation("echo requires a 'text' parameter".into()))?;
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_skill_roundtrip() {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(EchoSkill));

        let skill = registry.get("echo").expect("registered");
        let mut params = ParamMap::new();
        params.insert("text".into(), serde_json::json!("hello"));
        assert_eq!(skill.execute(&params).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_echo_rejects_missing_param() {
        let skill = EchoSkill;
        let err = skill.execute(&ParamMap::new()).await.unwrap_err();
        assert!(matches!(err, KernelError::Validation(_)));
    }

    #[test]
    fn test_execution_stats_rolling_average() {
        let registry = SkillRegistry::new();
        registry.record_execution("echo", true, 10.0);
        registry.record_execution("echo", true, 30.0);
        registry.record_execution("echo", false, 20.0);

        let stats = registry.stats("echo").unwrap();
        assert_eq!(stats.calls, 3);
        assert_eq!(stats.failures, 1);
        assert!((stats.avg_latency_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_catalog_sorted() {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(EchoSkill));
        assert!(registry.catalog().starts_with("- echo:"));
    }
}
