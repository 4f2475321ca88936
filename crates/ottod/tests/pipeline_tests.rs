//! End-to-end pipeline tests: dispatcher, triage, reflex, safety gate,
//! and execution wired together through the controller.

use async_trait::async_trait;
use otto_common::config::{KernelConfig, SafetyConfig};
use otto_common::error::KernelError;
use otto_common::proposal::ParamMap;
use otto_common::request::{CancelToken, Request, RequestId};
use otto_common::skill::{Skill, SkillRegistry};
use ottod::backend::{ModelBackend, ScriptedBackend};
use ottod::controller::{Controller, ProgressSink};
use ottod::lessons::Polarity;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Collect {
    delivered: Mutex<Vec<(RequestId, String)>>,
}

impl Collect {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

impl ProgressSink for Collect {
    fn progress(&self, _request: RequestId, _message: &str) {}
    fn deliver(&self, request: RequestId, text: &str) {
        self.delivered.lock().unwrap().push((request, text.to_string()));
    }
}

struct ClipboardSkill;

#[async_trait]
impl Skill for ClipboardSkill {
    fn name(&self) -> &str {
        "clipboard"
    }
    fn required_capabilities(&self) -> Vec<String> {
        vec!["desktop_control".into()]
    }
    async fn execute(&self, _params: &ParamMap) -> Result<String, KernelError> {
        Ok("copied".into())
    }
}

struct FlakyListSkill;

#[async_trait]
impl Skill for FlakyListSkill {
    fn name(&self) -> &str {
        "filesystem"
    }
    fn required_capabilities(&self) -> Vec<String> {
        vec!["filesystem_read".into()]
    }
    async fn execute(&self, _params: &ParamMap) -> Result<String, KernelError> {
        Err(KernelError::ExecutionFailure("mount point missing".into()))
    }
}

struct Fixture {
    controller: Arc<Controller>,
    backend: Arc<ScriptedBackend>,
    sink: Arc<Collect>,
    _dir: tempfile::TempDir,
}

fn fixture(safety: SafetyConfig, skills: Vec<Arc<dyn Skill>>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = KernelConfig {
        data_dir: dir.path().to_path_buf(),
        safety,
        ..KernelConfig::default()
    };
    let backend = Arc::new(ScriptedBackend::new());
    let mut registry = SkillRegistry::new();
    for skill in skills {
        registry.register(skill);
    }
    let sink = Collect::new();
    let controller = Arc::new(
        Controller::new(
            config,
            Arc::clone(&backend) as Arc<dyn ModelBackend>,
            Arc::new(registry),
            Arc::clone(&sink) as Arc<dyn ProgressSink>,
        )
        .unwrap(),
    );
    Fixture {
        controller,
        backend,
        sink,
        _dir: dir,
    }
}

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

fn params(key: &str, value: &str) -> ParamMap {
    let mut map = ParamMap::new();
    map.insert(key.into(), serde_json::json!(value));
    map
}

#[tokio::test]
async fn test_expired_confirmation_never_executes() {
    // A medium-risk action parks; after its confirmation window passes,
    // a "yes" must not run it and validation must never have happened.
    let f = fixture(
        SafetyConfig {
            confirmation_expiry_secs: 0,
            ..SafetyConfig::default()
        },
        vec![Arc::new(ClipboardSkill)],
    );
    f.backend.push_action("", "clipboard", params("content", "hello"));

    let reply = f.controller.handle(request("copy hello to clipboard")).await;
    assert!(reply.contains("confirmation"));

    let reply = f.controller.handle(request("yes")).await;
    assert!(reply.to_lowercase().contains("nothing"));
    assert_eq!(f.controller.safety().validation_count(), 0);
}

#[tokio::test]
async fn test_repeated_reflex_failures_blacklist_through_controller() {
    let f = fixture(SafetyConfig::default(), vec![Arc::new(FlakyListSkill)]);
    f.controller
        .reflex()
        .learn_pattern("list backup", "filesystem", params("action", "list"), 0.9);

    for i in 0..2 {
        f.backend.push_text("Checked another way.");
        let reply = f.controller.handle(request("list backup")).await;
        // The user gets the deliberated answer, never the miss.
        assert_eq!(reply, "Checked another way.", "round {}", i);
    }

    // Third consecutive fallback: the session is switched to full
    // reasoning with an explicit notice, and the pattern blacklists.
    let reply = f.controller.handle(request("list backup")).await;
    assert!(reply.contains("full reasoning"));
    assert!(f.controller.reflex().is_blacklisted("list backup"));
    let negative = f
        .controller
        .lessons()
        .export(Some(Polarity::Negative))
        .unwrap();
    assert!(negative.iter().any(|r| r.source == "reflex"));
    assert!(negative.iter().any(|r| r.source == "executor"));

    // Blacklisted: the next round goes straight to deliberation.
    f.backend.push_text("Straight to reasoning.");
    let reply = f.controller.handle(request("list backup")).await;
    assert_eq!(reply, "Straight to reasoning.");
}

#[tokio::test]
async fn test_run_loop_processes_in_priority_order() {
    let f = fixture(SafetyConfig::default(), vec![]);
    for text in ["first", "second", "third"] {
        f.backend.push_text(text);
    }

    let background = f.controller.dispatch().submit(30, "tidy the cache", "scheduler");
    let urgent = f.controller.dispatch().submit(10, "whats the time", "terminal");
    let normal = f.controller.dispatch().submit(20, "play some music", "terminal");

    let runner = Arc::clone(&f.controller);
    let handle = tokio::spawn(async move { runner.run().await });

    while f.sink.count() < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f.controller.shutdown().await;
    handle.await.unwrap();

    let delivered = f.sink.delivered.lock().unwrap().clone();
    let order: Vec<RequestId> = delivered.iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec![urgent, normal, background]);
    // Scripted replies pop in handling order.
    assert_eq!(delivered[0].1, "first");
}

#[tokio::test]
async fn test_shutdown_flushes_snapshots() {
    let f = fixture(SafetyConfig::default(), vec![]);
    f.controller.start();
    f.controller
        .reflex()
        .learn_pattern("lock screen", "system_control", params("action", "lock"), 0.9);

    f.controller.shutdown().await;
    assert!(f._dir.path().join("reflex.json").exists());
    assert!(f._dir.path().join("model_stats.json").exists());
}
