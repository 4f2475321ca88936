//! Orchestrating controller.
//!
//! Owns the full request pipeline: dequeue, sanitize, triage, the
//! reflex fast path with silent fallback, deliberation under latency
//! budgets, and the safety-gated execution of proposed actions.
//!
//! Soft budget overruns notify the session and let the work finish;
//! only the hard ceiling cancels. A failed reflex is re-triaged without
//! the reflex path and the user never sees the internal miss.

use crate::backend::ModelBackend;
use crate::dispatch::IngressDispatcher;
use crate::flush::Flusher;
use crate::lessons::{LessonStore, Polarity};
use crate::reflex::ReflexCache;
use crate::router::ModelRouter;
use crate::safety::SafetyEnvelope;
use crate::triage::{Tier, TriageClassifier, TriageDecision};
use crate::worker::WorkerPool;
use anyhow::{Context, Result};
use otto_common::capability::CapabilityRegistry;
use otto_common::config::KernelConfig;
use otto_common::error::KernelError;
use otto_common::proposal::ActionProposal;
use otto_common::request::{Request, RequestId};
use otto_common::skill::SkillRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const REFUSAL_REPLY: &str = "I can't help with that.";
const NOTHING_PENDING_REPLY: &str = "There's nothing waiting for confirmation.";
const REJECTED_REPLY: &str = "Okay, I won't do that.";
const PROGRESS_REPLY: &str = "Still working on it, this is taking longer than usual.";
/// Single-access lessons older than this are dropped at shutdown.
const LESSON_RETENTION_DAYS: i64 = 90;

/// Where replies and mid-flight progress notes go. The daemon wires a
/// session transport here; tests record.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, request: RequestId, message: &str);
    fn deliver(&self, request: RequestId, text: &str);
}

/// Default sink: everything goes to the log.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn progress(&self, request: RequestId, message: &str) {
        info!("[{}] progress: {}", request, message);
    }

    fn deliver(&self, request: RequestId, text: &str) {
        info!("[{}] reply: {}", request, text);
    }
}

enum ProposalOutcome {
    Executed(String),
    AwaitingConfirmation(String),
}

pub struct Controller {
    config: KernelConfig,
    dispatch: IngressDispatcher,
    triage: TriageClassifier,
    reflex: Arc<ReflexCache>,
    safety: Arc<SafetyEnvelope>,
    router: Arc<ModelRouter>,
    lessons: Arc<LessonStore>,
    skills: Arc<SkillRegistry>,
    backend: Arc<dyn ModelBackend>,
    pool: WorkerPool,
    flusher: Arc<Flusher>,
    sink: Arc<dyn ProgressSink>,
}

impl Controller {
    pub fn new(
        config: KernelConfig,
        backend: Arc<dyn ModelBackend>,
        skills: Arc<SkillRegistry>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data dir: {:?}", config.data_dir))?;

        let lessons = Arc::new(LessonStore::open(&config.data_dir.join("lessons.db"))?);
        let reflex = Arc::new(
            ReflexCache::new(config.reflex, Arc::clone(&lessons))
                .with_snapshot(config.data_dir.join("reflex.json")),
        );
        let router = Arc::new(
            ModelRouter::new(&config.models, config.router)
                .with_snapshot(config.data_dir.join("model_stats.json")),
        );
        let safety = Arc::new(SafetyEnvelope::new(
            CapabilityRegistry::with_defaults(),
            config.safety.clone(),
        ));
        let triage = TriageClassifier::new(
            Arc::clone(&reflex),
            Arc::clone(&lessons),
            config.budgets,
        );
        let dispatch = IngressDispatcher::new(config.queue.clone());
        let pool = WorkerPool::new(config.worker);

        let flusher = Flusher::new(Duration::from_millis(config.flush.debounce_ms));
        flusher.register(Arc::clone(&reflex) as Arc<dyn crate::flush::FlushTarget>);
        flusher.register(Arc::clone(&lessons) as Arc<dyn crate::flush::FlushTarget>);
        flusher.register(Arc::clone(&router) as Arc<dyn crate::flush::FlushTarget>);

        Ok(Self {
            config,
            dispatch,
            triage,
            reflex,
            safety,
            router,
            lessons,
            skills,
            backend,
            pool,
            flusher,
            sink,
        })
    }

    pub fn dispatch(&self) -> &IngressDispatcher {
        &self.dispatch
    }

    pub fn reflex(&self) -> &Arc<ReflexCache> {
        &self.reflex
    }

    pub fn safety(&self) -> &Arc<SafetyEnvelope> {
        &self.safety
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    pub fn lessons(&self) -> &Arc<LessonStore> {
        &self.lessons
    }

    pub fn start(&self) {
        self.flusher.start();
    }

    /// Drain the dispatcher until shutdown.
    pub async fn run(&self) {
        while let Some(request) = self.dispatch.next().await {
            let guard = self.dispatch.track_active(&request);
            let id = request.id;
            let reply = self.handle(request).await;
            drop(guard);
            self.sink.deliver(id, &reply);
        }
        info!("Dispatcher drained, controller stopping");
    }

    pub async fn shutdown(&self) {
        self.dispatch.shutdown();
        if let Err(e) = self.lessons.prune(LESSON_RETENTION_DAYS) {
            warn!("Lesson pruning failed: {}", e);
        }
        self.flusher.shutdown().await;
    }

    /// Process one request end to end. Always produces a caller-facing
    /// reply; internal errors are translated, never leaked raw.
    pub async fn handle(&self, mut request: Request) -> String {
        if request.cancel.is_cancelled() {
            return KernelError::Cancelled.user_message();
        }

        let expired = self.safety.expire_stale(chrono::Utc::now());
        for proposal in &expired {
            debug!("Confirmation expired, dropping proposal {}", proposal.id);
        }

        match request.payload.trim().to_lowercase().as_str() {
            "yes" | "y" | "confirm" | "approve" => return self.handle_confirm(&request).await,
            "no" | "n" | "reject" | "deny" => {
                return match self.safety.reject(&request.source) {
                    Some(_) => REJECTED_REPLY.to_string(),
                    None => NOTHING_PENDING_REPLY.to_string(),
                };
            }
            _ => {}
        }

        request.payload = self.safety.sanitize_input(&request.payload);
        let decision = self.triage.classify(&request, true);
        debug!(
            "Triaged '{}' as {:?} ({})",
            request.payload, decision.tier, decision.reason
        );

        match decision.tier {
            Tier::Refuse => REFUSAL_REPLY.to_string(),
            Tier::Reflex => self.handle_reflex(&request, decision).await,
            Tier::Shallow | Tier::Deep => match self.deliberate(&request, &decision).await {
                Ok(reply) => reply,
                Err(e) => e.user_message(),
            },
        }
    }

    async fn handle_confirm(&self, request: &Request) -> String {
        let Some(proposal) = self.safety.confirm(&request.source) else {
            return NOTHING_PENDING_REPLY.to_string();
        };
        // A confirmed reflex proposal counts toward its pattern's record
        // the same as an immediate execution would.
        match self.execute_validated(request, &proposal).await {
            Ok(output) => {
                if let Some(trigger) = &proposal.trigger {
                    self.reflex.report_success(trigger);
                }
                output
            }
            Err(e) => {
                if let Some(trigger) = &proposal.trigger {
                    self.reflex.report_failure(trigger);
                }
                e.user_message()
            }
        }
    }

    /// Reflex path. A failure is reported to the cache and the request
    /// silently re-triaged with the reflex path disabled.
    async fn handle_reflex(&self, request: &Request, mut decision: TriageDecision) -> String {
        let proposal = match decision.proposal.take() {
            Some(p) => p,
            None => return self.retriage(request).await,
        };
        match self.process_proposal(request, proposal).await {
            Ok(ProposalOutcome::Executed(output)) => {
                self.reflex.report_success(&request.payload);
                output
            }
            Ok(ProposalOutcome::AwaitingConfirmation(message)) => message,
            // Any reflex failure, validation included, falls back to
            // deliberation without surfacing the miss.
            Err(e) => {
                debug!("Reflex attempt failed ({}), falling back", e);
                self.reflex.report_failure(&request.payload);
                let cycles = self.reflex.note_fallback(&request.source);
                if cycles >= self.config.reflex.recursion_limit {
                    info!(
                        "Session {} hit the reflex fallback limit, forcing full reasoning",
                        request.source
                    );
                    return KernelError::RecursionLimitExceeded.user_message();
                }
                self.retriage(request).await
            }
        }
    }

    async fn retriage(&self, request: &Request) -> String {
        let decision = self.triage.classify(request, false);
        if decision.tier == Tier::Refuse {
            return REFUSAL_REPLY.to_string();
        }
        match self.deliberate(request, &decision).await {
            Ok(reply) => reply,
            Err(e) => e.user_message(),
        }
    }

    async fn deliberate(
        &self,
        request: &Request,
        decision: &TriageDecision,
    ) -> Result<String, KernelError> {
        let (model, budget_ms) = self.pick_model(decision)?;
        let prompt = self.build_prompt(request, decision);

        let started = Instant::now();
        let result = self
            .complete_with_budget(request, &model, &prompt, budget_ms)
            .await;
        let latency_ms = started.elapsed().as_millis() as f64;

        let reply = match result {
            Ok(reply) => {
                self.router.record_performance(&model, true, latency_ms);
                self.flusher.mark_dirty();
                reply
            }
            Err(e) => {
                if !matches!(e, KernelError::Cancelled) {
                    self.router.record_performance(&model, false, latency_ms);
                    self.flusher.mark_dirty();
                }
                return Err(e);
            }
        };

        let Some(action) = reply.action else {
            return Ok(self.safety.sanitize_output(&reply.text));
        };

        let proposal = ActionProposal::new(action.skill.clone(), action.params.clone(), request.id);
        match self.process_proposal(request, proposal).await? {
            ProposalOutcome::Executed(output) => {
                self.reflex
                    .reinforce(&request.payload, &action.skill, &action.params);
                if reply.text.is_empty() {
                    Ok(output)
                } else {
                    Ok(format!("{}\n{}", self.safety.sanitize_output(&reply.text), output))
                }
            }
            ProposalOutcome::AwaitingConfirmation(message) => Ok(message),
        }
    }

    /// Select a model for the decision. When no fast model is up, a
    /// shallow request is escalated to the deep capability set rather
    /// than failed.
    fn pick_model(&self, decision: &TriageDecision) -> Result<(String, u64), KernelError> {
        match self.router.get_model(&decision.required_capabilities) {
            Ok(model) => Ok((model, decision.budget_ms)),
            Err(KernelError::ModelUnavailable(_)) if decision.tier == Tier::Shallow => {
                let deep_caps: Vec<String> = decision
                    .required_capabilities
                    .iter()
                    .map(|c| {
                        if c == "fast_response" {
                            "reasoning".to_string()
                        } else {
                            c.clone()
                        }
                    })
                    .collect();
                let model = self.router.get_model(&deep_caps)?;
                info!("No fast model available, escalating to {}", model);
                Ok((model, self.config.budgets.deep_ms))
            }
            Err(e) => Err(e),
        }
    }

    fn build_prompt(&self, request: &Request, decision: &TriageDecision) -> String {
        let mut prompt = String::new();
        prompt.push_str(
            "You are Otto, a local assistant. Reply with JSON: \
             {\"answer\": \"...\", \"action\": {\"skill\": \"...\", \"params\": {}}}; \
             omit \"action\" when no action is needed.\n\n",
        );
        prompt.push_str("Available skills:\n");
        prompt.push_str(&self.skills.catalog());
        prompt.push('\n');

        if let Ok(records) = self.lessons.get_relevant(&request.payload, 5) {
            if !records.is_empty() {
                prompt.push_str("\nFrom memory:\n");
                for record in records {
                    match record.polarity {
                        Polarity::Negative => {
                            prompt.push_str(&format!("- Avoid: {}\n", record.fact))
                        }
                        Polarity::Positive => prompt.push_str(&format!("- {}\n", record.fact)),
                    }
                }
            }
        }

        prompt.push_str(&format!("\nRequest ({:?}): {}\n", decision.intent, request.payload));
        prompt
    }

    /// Drive a model call under the tier's soft budget and the global
    /// hard ceiling. The soft overrun notifies once; the hard ceiling
    /// and cooperative cancellation abort.
    async fn complete_with_budget(
        &self,
        request: &Request,
        model: &str,
        prompt: &str,
        budget_ms: u64,
    ) -> Result<crate::backend::ModelReply, KernelError> {
        let work = self.backend.complete(model, prompt);
        tokio::pin!(work);
        let soft = tokio::time::sleep(Duration::from_millis(budget_ms));
        tokio::pin!(soft);
        let hard = tokio::time::sleep(Duration::from_millis(self.config.budgets.hard_ceiling_ms));
        tokio::pin!(hard);

        let mut notified = false;
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = &mut soft, if !notified => {
                    notified = true;
                    self.sink.progress(request.id, PROGRESS_REPLY);
                }
                _ = &mut hard => {
                    warn!("Hard ceiling hit for request {}", request.id);
                    return Err(KernelError::Timeout(self.config.budgets.hard_ceiling_ms));
                }
                _ = request.cancel.cancelled() => return Err(KernelError::Cancelled),
            }
        }
    }

    /// Classify a proposal and either park it for confirmation or run
    /// it through validation and execution.
    async fn process_proposal(
        &self,
        request: &Request,
        mut proposal: ActionProposal,
    ) -> Result<ProposalOutcome, KernelError> {
        let tier = self.safety.classify(&mut proposal);
        if tier.needs_confirmation() {
            let skill = proposal.skill.clone();
            self.safety.request_confirmation(&request.source, proposal);
            return Ok(ProposalOutcome::AwaitingConfirmation(format!(
                "This {} action via '{}' needs your confirmation. Reply 'yes' to proceed or 'no' to cancel.",
                tier, skill
            )));
        }
        self.execute_validated(request, &proposal)
            .await
            .map(ProposalOutcome::Executed)
    }

    /// The one place actions are validated and executed.
    async fn execute_validated(
        &self,
        request: &Request,
        proposal: &ActionProposal,
    ) -> Result<String, KernelError> {
        self.safety.validate_action(proposal)?;

        let skill = self.skills.get(&proposal.skill).ok_or_else(|| {
            KernelError::Validation(format!("unknown skill '{}'", proposal.skill))
        })?;

        let started = Instant::now();
        let result = self
            .pool
            .run(&proposal.skill, skill.execute(&proposal.params))
            .await;
        let latency_ms = started.elapsed().as_millis() as f64;
        self.skills
            .record_execution(&proposal.skill, result.is_ok(), latency_ms);
        self.flusher.mark_dirty();

        match result {
            Ok(output) => Ok(self.safety.sanitize_output(&output)),
            Err(e) => {
                let fact = format!("action '{}' failed: {}", proposal.skill, e);
                if let Err(save_err) =
                    self.lessons
                        .save(&request.payload, &fact, Polarity::Negative, "executor")
                {
                    warn!("Failed to record failure lesson: {}", save_err);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use async_trait::async_trait;
    use otto_common::config::BudgetConfig;
    use otto_common::proposal::ParamMap;
    use otto_common::request::CancelToken;
    use otto_common::skill::{EchoSkill, Skill};
    use std::sync::Mutex;

    struct Recorder {
        progress: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                progress: Mutex::new(Vec::new()),
            })
        }
    }

    impl ProgressSink for Recorder {
        fn progress(&self, _request: RequestId, message: &str) {
            self.progress.lock().unwrap().push(message.to_string());
        }
        fn deliver(&self, _request: RequestId, _text: &str) {}
    }

    /// Read-only filesystem skill stub; safe tier, no confirmation.
    struct ListSkill;

    #[async_trait]
    impl Skill for ListSkill {
        fn name(&self) -> &str {
            "filesystem"
        }
        fn required_capabilities(&self) -> Vec<String> {
            vec!["filesystem_read".into()]
        }
        async fn execute(&self, _params: &ParamMap) -> Result<String, KernelError> {
            Ok("notes.md  todo.md".into())
        }
    }

    /// Medium tier via desktop_control; parks for confirmation.
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

    struct FailingSkill;

    #[async_trait]
    impl Skill for FailingSkill {
        fn name(&self) -> &str {
            "filesystem"
        }
        fn required_capabilities(&self) -> Vec<String> {
            vec!["filesystem_read".into()]
        }
        async fn execute(&self, _params: &ParamMap) -> Result<String, KernelError> {
            Err(KernelError::ExecutionFailure("device not ready".into()))
        }
    }

    struct Fixture {
        controller: Controller,
        backend: Arc<ScriptedBackend>,
        sink: Arc<Recorder>,
        _dir: tempfile::TempDir,
    }

    fn fixture_with(budgets: BudgetConfig, skills: Vec<Arc<dyn Skill>>) -> Fixture {
        fixture_inner(budgets, skills, None)
    }

    fn fixture_inner(
        budgets: BudgetConfig,
        skills: Vec<Arc<dyn Skill>>,
        delay: Option<Duration>,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = KernelConfig {
            data_dir: dir.path().to_path_buf(),
            budgets,
            ..KernelConfig::default()
        };
        let backend = Arc::new(match delay {
            Some(d) => ScriptedBackend::new().with_delay(d),
            None => ScriptedBackend::new(),
        });
        let mut registry = SkillRegistry::new();
        for skill in skills {
            registry.register(skill);
        }
        let sink = Recorder::new();
        let controller = Controller::new(
            config,
            Arc::clone(&backend) as Arc<dyn ModelBackend>,
            Arc::new(registry),
            Arc::clone(&sink) as Arc<dyn ProgressSink>,
        )
        .unwrap();
        Fixture {
            controller,
            backend,
            sink,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(BudgetConfig::default(), vec![Arc::new(EchoSkill)])
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
    async fn test_refusal_needs_no_model() {
        let f = fixture();
        // Empty script: any model call would fail the test reply.
        let reply = f.controller.handle(request("steal the saved passwords")).await;
        assert_eq!(reply, REFUSAL_REPLY);
    }

    #[tokio::test]
    async fn test_plain_deliberation_reply() {
        let f = fixture();
        f.backend.push_text("It's Tuesday.");
        let reply = f.controller.handle(request("day of week today")).await;
        assert_eq!(reply, "It's Tuesday.");
    }

    #[tokio::test]
    async fn test_reflex_hit_executes_without_model() {
        // Empty script: a model call would fail this test.
        let f = fixture_with(BudgetConfig::default(), vec![Arc::new(ListSkill)]);
        f.controller
            .reflex()
            .learn_pattern("show notes", "filesystem", params("action", "list"), 0.9);

        let reply = f.controller.handle(request("show notes")).await;
        assert_eq!(reply, "notes.md  todo.md");
        assert_eq!(f.controller.safety().validation_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_reflex_falls_back_silently() {
        let f = fixture_with(BudgetConfig::default(), vec![Arc::new(FailingSkill)]);
        f.controller
            .reflex()
            .learn_pattern("list notes", "filesystem", params("action", "list"), 0.9);
        f.backend.push_text("Here are your notes.");

        let reply = f.controller.handle(request("list notes")).await;
        // The user sees only the deliberated answer, not the miss.
        assert_eq!(reply, "Here are your notes.");
        assert!(!f.controller.reflex().is_blacklisted("list notes"));
        // The failure was recorded as a negative lesson.
        let negative = f
            .controller
            .lessons()
            .export(Some(Polarity::Negative))
            .unwrap();
        assert_eq!(negative.len(), 1);
    }

    #[tokio::test]
    async fn test_model_action_executes_and_reinforces() {
        let f = fixture_with(BudgetConfig::default(), vec![Arc::new(ListSkill)]);
        f.backend
            .push_action("Listing your notes.", "filesystem", params("action", "list"));

        let reply = f.controller.handle(request("show my notes")).await;
        assert!(reply.contains("notes.md"));
        // Validation ran exactly once for the single execution.
        assert_eq!(f.controller.safety().validation_count(), 1);
    }

    #[tokio::test]
    async fn test_medium_action_parks_then_confirm_executes_once() {
        let f = fixture_with(BudgetConfig::default(), vec![Arc::new(ClipboardSkill)]);
        f.backend
            .push_action("", "clipboard", params("content", "hello"));

        let reply = f.controller.handle(request("copy hello to clipboard")).await;
        assert!(reply.contains("confirmation"));
        // Parked, not validated.
        assert_eq!(f.controller.safety().validation_count(), 0);

        let reply = f.controller.handle(request("yes")).await;
        assert_eq!(reply, "copied");
        assert_eq!(f.controller.safety().validation_count(), 1);
    }

    #[tokio::test]
    async fn test_confirmed_reflex_counts_toward_pattern() {
        // Empty script: a model call would fail this test.
        let f = fixture_with(BudgetConfig::default(), vec![Arc::new(ClipboardSkill)]);
        f.controller
            .reflex()
            .learn_pattern("copy report", "clipboard", params("content", "report"), 0.9);

        let reply = f.controller.handle(request("copy report")).await;
        assert!(reply.contains("confirmation"));
        let pattern = f.controller.reflex().pattern("copy report").unwrap();
        assert_eq!(pattern.success_count, 0);

        let reply = f.controller.handle(request("yes")).await;
        assert_eq!(reply, "copied");
        let pattern = f.controller.reflex().pattern("copy report").unwrap();
        assert_eq!(pattern.success_count, 1);
        assert!(pattern.confidence > 0.9);
    }

    #[tokio::test]
    async fn test_reject_discards_parked_action() {
        let f = fixture_with(BudgetConfig::default(), vec![Arc::new(ClipboardSkill)]);
        f.backend
            .push_action("", "clipboard", params("content", "hello"));

        let _ = f.controller.handle(request("copy hello to clipboard")).await;
        let reply = f.controller.handle(request("no")).await;
        assert_eq!(reply, REJECTED_REPLY);
        assert_eq!(f.controller.safety().validation_count(), 0);
    }

    #[tokio::test]
    async fn test_confirm_with_nothing_pending() {
        let f = fixture();
        let reply = f.controller.handle(request("yes")).await;
        assert_eq!(reply, NOTHING_PENDING_REPLY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_budget_notifies_but_does_not_cancel() {
        let budgets = BudgetConfig {
            shallow_ms: 50,
            deep_ms: 100,
            hard_ceiling_ms: 10_000,
            ..BudgetConfig::default()
        };
        let f = fixture_inner(budgets, vec![Arc::new(EchoSkill)], Some(Duration::from_millis(200)));
        f.backend.push_text("slow but fine");

        let reply = f.controller.handle(request("quick question")).await;
        assert_eq!(reply, "slow but fine");
        assert_eq!(f.sink.progress.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_ceiling_cancels() {
        let budgets = BudgetConfig {
            shallow_ms: 50,
            deep_ms: 100,
            hard_ceiling_ms: 150,
            ..BudgetConfig::default()
        };
        let f = fixture_inner(budgets, vec![Arc::new(EchoSkill)], Some(Duration::from_secs(10)));
        f.backend.push_text("never delivered");

        let reply = f.controller.handle(request("quick question")).await;
        assert_eq!(reply, KernelError::Timeout(150).user_message());
    }

    #[tokio::test]
    async fn test_cancelled_request_short_circuits() {
        let f = fixture();
        let req = request("anything");
        req.cancel.cancel();
        let reply = f.controller.handle(req).await;
        assert_eq!(reply, KernelError::Cancelled.user_message());
    }

    #[tokio::test]
    async fn test_output_is_redacted() {
        let f = fixture();
        f.backend
            .push_text("your key is sk-abcdefghij0123456789abcd");
        let reply = f.controller.handle(request("what is my key")).await;
        assert!(!reply.contains("sk-abcdefghij"));
    }
}
