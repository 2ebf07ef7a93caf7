//! Arbiter Pipeline - the state machine that drives one thought from
//! context assembly to an audited, dispatched action.
//!
//! Stage order is `BuildContext → Evaluate → SelectAction → PolicyCheck →
//! {Commit | retry → SelectAction | Fallback} → Dispatch → Done`. The retry
//! edge is an explicit loop with a depth counter, taken only for non-fatal
//! rejections below the configured cap; exceeding the cap forces the
//! fallback action, which guarantees termination. The audit commit always
//! precedes dispatch: no action leaves the pipeline unaudited.
//!
//! Cancellation is honored at stage boundaries only, never mid-call, so the
//! ledger never records a partially-applied decision.

#![deny(unsafe_code)]

use arbiter_context::{ContextBuilder, ContextError};
use arbiter_evaluation::{
    EvaluatorFanOut, EvaluatorRegistry, FanOutError, SelectionError, SelectionStrategy,
};
use arbiter_gate::{CheckRegistry, PolicyGate};
use arbiter_ledger::{AuditLedger, LedgerError};
use arbiter_store::{ArbiterStore, StoreError};
use arbiter_types::{
    ActionKind, ArbiterConfig, AuditEntry, AuditPayload, CandidateAction, DispatchResult,
    PipelineStage, StepEvent, Task, TaskId, TaskStatus, Thought, ThoughtKind, ThoughtStatus,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// Result type for pipeline runs.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Structural pipeline failures. Every variant leaves the thought in an
/// errored terminal state; the task becomes claimable again once its lease
/// expires, so another occurrence can retry from scratch.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("context assembly failed: {0}")]
    Context(#[from] ContextError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("audit failure: {0}")]
    Audit(#[from] LedgerError),

    #[error("selection failure: {0}")]
    Selection(#[from] SelectionError),

    #[error("no evaluators registered")]
    NoEvaluators,
}

// ── Dispatch boundary ────────────────────────────────────────────────

/// Boundary contract for executing a finalized action. Implementations are
/// external collaborators; the pipeline reports their failures on the
/// thought's terminal record and never retries them.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, action: &CandidateAction, thought: &Thought) -> DispatchResult;
}

/// Lease renewal hook, called at stage boundaries by the worker that owns
/// the thought. Returning false means the lease was lost.
#[async_trait]
pub trait LeaseKeeper: Send + Sync {
    async fn renew(&self, task_id: &TaskId) -> bool;
}

/// No-op keeper for single-occurrence and test setups.
pub struct NoopLeaseKeeper;

#[async_trait]
impl LeaseKeeper for NoopLeaseKeeper {
    async fn renew(&self, _task_id: &TaskId) -> bool {
        true
    }
}

// ── Outcomes ─────────────────────────────────────────────────────────

/// What the runtime should do with the task after this thought.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineDisposition {
    /// A terminal action was committed; close the task accordingly.
    Terminal(ActionKind),
    /// A non-terminal action was dispatched; the task is eligible for one
    /// follow-up thought.
    FollowUp(ActionKind),
    /// Evaluation quorum was not met; requeue the task without consuming
    /// any retry budget.
    Requeue,
    /// Shutdown arrived at a stage boundary; the task was deferred.
    Cancelled,
}

/// Terminal record of one pipeline pass.
#[derive(Clone, Debug)]
pub struct PipelineOutcome {
    pub thought: Thought,
    pub committed: Option<AuditEntry>,
    pub dispatch: Option<DispatchResult>,
    pub disposition: PipelineDisposition,
}

// ── Orchestrator ─────────────────────────────────────────────────────

/// Drives thoughts through the staged pipeline. Owns the registries and
/// collaborators; coordinates, never reasons.
pub struct PipelineOrchestrator {
    config: ArbiterConfig,
    store: Arc<dyn ArbiterStore>,
    ledger: Arc<AuditLedger>,
    context_builder: Arc<ContextBuilder>,
    evaluators: EvaluatorRegistry,
    selector: Arc<dyn SelectionStrategy>,
    checks: CheckRegistry,
    dispatcher: Arc<dyn ActionDispatcher>,
    lease: Arc<dyn LeaseKeeper>,
    events: broadcast::Sender<StepEvent>,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ArbiterConfig,
        store: Arc<dyn ArbiterStore>,
        ledger: Arc<AuditLedger>,
        context_builder: Arc<ContextBuilder>,
        evaluators: EvaluatorRegistry,
        selector: Arc<dyn SelectionStrategy>,
        checks: CheckRegistry,
        dispatcher: Arc<dyn ActionDispatcher>,
        lease: Arc<dyn LeaseKeeper>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            store,
            ledger,
            context_builder,
            evaluators,
            selector,
            checks,
            dispatcher,
            lease,
            events,
        }
    }

    /// Subscribe to the step event stream. One event per stage transition;
    /// the schema is a stable boundary contract.
    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.events.subscribe()
    }

    fn emit(&self, stage: PipelineStage, thought: &Thought, payload: serde_json::Value) {
        tracing::debug!(
            stage = %stage,
            thought_id = %thought.id,
            task_id = %thought.task_id,
            "stage transition"
        );
        let _ = self.events.send(StepEvent::new(
            stage,
            thought.id.clone(),
            thought.task_id.clone(),
            payload,
        ));
    }

    async fn advance(
        &self,
        thought: &mut Thought,
        stage: PipelineStage,
        payload: serde_json::Value,
    ) -> PipelineResult<()> {
        thought.stage = stage;
        self.store.update_thought(thought.clone()).await?;
        self.emit(stage, thought, payload);
        Ok(())
    }

    /// Best-effort terminal bookkeeping for structural failures: the error
    /// that got us here matters more than a second store error.
    async fn mark_errored(&self, thought: &mut Thought, error: &str) {
        thought.stage = PipelineStage::Errored;
        thought.status = ThoughtStatus::Errored;
        if let Err(e) = self.store.update_thought(thought.clone()).await {
            tracing::warn!(thought_id = %thought.id, error = %e, "could not persist errored thought");
        }
        self.emit(
            PipelineStage::Errored,
            thought,
            serde_json::json!({ "error": error }),
        );
    }

    fn fallback_candidate(&self, depth: u32, reason: &str) -> CandidateAction {
        CandidateAction {
            action: self.config.fallback_action,
            params: serde_json::Value::Null,
            rationale: format!("fallback: {reason}"),
            attempt: depth,
            evaluation_refs: vec![],
        }
    }

    fn cancelled(cancel: &watch::Receiver<bool>) -> bool {
        *cancel.borrow()
    }

    /// Run one full pipeline pass for a claimed task.
    ///
    /// The caller owns the claim; this method renews the lease at stage
    /// boundaries through the injected [`LeaseKeeper`].
    pub async fn run_task(
        &self,
        mut task: Task,
        kind: ThoughtKind,
        cancel: &watch::Receiver<bool>,
    ) -> PipelineResult<PipelineOutcome> {
        if self.evaluators.is_empty() {
            return Err(PipelineError::NoEvaluators);
        }

        let mut thought = Thought::new(task.id.clone(), kind);
        thought.status = ThoughtStatus::Processing;
        self.store.put_thought(thought.clone()).await?;

        task.status = TaskStatus::Active;
        self.store.update_task(task.clone()).await?;

        // BUILD_CONTEXT
        self.emit(
            PipelineStage::BuildContext,
            &thought,
            serde_json::json!({ "kind": kind }),
        );
        let mut context = match self.context_builder.build(&task, &thought).await {
            Ok(context) => context,
            Err(e) => {
                self.mark_errored(&mut thought, &e.to_string()).await;
                return Err(e.into());
            }
        };

        if Self::cancelled(cancel) {
            return self.cancel_terminally(&mut thought, "before evaluate").await;
        }
        self.lease_checkpoint(&task).await;

        // EVALUATE
        self.advance(
            &mut thought,
            PipelineStage::Evaluate,
            serde_json::json!({ "evaluators": self.evaluators.len(), "degraded_context": context.degraded }),
        )
        .await?;

        let fanout = EvaluatorFanOut::new(self.config.evaluator_timeout(), self.config.quorum);
        let results = match fanout.evaluate(&context, &self.evaluators).await {
            Ok(results) => results,
            Err(FanOutError::NoEvaluators) => return Err(PipelineError::NoEvaluators),
            Err(FanOutError::QuorumNotMet { succeeded, required }) => {
                tracing::info!(
                    thought_id = %thought.id,
                    succeeded,
                    required,
                    "evaluation quorum not met; requeueing task"
                );
                thought.status = ThoughtStatus::Errored;
                thought.stage = PipelineStage::Errored;
                self.store.update_thought(thought.clone()).await?;
                self.emit(
                    PipelineStage::Errored,
                    &thought,
                    serde_json::json!({ "error": "quorum_not_met", "succeeded": succeeded }),
                );
                return Ok(PipelineOutcome {
                    thought,
                    committed: None,
                    dispatch: None,
                    disposition: PipelineDisposition::Requeue,
                });
            }
        };

        // SELECT_ACTION ⇄ POLICY_CHECK, bounded by max_depth.
        let gate = PolicyGate::new(self.config.evaluator_timeout());
        let (candidate, verdict_summary, fallback) = loop {
            if Self::cancelled(cancel) {
                return self.cancel_terminally(&mut thought, "before select_action").await;
            }
            self.lease_checkpoint(&task).await;

            let attempt = thought.depth;
            self.advance(
                &mut thought,
                PipelineStage::SelectAction,
                serde_json::json!({ "attempt": attempt }),
            )
            .await?;

            let candidate = match self.selector.select(&results, &context, thought.depth).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    self.mark_errored(&mut thought, &e.to_string()).await;
                    return Err(e.into());
                }
            };

            self.advance(
                &mut thought,
                PipelineStage::PolicyCheck,
                serde_json::json!({ "action": candidate.action, "attempt": candidate.attempt }),
            )
            .await?;

            let verdict = gate.run(&candidate, &context, &self.checks).await;
            if verdict.passed {
                break (candidate, "all checks passed".to_string(), false);
            }

            let reason = verdict
                .rejection_reason
                .clone()
                .unwrap_or_else(|| "rejected".to_string());

            if verdict.fatal_failure {
                self.advance(
                    &mut thought,
                    PipelineStage::Fallback,
                    serde_json::json!({ "reason": reason, "fatal": true }),
                )
                .await?;
                break (
                    self.fallback_candidate(thought.depth, &reason),
                    format!("fatal rejection: {reason}"),
                    true,
                );
            }

            if thought.depth < self.config.max_depth {
                thought.depth += 1;
                context.merge_rejection(reason);
                continue;
            }

            // Depth exhausted: the loop terminates here by construction.
            let depth = thought.depth;
            self.advance(
                &mut thought,
                PipelineStage::Fallback,
                serde_json::json!({ "reason": reason, "fatal": false, "depth": depth }),
            )
            .await?;
            break (
                self.fallback_candidate(thought.depth, &reason),
                format!("retry budget exhausted: {reason}"),
                true,
            );
        };

        if Self::cancelled(cancel) {
            return self.cancel_terminally(&mut thought, "before commit").await;
        }
        self.lease_checkpoint(&task).await;

        // COMMIT — no action without audit.
        let payload = AuditPayload {
            thought_id: thought.id.clone(),
            task_id: task.id.clone(),
            action: candidate.action,
            params: candidate.params.clone(),
            verdict_summary,
            depth: thought.depth,
            fallback,
        };
        let entry = match self.ledger.commit(payload).await {
            Ok(entry) => entry,
            Err(e) => {
                self.mark_errored(&mut thought, &e.to_string()).await;
                return Err(e.into());
            }
        };
        self.advance(
            &mut thought,
            PipelineStage::Commit,
            serde_json::json!({ "sequence": entry.sequence, "fallback": fallback }),
        )
        .await?;

        // DISPATCH — failures are reported, never retried here.
        self.advance(
            &mut thought,
            PipelineStage::Dispatch,
            serde_json::json!({ "action": candidate.action }),
        )
        .await?;
        let dispatch = self.dispatcher.dispatch(&candidate, &thought).await;
        if !dispatch.success {
            tracing::warn!(
                thought_id = %thought.id,
                detail = %dispatch.detail,
                "dispatch failed; recorded on the thought"
            );
            thought.dispatch_error = Some(dispatch.detail.clone());
        }

        // DONE
        thought.final_action = Some(candidate.action);
        thought.status = if candidate.action == ActionKind::Defer {
            ThoughtStatus::Deferred
        } else {
            ThoughtStatus::Completed
        };
        self.advance(
            &mut thought,
            PipelineStage::Done,
            serde_json::json!({ "final_action": candidate.action, "dispatched": dispatch.success }),
        )
        .await?;

        let disposition = if candidate.action.is_terminal_for_task() {
            PipelineDisposition::Terminal(candidate.action)
        } else {
            PipelineDisposition::FollowUp(candidate.action)
        };

        Ok(PipelineOutcome {
            thought,
            committed: Some(entry),
            dispatch: Some(dispatch),
            disposition,
        })
    }

    async fn lease_checkpoint(&self, task: &Task) {
        if !self.lease.renew(&task.id).await {
            tracing::warn!(task_id = %task.id, "lease renewal lost at stage boundary");
        }
    }

    /// Shutdown observed at a stage boundary: finish bookkeeping, write a
    /// terminal deferred audit entry, skip remaining stages.
    async fn cancel_terminally(
        &self,
        thought: &mut Thought,
        boundary: &str,
    ) -> PipelineResult<PipelineOutcome> {
        let payload = AuditPayload {
            thought_id: thought.id.clone(),
            task_id: thought.task_id.clone(),
            action: self.config.fallback_action,
            params: serde_json::Value::Null,
            verdict_summary: format!("cancelled {boundary}"),
            depth: thought.depth,
            fallback: true,
        };
        let entry = match self.ledger.commit(payload).await {
            Ok(entry) => entry,
            Err(e) => {
                self.mark_errored(thought, &e.to_string()).await;
                return Err(e.into());
            }
        };

        thought.final_action = Some(self.config.fallback_action);
        thought.status = ThoughtStatus::Deferred;
        thought.stage = PipelineStage::Done;
        self.store.update_thought(thought.clone()).await?;
        self.emit(
            PipelineStage::Done,
            thought,
            serde_json::json!({ "cancelled": true, "sequence": entry.sequence }),
        );

        Ok(PipelineOutcome {
            thought: thought.clone(),
            committed: Some(entry),
            dispatch: None,
            disposition: PipelineDisposition::Cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_context::{
        Context, IdentitySnapshot, IdentitySource, MemoryExcerpt, MemorySource, SourceError,
        StateSource,
    };
    use arbiter_evaluation::{
        Evaluator, EvaluatorError, EvaluatorVerdict, HighestConfidenceSelector,
    };
    use arbiter_gate::{CheckError, CheckFinding, PolicyCheck};
    use arbiter_ledger::LedgerSigner;
    use arbiter_store::memory::InMemoryStore;
    use arbiter_store::TaskStore;
    use arbiter_types::Priority;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StubState;
    #[async_trait]
    impl StateSource for StubState {
        async fn snapshot(&self, _task: &Task) -> Result<serde_json::Value, SourceError> {
            Ok(serde_json::json!({"channel": "test"}))
        }
    }

    struct StubIdentity;
    #[async_trait]
    impl IdentitySource for StubIdentity {
        async fn identity(&self, _task: &Task) -> Result<IdentitySnapshot, SourceError> {
            Ok(IdentitySnapshot {
                profile: serde_json::json!({"name": "steward"}),
                permitted_actions: vec![
                    ActionKind::Speak,
                    ActionKind::Defer,
                    ActionKind::TaskComplete,
                ],
            })
        }
    }

    struct StubMemory;
    #[async_trait]
    impl MemorySource for StubMemory {
        async fn recall(
            &self,
            _task: &Task,
            _limit: usize,
        ) -> Result<Vec<MemoryExcerpt>, SourceError> {
            Ok(vec![])
        }
    }

    struct ProposeAction {
        name: &'static str,
        action: ActionKind,
    }

    #[async_trait]
    impl Evaluator for ProposeAction {
        fn name(&self) -> &str {
            self.name
        }

        async fn evaluate(&self, _context: &Context) -> Result<EvaluatorVerdict, EvaluatorError> {
            Ok(EvaluatorVerdict {
                proposed_action: Some(self.action),
                payload: serde_json::json!({"content": "proposed"}),
                confidence: 0.9,
                flags: vec![],
            })
        }
    }

    struct HangingEvaluator(&'static str);

    #[async_trait]
    impl Evaluator for HangingEvaluator {
        fn name(&self) -> &str {
            self.0
        }

        async fn evaluate(&self, _context: &Context) -> Result<EvaluatorVerdict, EvaluatorError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    struct FailingEvaluator(&'static str);

    #[async_trait]
    impl Evaluator for FailingEvaluator {
        fn name(&self) -> &str {
            self.0
        }

        async fn evaluate(&self, _context: &Context) -> Result<EvaluatorVerdict, EvaluatorError> {
            Err(EvaluatorError::Failed("model offline".to_string()))
        }
    }

    struct AlwaysPass(&'static str);

    #[async_trait]
    impl PolicyCheck for AlwaysPass {
        fn name(&self) -> &str {
            self.0
        }

        async fn check(
            &self,
            _candidate: &CandidateAction,
            _context: &Context,
        ) -> Result<CheckFinding, CheckError> {
            Ok(CheckFinding::pass())
        }
    }

    struct AlwaysReject {
        name: &'static str,
        fatal: bool,
        invocations: AtomicU32,
    }

    impl AlwaysReject {
        fn new(name: &'static str, fatal: bool) -> Self {
            Self {
                name,
                fatal,
                invocations: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PolicyCheck for AlwaysReject {
        fn name(&self) -> &str {
            self.name
        }

        fn fatal(&self) -> bool {
            self.fatal
        }

        async fn check(
            &self,
            _candidate: &CandidateAction,
            _context: &Context,
        ) -> Result<CheckFinding, CheckError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(CheckFinding::fail("candidate violates policy"))
        }
    }

    struct RecordingDispatcher {
        calls: AtomicU32,
        succeed: bool,
    }

    #[async_trait]
    impl ActionDispatcher for RecordingDispatcher {
        async fn dispatch(&self, _action: &CandidateAction, _thought: &Thought) -> DispatchResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            DispatchResult {
                success: self.succeed,
                detail: if self.succeed {
                    "delivered".to_string()
                } else {
                    "handler unavailable".to_string()
                },
            }
        }
    }

    struct Fixture {
        orchestrator: PipelineOrchestrator,
        store: Arc<InMemoryStore>,
        ledger: Arc<AuditLedger>,
        dispatcher: Arc<RecordingDispatcher>,
        /// Never-signalled cancellation channel; the sender lives as long
        /// as the fixture so the receiver stays connected.
        cancel: watch::Receiver<bool>,
        _cancel_tx: watch::Sender<bool>,
    }

    fn fixture(
        config: ArbiterConfig,
        evaluators: Vec<Arc<dyn Evaluator>>,
        checks: Vec<Arc<dyn PolicyCheck>>,
        dispatch_succeeds: bool,
    ) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(AuditLedger::new(store.clone(), LedgerSigner::generate()));
        let context_builder = Arc::new(ContextBuilder::new(
            Arc::new(StubState),
            Arc::new(StubIdentity),
            Arc::new(StubMemory),
            Duration::from_secs(5),
        ));

        let mut evaluator_registry = EvaluatorRegistry::new();
        for evaluator in evaluators {
            evaluator_registry.register(evaluator).unwrap();
        }
        let mut check_registry = CheckRegistry::new();
        for check in checks {
            check_registry.register(check).unwrap();
        }

        let dispatcher = Arc::new(RecordingDispatcher {
            calls: AtomicU32::new(0),
            succeed: dispatch_succeeds,
        });

        let orchestrator = PipelineOrchestrator::new(
            config,
            store.clone(),
            ledger.clone(),
            context_builder,
            evaluator_registry,
            Arc::new(HighestConfidenceSelector),
            check_registry,
            dispatcher.clone(),
            Arc::new(NoopLeaseKeeper),
        );

        let (cancel_tx, cancel) = watch::channel(false);
        Fixture {
            orchestrator,
            store,
            ledger,
            dispatcher,
            cancel,
            _cancel_tx: cancel_tx,
        }
    }

    fn queued_task() -> Task {
        Task::new("respond to the operator", Priority::normal())
    }

    #[tokio::test]
    async fn clean_pass_commits_then_dispatches() {
        let f = fixture(
            ArbiterConfig::default(),
            vec![Arc::new(ProposeAction {
                name: "domain",
                action: ActionKind::Speak,
            })],
            vec![Arc::new(AlwaysPass("coherence"))],
            true,
        );
        let task = queued_task();
        f.store.put_task(task.clone()).await.unwrap();

        let outcome = f
            .orchestrator
            .run_task(task, ThoughtKind::Standard, &f.cancel)
            .await
            .unwrap();

        assert_eq!(
            outcome.disposition,
            PipelineDisposition::FollowUp(ActionKind::Speak)
        );
        assert_eq!(outcome.thought.status, ThoughtStatus::Completed);
        assert_eq!(outcome.thought.final_action, Some(ActionKind::Speak));
        assert_eq!(outcome.thought.depth, 0);
        assert_eq!(f.dispatcher.calls.load(Ordering::SeqCst), 1);

        let entry = outcome.committed.unwrap();
        assert_eq!(entry.sequence, 1);
        assert!(!entry.payload.fallback);
        assert!(f.ledger.verify(1, 1).await.unwrap().valid);
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_of_one_proceeds_with_single_result() {
        let mut config = ArbiterConfig::default();
        config.quorum = 1;
        config.evaluator_timeout_secs = 1;

        let f = fixture(
            config,
            vec![
                Arc::new(HangingEvaluator("slow_a")),
                Arc::new(ProposeAction {
                    name: "quick",
                    action: ActionKind::Speak,
                }),
                Arc::new(HangingEvaluator("slow_b")),
            ],
            vec![Arc::new(AlwaysPass("coherence"))],
            true,
        );
        let task = queued_task();
        f.store.put_task(task.clone()).await.unwrap();

        let outcome = f
            .orchestrator
            .run_task(task, ThoughtKind::Standard, &f.cancel)
            .await
            .unwrap();

        assert_eq!(
            outcome.disposition,
            PipelineDisposition::FollowUp(ActionKind::Speak)
        );
        // The candidate references only the single surviving evaluation.
        let entry = outcome.committed.unwrap();
        assert_eq!(entry.payload.action, ActionKind::Speak);
    }

    #[tokio::test]
    async fn quorum_failure_requeues_without_commit() {
        let f = fixture(
            ArbiterConfig::default(),
            vec![
                Arc::new(FailingEvaluator("broken_a")),
                Arc::new(FailingEvaluator("broken_b")),
            ],
            vec![],
            true,
        );
        let task = queued_task();
        f.store.put_task(task.clone()).await.unwrap();

        let outcome = f
            .orchestrator
            .run_task(task, ThoughtKind::Standard, &f.cancel)
            .await
            .unwrap();

        assert_eq!(outcome.disposition, PipelineDisposition::Requeue);
        assert_eq!(outcome.thought.status, ThoughtStatus::Errored);
        assert!(outcome.committed.is_none());
        // No retry budget consumed, no audit entry written.
        assert_eq!(outcome.thought.depth, 0);
        assert_eq!(f.ledger.latest_sequence().await.unwrap(), 0);
        assert_eq!(f.dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_check_skips_retry_and_falls_back_immediately() {
        let fatal_check = Arc::new(AlwaysReject::new("identity_guard", true));
        let f = fixture(
            ArbiterConfig::default(),
            vec![Arc::new(ProposeAction {
                name: "domain",
                action: ActionKind::Speak,
            })],
            vec![fatal_check.clone(), Arc::new(AlwaysPass("entropy"))],
            true,
        );
        let task = queued_task();
        f.store.put_task(task.clone()).await.unwrap();

        let outcome = f
            .orchestrator
            .run_task(task, ThoughtKind::Standard, &f.cancel)
            .await
            .unwrap();

        assert_eq!(
            outcome.disposition,
            PipelineDisposition::Terminal(ActionKind::Defer)
        );
        // Exactly one gate pass: no retries attempted.
        assert_eq!(fatal_check.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.thought.depth, 0);

        let entry = outcome.committed.unwrap();
        assert!(entry.payload.fallback);
        assert!(entry.payload.verdict_summary.contains("fatal"));
        assert!(entry.payload.verdict_summary.contains("identity_guard"));
    }

    #[tokio::test]
    async fn non_fatal_rejections_retry_to_the_cap_then_fall_back() {
        let mut config = ArbiterConfig::default();
        config.max_depth = 2;

        let rejecting = Arc::new(AlwaysReject::new("coherence", false));
        let f = fixture(
            config,
            vec![Arc::new(ProposeAction {
                name: "domain",
                action: ActionKind::Speak,
            })],
            vec![rejecting.clone()],
            true,
        );
        let task = queued_task();
        f.store.put_task(task.clone()).await.unwrap();

        let outcome = f
            .orchestrator
            .run_task(task, ThoughtKind::Standard, &f.cancel)
            .await
            .unwrap();

        // Attempts at depth 0, 1, 2: exactly two retries, then fallback.
        assert_eq!(rejecting.invocations.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.thought.depth, 2);

        let entry = outcome.committed.unwrap();
        assert_eq!(entry.payload.depth, 2);
        assert!(entry.payload.fallback);
        assert_eq!(entry.payload.action, ActionKind::Defer);
        assert!(entry.payload.verdict_summary.contains("retry budget exhausted"));
    }

    #[tokio::test]
    async fn dispatch_failure_is_reported_not_retried() {
        let f = fixture(
            ArbiterConfig::default(),
            vec![Arc::new(ProposeAction {
                name: "domain",
                action: ActionKind::TaskComplete,
            })],
            vec![Arc::new(AlwaysPass("coherence"))],
            false,
        );
        let task = queued_task();
        f.store.put_task(task.clone()).await.unwrap();

        let outcome = f
            .orchestrator
            .run_task(task, ThoughtKind::Standard, &f.cancel)
            .await
            .unwrap();

        assert_eq!(f.dispatcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcome.thought.dispatch_error.as_deref(),
            Some("handler unavailable")
        );
        // The audit chain recorded the decision before dispatch ran.
        assert!(outcome.committed.is_some());
        assert_eq!(
            outcome.disposition,
            PipelineDisposition::Terminal(ActionKind::TaskComplete)
        );
    }

    #[tokio::test]
    async fn cancellation_defers_at_a_stage_boundary_with_audit() {
        let f = fixture(
            ArbiterConfig::default(),
            vec![Arc::new(ProposeAction {
                name: "domain",
                action: ActionKind::Speak,
            })],
            vec![],
            true,
        );
        let task = queued_task();
        f.store.put_task(task.clone()).await.unwrap();

        let (tx, rx) = watch::channel(true);
        let outcome = f
            .orchestrator
            .run_task(task, ThoughtKind::Standard, &rx)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(outcome.disposition, PipelineDisposition::Cancelled);
        assert_eq!(outcome.thought.status, ThoughtStatus::Deferred);
        // The terminal decision still made it into the chain.
        let entry = outcome.committed.unwrap();
        assert!(entry.payload.fallback);
        assert!(entry.payload.verdict_summary.contains("cancelled"));
        assert_eq!(f.dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn step_events_cover_every_stage_transition() {
        let f = fixture(
            ArbiterConfig::default(),
            vec![Arc::new(ProposeAction {
                name: "domain",
                action: ActionKind::Speak,
            })],
            vec![Arc::new(AlwaysPass("coherence"))],
            true,
        );
        let mut events = f.orchestrator.subscribe();
        let task = queued_task();
        f.store.put_task(task.clone()).await.unwrap();

        f.orchestrator
            .run_task(task, ThoughtKind::Standard, &f.cancel)
            .await
            .unwrap();

        let mut stages = Vec::new();
        while let Ok(event) = events.try_recv() {
            stages.push(event.stage);
        }
        assert_eq!(
            stages,
            vec![
                PipelineStage::BuildContext,
                PipelineStage::Evaluate,
                PipelineStage::SelectAction,
                PipelineStage::PolicyCheck,
                PipelineStage::Commit,
                PipelineStage::Dispatch,
                PipelineStage::Done,
            ]
        );
    }
}
