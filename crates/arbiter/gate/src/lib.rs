//! Arbiter Gate - runs validation checks against a candidate action before
//! it may be committed.
//!
//! Checks run concurrently with the same fan-out discipline as evaluation:
//! one shared deadline, per-check outcomes joined in registration order.
//! The aggregate verdict passes only if every check passed. A check marked
//! fatal skips the retry budget entirely: the pipeline goes straight to the
//! fallback action.

#![deny(unsafe_code)]

use arbiter_context::Context;
use arbiter_types::{CandidateAction, CheckOutcome, PolicyVerdict};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error surface for check implementations. An erroring check counts as a
/// failed check; it never aborts the gate run.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("check execution failed: {0}")]
    Failed(String),
}

/// What a single check concluded, without identity; the gate attaches the
/// check's name and fatality.
#[derive(Clone, Debug)]
pub struct CheckFinding {
    pub passed: bool,
    pub reason: Option<String>,
}

impl CheckFinding {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// A pluggable policy check.
#[async_trait]
pub trait PolicyCheck: Send + Sync {
    /// Stable name recorded on every outcome.
    fn name(&self) -> &str;

    /// Fatal checks force the terminal fallback on failure, with no retry.
    fn fatal(&self) -> bool {
        false
    }

    async fn check(
        &self,
        candidate: &CandidateAction,
        context: &Context,
    ) -> Result<CheckFinding, CheckError>;
}

#[derive(Debug, Error)]
pub enum GateRegistryError {
    #[error("check '{0}' is already registered")]
    DuplicateName(String),
}

/// Ordered, name-unique collection of policy checks. Explicitly
/// constructed, no global registration.
#[derive(Clone, Default)]
pub struct CheckRegistry {
    entries: Vec<Arc<dyn PolicyCheck>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, check: Arc<dyn PolicyCheck>) -> Result<(), GateRegistryError> {
        if self.entries.iter().any(|c| c.name() == check.name()) {
            return Err(GateRegistryError::DuplicateName(check.name().to_string()));
        }
        self.entries.push(check);
        Ok(())
    }

    pub fn checks(&self) -> &[Arc<dyn PolicyCheck>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Runs all registered checks against one candidate.
pub struct PolicyGate {
    deadline: Duration,
}

impl PolicyGate {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    /// Produce the aggregate verdict. Check errors and timeouts are failed
    /// outcomes with a structured reason, suitable for feeding back into
    /// context on retry.
    pub async fn run(
        &self,
        candidate: &CandidateAction,
        context: &Context,
        registry: &CheckRegistry,
    ) -> PolicyVerdict {
        let futures = registry.checks().iter().map(|check| {
            let check = check.clone();
            async move {
                let outcome =
                    tokio::time::timeout(self.deadline, check.check(candidate, context)).await;
                match outcome {
                    Ok(Ok(finding)) => CheckOutcome {
                        name: check.name().to_string(),
                        passed: finding.passed,
                        fatal: check.fatal(),
                        reason: finding.reason,
                    },
                    Ok(Err(e)) => {
                        tracing::debug!(check = check.name(), error = %e, "policy check errored");
                        CheckOutcome::fail(check.name(), check.fatal(), e.to_string())
                    }
                    Err(_) => CheckOutcome::fail(
                        check.name(),
                        check.fatal(),
                        format!("check missed the {:?} deadline", self.deadline),
                    ),
                }
            }
        });

        let checks = join_all(futures).await;
        let verdict = PolicyVerdict::from_checks(checks);
        if !verdict.passed {
            tracing::debug!(
                fatal = verdict.fatal_failure,
                reason = ?verdict.rejection_reason,
                "policy gate rejected candidate"
            );
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_context::IdentitySnapshot;
    use arbiter_types::{ActionKind, Priority, Task, Thought, ThoughtKind};

    struct Passes(&'static str);

    #[async_trait]
    impl PolicyCheck for Passes {
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

    struct Fails {
        name: &'static str,
        fatal: bool,
    }

    #[async_trait]
    impl PolicyCheck for Fails {
        fn name(&self) -> &str {
            self.name
        }

        fn fatal(&self) -> bool {
            self.fatal
        }

        async fn check(
            &self,
            candidate: &CandidateAction,
            _context: &Context,
        ) -> Result<CheckFinding, CheckError> {
            Ok(CheckFinding::fail(format!(
                "action '{}' violates {}",
                candidate.action, self.name
            )))
        }
    }

    struct Hangs(&'static str);

    #[async_trait]
    impl PolicyCheck for Hangs {
        fn name(&self) -> &str {
            self.0
        }

        async fn check(
            &self,
            _candidate: &CandidateAction,
            _context: &Context,
        ) -> Result<CheckFinding, CheckError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("sleep outlives every test deadline")
        }
    }

    fn context() -> Context {
        let task = Task::new("test", Priority::normal());
        let thought = Thought::new(task.id.clone(), ThoughtKind::Standard);
        Context {
            task,
            thought_id: thought.id,
            state: serde_json::Value::Null,
            identity: IdentitySnapshot {
                profile: serde_json::Value::Null,
                permitted_actions: vec![ActionKind::Speak],
            },
            memory: vec![],
            rejection_feedback: vec![],
            degraded: false,
            notes: vec![],
        }
    }

    fn candidate() -> CandidateAction {
        CandidateAction {
            action: ActionKind::Speak,
            params: serde_json::json!({"content": "hello"}),
            rationale: "test".to_string(),
            attempt: 0,
            evaluation_refs: vec!["quick".to_string()],
        }
    }

    #[tokio::test]
    async fn all_passing_checks_pass_the_gate() {
        let mut registry = CheckRegistry::new();
        registry.register(Arc::new(Passes("entropy"))).unwrap();
        registry.register(Arc::new(Passes("coherence"))).unwrap();

        let gate = PolicyGate::new(Duration::from_secs(1));
        let verdict = gate.run(&candidate(), &context(), &registry).await;
        assert!(verdict.passed);
        assert!(!verdict.fatal_failure);
        assert_eq!(verdict.checks.len(), 2);
    }

    #[tokio::test]
    async fn one_failing_check_rejects_with_structured_reason() {
        let mut registry = CheckRegistry::new();
        registry.register(Arc::new(Passes("entropy"))).unwrap();
        registry
            .register(Arc::new(Fails {
                name: "coherence",
                fatal: false,
            }))
            .unwrap();

        let gate = PolicyGate::new(Duration::from_secs(1));
        let verdict = gate.run(&candidate(), &context(), &registry).await;
        assert!(!verdict.passed);
        assert!(!verdict.fatal_failure);
        let reason = verdict.rejection_reason.unwrap();
        assert!(reason.contains("coherence"));
        assert!(reason.contains("speak"));
    }

    #[tokio::test]
    async fn fatal_failure_is_flagged_for_immediate_fallback() {
        let mut registry = CheckRegistry::new();
        registry
            .register(Arc::new(Fails {
                name: "identity_guard",
                fatal: true,
            }))
            .unwrap();
        registry.register(Arc::new(Passes("entropy"))).unwrap();

        let gate = PolicyGate::new(Duration::from_secs(1));
        let verdict = gate.run(&candidate(), &context(), &registry).await;
        assert!(!verdict.passed);
        assert!(verdict.fatal_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_check_fails_at_the_deadline() {
        let mut registry = CheckRegistry::new();
        registry.register(Arc::new(Hangs("slow_check"))).unwrap();

        let gate = PolicyGate::new(Duration::from_millis(50));
        let verdict = gate.run(&candidate(), &context(), &registry).await;
        assert!(!verdict.passed);
        assert!(verdict.checks[0]
            .reason
            .as_deref()
            .unwrap()
            .contains("deadline"));
    }

    #[tokio::test]
    async fn empty_registry_passes_vacuously() {
        let gate = PolicyGate::new(Duration::from_secs(1));
        let verdict = gate.run(&candidate(), &context(), &CheckRegistry::new()).await;
        assert!(verdict.passed);
        assert!(verdict.checks.is_empty());
    }
}
