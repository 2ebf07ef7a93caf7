//! Concurrent evaluator fan-out with one shared deadline and a quorum
//! policy.
//!
//! Evaluators that fail or miss the deadline are recorded as
//! failed-with-reason; the batch only aborts when fewer than `quorum`
//! evaluators succeeded. Result ordering always follows registration
//! order, regardless of completion order.

use crate::registry::EvaluatorRegistry;
use arbiter_context::Context;
use arbiter_types::{EvaluationOutcome, EvaluationResult};
use futures::future::join_all;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("no evaluators registered")]
    NoEvaluators,

    #[error("quorum not met: {succeeded} of {required} required evaluations succeeded")]
    QuorumNotMet { succeeded: usize, required: usize },
}

/// Dispatches all registered evaluators against one context.
pub struct EvaluatorFanOut {
    deadline: Duration,
    quorum: usize,
}

impl EvaluatorFanOut {
    pub fn new(deadline: Duration, quorum: usize) -> Self {
        Self {
            deadline,
            // A quorum of zero would let a thought proceed with no
            // evaluations at all.
            quorum: quorum.max(1),
        }
    }

    /// Run every evaluator concurrently. Returns results in registration
    /// order, or `QuorumNotMet` when too few succeeded — in that case the
    /// thought is errored and the task is requeued without consuming a
    /// retry.
    pub async fn evaluate(
        &self,
        context: &Context,
        registry: &EvaluatorRegistry,
    ) -> Result<Vec<EvaluationResult>, FanOutError> {
        if registry.is_empty() {
            return Err(FanOutError::NoEvaluators);
        }

        let futures = registry.evaluators().iter().map(|evaluator| {
            let evaluator = evaluator.clone();
            async move {
                let started = Instant::now();
                let outcome =
                    tokio::time::timeout(self.deadline, evaluator.evaluate(context)).await;
                let latency_ms = started.elapsed().as_millis() as u64;

                match outcome {
                    Ok(Ok(verdict)) => EvaluationResult {
                        evaluator: evaluator.name().to_string(),
                        verdict: verdict.payload,
                        proposed_action: verdict.proposed_action,
                        confidence: verdict.confidence,
                        flags: verdict.flags,
                        latency_ms,
                        outcome: EvaluationOutcome::Succeeded,
                    },
                    Ok(Err(e)) => {
                        tracing::debug!(
                            evaluator = evaluator.name(),
                            error = %e,
                            "evaluator failed"
                        );
                        EvaluationResult::failed(evaluator.name(), e.to_string(), latency_ms)
                    }
                    Err(_) => {
                        tracing::debug!(
                            evaluator = evaluator.name(),
                            deadline_ms = self.deadline.as_millis() as u64,
                            "evaluator missed the shared deadline"
                        );
                        EvaluationResult::timed_out(evaluator.name(), latency_ms)
                    }
                }
            }
        });

        let results = join_all(futures).await;

        let succeeded = results.iter().filter(|r| r.outcome.succeeded()).count();
        if succeeded < self.quorum {
            return Err(FanOutError::QuorumNotMet {
                succeeded,
                required: self.quorum,
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Evaluator, EvaluatorError, EvaluatorVerdict};
    use arbiter_types::{ActionKind, Priority, Task, Thought, ThoughtKind};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Succeeds {
        name: &'static str,
        action: ActionKind,
        confidence: f64,
    }

    #[async_trait]
    impl Evaluator for Succeeds {
        fn name(&self) -> &str {
            self.name
        }

        async fn evaluate(&self, _context: &Context) -> Result<EvaluatorVerdict, EvaluatorError> {
            Ok(EvaluatorVerdict {
                proposed_action: Some(self.action),
                payload: serde_json::json!({"summary": "fine"}),
                confidence: self.confidence,
                flags: vec![],
            })
        }
    }

    struct Hangs(&'static str);

    #[async_trait]
    impl Evaluator for Hangs {
        fn name(&self) -> &str {
            self.0
        }

        async fn evaluate(&self, _context: &Context) -> Result<EvaluatorVerdict, EvaluatorError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("sleep outlives every test deadline")
        }
    }

    struct Errors(&'static str);

    #[async_trait]
    impl Evaluator for Errors {
        fn name(&self) -> &str {
            self.0
        }

        async fn evaluate(&self, _context: &Context) -> Result<EvaluatorVerdict, EvaluatorError> {
            Err(EvaluatorError::Failed("backend unreachable".to_string()))
        }
    }

    fn context() -> Context {
        let task = Task::new("test", Priority::normal());
        let thought = Thought::new(task.id.clone(), ThoughtKind::Standard);
        Context {
            task,
            thought_id: thought.id,
            state: serde_json::Value::Null,
            identity: arbiter_context::IdentitySnapshot {
                profile: serde_json::Value::Null,
                permitted_actions: vec![ActionKind::Speak, ActionKind::Defer],
            },
            memory: vec![],
            rejection_feedback: vec![],
            degraded: false,
            notes: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_of_one_survives_two_timeouts() {
        let mut registry = EvaluatorRegistry::new();
        registry.register(Arc::new(Hangs("slow_a"))).unwrap();
        registry
            .register(Arc::new(Succeeds {
                name: "quick",
                action: ActionKind::Speak,
                confidence: 0.8,
            }))
            .unwrap();
        registry.register(Arc::new(Hangs("slow_b"))).unwrap();

        let fanout = EvaluatorFanOut::new(Duration::from_millis(50), 1);
        let results = fanout.evaluate(&context(), &registry).await.unwrap();

        assert_eq!(results.len(), 3);
        // Registration order preserved.
        assert_eq!(results[0].evaluator, "slow_a");
        assert_eq!(results[1].evaluator, "quick");
        assert_eq!(results[2].evaluator, "slow_b");
        assert!(matches!(results[0].outcome, EvaluationOutcome::TimedOut));
        assert!(results[1].outcome.succeeded());
        assert_eq!(results.iter().filter(|r| r.outcome.succeeded()).count(), 1);
    }

    #[tokio::test]
    async fn quorum_failure_aborts_the_batch() {
        let mut registry = EvaluatorRegistry::new();
        registry.register(Arc::new(Errors("broken_a"))).unwrap();
        registry.register(Arc::new(Errors("broken_b"))).unwrap();

        let fanout = EvaluatorFanOut::new(Duration::from_secs(1), 1);
        let err = fanout.evaluate(&context(), &registry).await.unwrap_err();
        assert!(matches!(
            err,
            FanOutError::QuorumNotMet {
                succeeded: 0,
                required: 1
            }
        ));
    }

    #[tokio::test]
    async fn failures_are_recorded_with_reason_when_quorum_met() {
        let mut registry = EvaluatorRegistry::new();
        registry.register(Arc::new(Errors("broken"))).unwrap();
        registry
            .register(Arc::new(Succeeds {
                name: "quick",
                action: ActionKind::Speak,
                confidence: 0.8,
            }))
            .unwrap();

        let fanout = EvaluatorFanOut::new(Duration::from_secs(1), 1);
        let results = fanout.evaluate(&context(), &registry).await.unwrap();

        match &results[0].outcome {
            EvaluationOutcome::Failed { reason } => {
                assert!(reason.contains("backend unreachable"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn quorum_is_never_zero() {
        let mut registry = EvaluatorRegistry::new();
        registry.register(Arc::new(Errors("broken"))).unwrap();

        let fanout = EvaluatorFanOut::new(Duration::from_secs(1), 0);
        let err = fanout.evaluate(&context(), &registry).await.unwrap_err();
        assert!(matches!(err, FanOutError::QuorumNotMet { required: 1, .. }));
    }
}
