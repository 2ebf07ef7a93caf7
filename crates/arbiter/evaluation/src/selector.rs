//! Action selection: one aggregator turning N evaluation results into one
//! candidate action plus rationale.
//!
//! The aggregation rule is pluggable; every strategy must produce exactly
//! one candidate per invocation and must never write to the audit ledger.

use arbiter_context::Context;
use arbiter_types::{ActionKind, CandidateAction, EvaluationResult};
use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("selection invoked with no evaluation results")]
    NoResults,
}

/// Pluggable aggregation rule.
#[async_trait]
pub trait SelectionStrategy: Send + Sync {
    async fn select(
        &self,
        results: &[EvaluationResult],
        context: &Context,
        attempt: u32,
    ) -> Result<CandidateAction, SelectionError>;
}

/// Default deterministic strategy: take the highest-confidence successful
/// proposal, noting disagreement in the rationale when evaluators propose
/// different actions. Falls back to `Defer` when nothing usable was
/// proposed or the winner is not in the permitted-action set.
pub struct HighestConfidenceSelector;

#[async_trait]
impl SelectionStrategy for HighestConfidenceSelector {
    async fn select(
        &self,
        results: &[EvaluationResult],
        context: &Context,
        attempt: u32,
    ) -> Result<CandidateAction, SelectionError> {
        if results.is_empty() {
            return Err(SelectionError::NoResults);
        }

        let consulted: Vec<String> = results
            .iter()
            .filter(|r| r.outcome.succeeded())
            .map(|r| r.evaluator.clone())
            .collect();

        let proposals: Vec<(&EvaluationResult, ActionKind)> = results
            .iter()
            .filter(|r| r.outcome.succeeded())
            .filter_map(|r| r.proposed_action.map(|a| (r, a)))
            .collect();

        let distinct: BTreeSet<String> =
            proposals.iter().map(|(_, a)| a.to_string()).collect();

        let mut rationale_parts: Vec<String> = Vec::new();
        if attempt > 0 && !context.rejection_feedback.is_empty() {
            rationale_parts.push(format!(
                "reselection after rejection: {}",
                context.rejection_feedback.join(" | ")
            ));
        }

        let winner = proposals
            .iter()
            .max_by(|(a, _), (b, _)| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(result, action)| (result.evaluator.clone(), *action, result.confidence));

        let (action, params) = match winner {
            Some((ref evaluator, action, confidence)) => {
                if distinct.len() > 1 {
                    rationale_parts.push(format!(
                        "evaluators disagreed ({}); selected '{}' from {} at confidence {:.2}",
                        distinct.iter().cloned().collect::<Vec<_>>().join(", "),
                        action,
                        evaluator,
                        confidence
                    ));
                } else {
                    rationale_parts.push(format!(
                        "selected '{}' from {} at confidence {:.2}",
                        action, evaluator, confidence
                    ));
                }

                if context.identity.permitted_actions.contains(&action) {
                    let params = proposals
                        .iter()
                        .find(|(r, _)| &r.evaluator == evaluator)
                        .map(|(r, _)| r.verdict.clone())
                        .unwrap_or(serde_json::Value::Null);
                    (action, params)
                } else {
                    rationale_parts.push(format!(
                        "'{action}' is not in the permitted-action set; deferring"
                    ));
                    (ActionKind::Defer, serde_json::Value::Null)
                }
            }
            None => {
                rationale_parts
                    .push("no evaluator proposed an action; deferring".to_string());
                (ActionKind::Defer, serde_json::Value::Null)
            }
        };

        Ok(CandidateAction {
            action,
            params,
            rationale: rationale_parts.join(". "),
            attempt,
            evaluation_refs: consulted,
        })
    }
}
