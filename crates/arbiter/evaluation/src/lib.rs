//! Arbiter Evaluation - runs independent evaluators concurrently against
//! one context and turns their verdicts into a single candidate action.
//!
//! Evaluators are pluggable and make zero assumptions about reasoning
//! method; this crate only owns the fan-out discipline (shared deadline,
//! quorum, audit-stable ordering) and the selection contract (exactly one
//! candidate per invocation).

#![deny(unsafe_code)]

mod fanout;
mod registry;
mod selector;

pub use fanout::{EvaluatorFanOut, FanOutError};
pub use registry::{EvaluatorRegistry, RegistryError};
pub use selector::{HighestConfidenceSelector, SelectionError, SelectionStrategy};

use arbiter_context::Context;
use async_trait::async_trait;
use thiserror::Error;

/// Error surface for evaluator implementations.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("evaluation failed: {0}")]
    Failed(String),
}

/// One independent judgment produced by an evaluator.
#[derive(Clone, Debug)]
pub struct EvaluatorVerdict {
    /// Action this evaluator proposes, if it proposes one.
    pub proposed_action: Option<arbiter_types::ActionKind>,
    /// Free-form verdict payload preserved for audit.
    pub payload: serde_json::Value,
    pub confidence: f64,
    pub flags: Vec<String>,
}

/// A pluggable evaluator. Implementations live outside this crate; test
/// doubles live in the test modules.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Stable name, used as the registry key and recorded on every result.
    fn name(&self) -> &str;

    async fn evaluate(&self, context: &Context) -> Result<EvaluatorVerdict, EvaluatorError>;
}
