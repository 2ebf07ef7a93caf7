//! Name-keyed evaluator registry.
//!
//! Explicitly constructed and passed to the fan-out; there is no global
//! registration. Registration order is preserved because it defines the
//! audit ordering of results.

use crate::Evaluator;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("evaluator '{0}' is already registered")]
    DuplicateName(String),
}

/// Ordered, name-unique collection of evaluators.
#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    entries: Vec<Arc<dyn Evaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an evaluator. Names must be unique.
    pub fn register(&mut self, evaluator: Arc<dyn Evaluator>) -> Result<(), RegistryError> {
        if self.entries.iter().any(|e| e.name() == evaluator.name()) {
            return Err(RegistryError::DuplicateName(evaluator.name().to_string()));
        }
        self.entries.push(evaluator);
        Ok(())
    }

    /// Evaluators in registration order.
    pub fn evaluators(&self) -> &[Arc<dyn Evaluator>] {
        &self.entries
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
