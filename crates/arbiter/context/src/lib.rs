//! Arbiter Context - assembles the bounded input snapshot a pipeline pass
//! evaluates against.
//!
//! The builder gathers state, identity (with the permitted-action set) and
//! memory excerpts under one deadline. Identity is required; state and
//! memory are best-effort — when they lag or fail inside the deadline the
//! context is returned partial with `degraded: true` rather than blocking
//! the thought.

#![deny(unsafe_code)]

use arbiter_types::{ActionKind, Task, Thought, ThoughtId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for context assembly.
pub type ContextResult<T> = Result<T, ContextError>;

/// Context-assembly errors. Only required upstream data produces a hard
/// failure; optional sources degrade instead.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("identity source exceeded the {0:?} deadline")]
    IdentityDeadline(Duration),
}

/// Error surface for pluggable context sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

// ── Snapshot types ───────────────────────────────────────────────────

/// One bounded excerpt pulled from memory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryExcerpt {
    pub source: String,
    pub content: String,
    pub relevance: f64,
}

/// Identity data plus the action vocabulary this identity may use.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub profile: serde_json::Value,
    pub permitted_actions: Vec<ActionKind>,
}

/// The bounded input snapshot one thought is evaluated against.
///
/// `rejection_feedback` accumulates policy-gate rejection reasons across
/// retry attempts; attempt N sees every earlier rejection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Context {
    pub task: Task,
    pub thought_id: ThoughtId,
    pub state: serde_json::Value,
    pub identity: IdentitySnapshot,
    pub memory: Vec<MemoryExcerpt>,
    pub rejection_feedback: Vec<String>,
    /// True when a non-critical source was skipped or failed.
    pub degraded: bool,
    pub notes: Vec<String>,
}

impl Context {
    /// Merge a policy rejection into the context before re-entering action
    /// selection.
    pub fn merge_rejection(&mut self, reason: impl Into<String>) {
        self.rejection_feedback.push(reason.into());
    }
}

// ── Source traits ────────────────────────────────────────────────────

/// Current-state snapshot provider (environment, channel, system health).
#[async_trait]
pub trait StateSource: Send + Sync {
    async fn snapshot(&self, task: &Task) -> Result<serde_json::Value, SourceError>;
}

/// Identity provider. Required: a thought cannot be evaluated without
/// knowing who is acting and what actions are permitted.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn identity(&self, task: &Task) -> Result<IdentitySnapshot, SourceError>;
}

/// Memory excerpt provider. Best-effort.
#[async_trait]
pub trait MemorySource: Send + Sync {
    async fn recall(&self, task: &Task, limit: usize) -> Result<Vec<MemoryExcerpt>, SourceError>;
}

// ── Builder ──────────────────────────────────────────────────────────

/// Assembles contexts from injected sources under one deadline.
pub struct ContextBuilder {
    state: Arc<dyn StateSource>,
    identity: Arc<dyn IdentitySource>,
    memory: Arc<dyn MemorySource>,
    memory_limit: usize,
    deadline: Duration,
}

impl ContextBuilder {
    pub fn new(
        state: Arc<dyn StateSource>,
        identity: Arc<dyn IdentitySource>,
        memory: Arc<dyn MemorySource>,
        deadline: Duration,
    ) -> Self {
        Self {
            state,
            identity,
            memory,
            memory_limit: 16,
            deadline,
        }
    }

    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Build the context for one thought. Never blocks past the deadline.
    pub async fn build(&self, task: &Task, thought: &Thought) -> ContextResult<Context> {
        let identity_fut = tokio::time::timeout(self.deadline, self.identity.identity(task));
        let state_fut = tokio::time::timeout(self.deadline, self.state.snapshot(task));
        let memory_fut = tokio::time::timeout(
            self.deadline,
            self.memory.recall(task, self.memory_limit),
        );

        let (identity, state, memory) = tokio::join!(identity_fut, state_fut, memory_fut);

        let identity = match identity {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => return Err(ContextError::IdentityUnavailable(e.to_string())),
            Err(_) => return Err(ContextError::IdentityDeadline(self.deadline)),
        };

        let mut degraded = false;
        let mut notes = Vec::new();

        let state = match state {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                degraded = true;
                notes.push(format!("state snapshot unavailable: {e}"));
                serde_json::Value::Null
            }
            Err(_) => {
                degraded = true;
                notes.push("state snapshot missed the deadline".to_string());
                serde_json::Value::Null
            }
        };

        let memory = match memory {
            Ok(Ok(excerpts)) => excerpts,
            Ok(Err(e)) => {
                degraded = true;
                notes.push(format!("memory recall unavailable: {e}"));
                vec![]
            }
            Err(_) => {
                degraded = true;
                notes.push("memory recall missed the deadline".to_string());
                vec![]
            }
        };

        if degraded {
            tracing::debug!(
                task_id = %task.id,
                thought_id = %thought.id,
                ?notes,
                "built degraded context"
            );
        }

        Ok(Context {
            task: task.clone(),
            thought_id: thought.id.clone(),
            state,
            identity,
            memory,
            rejection_feedback: vec![],
            degraded,
            notes,
        })
    }
}
