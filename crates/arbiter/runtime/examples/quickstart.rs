//! Minimal wired occurrence over the in-memory store.
//!
//! Submits one task, watches the step events it produces, and shuts down
//! once the task settles. Run with `cargo run -p arbiter-runtime --example
//! quickstart`.

use arbiter_context::{
    Context, ContextBuilder, IdentitySnapshot, IdentitySource, MemoryExcerpt, MemorySource,
    SourceError, StateSource,
};
use arbiter_evaluation::{
    Evaluator, EvaluatorError, EvaluatorRegistry, EvaluatorVerdict, HighestConfidenceSelector,
};
use arbiter_gate::{CheckError, CheckFinding, CheckRegistry, PolicyCheck};
use arbiter_ledger::{AuditLedger, LedgerSigner};
use arbiter_pipeline::ActionDispatcher;
use arbiter_runtime::Occurrence;
use arbiter_store::memory::InMemoryStore;
use arbiter_store::TaskStore;
use arbiter_types::{
    ActionKind, ArbiterConfig, CandidateAction, DispatchResult, Priority, Task, Thought,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

struct EnvState;
#[async_trait]
impl StateSource for EnvState {
    async fn snapshot(&self, task: &Task) -> Result<serde_json::Value, SourceError> {
        Ok(serde_json::json!({ "channel": task.channel_id }))
    }
}

struct StaticIdentity;
#[async_trait]
impl IdentitySource for StaticIdentity {
    async fn identity(&self, _task: &Task) -> Result<IdentitySnapshot, SourceError> {
        Ok(IdentitySnapshot {
            profile: serde_json::json!({ "name": "quickstart" }),
            permitted_actions: vec![
                ActionKind::Speak,
                ActionKind::Defer,
                ActionKind::TaskComplete,
            ],
        })
    }
}

struct NoMemory;
#[async_trait]
impl MemorySource for NoMemory {
    async fn recall(&self, _task: &Task, _limit: usize) -> Result<Vec<MemoryExcerpt>, SourceError> {
        Ok(vec![])
    }
}

/// Toy evaluator: always proposes closing the task.
struct Completer;
#[async_trait]
impl Evaluator for Completer {
    fn name(&self) -> &str {
        "completer"
    }

    async fn evaluate(&self, context: &Context) -> Result<EvaluatorVerdict, EvaluatorError> {
        Ok(EvaluatorVerdict {
            proposed_action: Some(ActionKind::TaskComplete),
            payload: serde_json::json!({ "task": context.task.description }),
            confidence: 0.95,
            flags: vec![],
        })
    }
}

/// Toy check: rejects empty task descriptions.
struct NonEmptyDescription;
#[async_trait]
impl PolicyCheck for NonEmptyDescription {
    fn name(&self) -> &str {
        "non_empty_description"
    }

    async fn check(
        &self,
        _candidate: &CandidateAction,
        context: &Context,
    ) -> Result<CheckFinding, CheckError> {
        if context.task.description.trim().is_empty() {
            Ok(CheckFinding::fail("task has no description"))
        } else {
            Ok(CheckFinding::pass())
        }
    }
}

struct PrintDispatcher;
#[async_trait]
impl ActionDispatcher for PrintDispatcher {
    async fn dispatch(&self, action: &CandidateAction, thought: &Thought) -> DispatchResult {
        println!(
            "dispatching {} for thought {} ({})",
            action.action, thought.id, action.rationale
        );
        DispatchResult {
            success: true,
            detail: "printed".to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,arbiter=debug".into()),
        )
        .init();

    let config = ArbiterConfig {
        worker_count: 2,
        ..ArbiterConfig::default()
    };
    let store = Arc::new(InMemoryStore::new());
    let ledger = Arc::new(AuditLedger::new(store.clone(), LedgerSigner::generate()));
    let context_builder = Arc::new(ContextBuilder::new(
        Arc::new(EnvState),
        Arc::new(StaticIdentity),
        Arc::new(NoMemory),
        config.context_timeout(),
    ));

    let mut evaluators = EvaluatorRegistry::new();
    evaluators.register(Arc::new(Completer))?;
    let mut checks = CheckRegistry::new();
    checks.register(Arc::new(NonEmptyDescription))?;

    let occurrence = Occurrence::new(
        config,
        store.clone(),
        ledger.clone(),
        context_builder,
        evaluators,
        Arc::new(HighestConfidenceSelector),
        checks,
        Arc::new(PrintDispatcher),
    )
    .with_poll_interval(Duration::from_millis(50));

    let mut events = occurrence.subscribe();
    let task_id = occurrence
        .submit(Task::new("say hello and finish", Priority::normal()))
        .await?;

    let handle = occurrence.start().await?;

    loop {
        let event = events.recv().await?;
        println!("[{}] {} {}", event.stage, event.thought_id, event.payload);
        if event.stage.is_terminal() {
            break;
        }
    }

    // Give the worker a beat to settle the task, then stop.
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.shutdown().await;

    let task = store.get_task(&task_id).await?.ok_or("task vanished")?;
    println!("task settled as {:?}", task.status);
    println!(
        "audit chain length {}, valid: {}",
        ledger.latest_sequence().await?,
        ledger
            .verify(1, ledger.latest_sequence().await?)
            .await?
            .valid
    );
    Ok(())
}
