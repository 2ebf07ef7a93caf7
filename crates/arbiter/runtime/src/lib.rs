//! Arbiter Runtime - the composition root that wires store, ledger,
//! context, evaluation, gate and pipeline into a running occurrence.
//!
//! An occurrence is one live instance of the runtime. Several occurrences
//! may share one store; they coordinate only through the atomic task-claim
//! primitive and the ordered audit append. Startup refuses to proceed over
//! a compromised audit chain.

#![deny(unsafe_code)]

mod coordinator;
mod worker;

pub use coordinator::OccurrenceCoordinator;

use arbiter_context::ContextBuilder;
use arbiter_evaluation::{EvaluatorRegistry, SelectionStrategy};
use arbiter_gate::CheckRegistry;
use arbiter_ledger::{AuditLedger, LedgerError};
use arbiter_pipeline::{
    ActionDispatcher, LeaseKeeper, PipelineError, PipelineOrchestrator,
};
use arbiter_store::{ArbiterStore, StoreError};
use arbiter_types::{ArbiterConfig, StepEvent, Task, TaskId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("pipeline failure: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("ledger failure: {0}")]
    Ledger(#[from] LedgerError),

    #[error("audit chain compromised at sequence {first_invalid:?}: {detail}")]
    ChainCompromised {
        first_invalid: Option<u64>,
        detail: String,
    },
}

/// One live runtime occurrence. Construct it with every collaborator
/// explicitly; there is no global state to fall back on.
pub struct Occurrence {
    config: ArbiterConfig,
    store: Arc<dyn ArbiterStore>,
    ledger: Arc<AuditLedger>,
    coordinator: Arc<OccurrenceCoordinator>,
    orchestrator: Arc<PipelineOrchestrator>,
    poll_interval: Duration,
}

impl Occurrence {
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
    ) -> Self {
        let coordinator = Arc::new(OccurrenceCoordinator::new(
            config.occurrence_id.clone(),
            store.clone(),
            config.lease_ttl(),
        ));
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            config.clone(),
            store.clone(),
            ledger.clone(),
            context_builder,
            evaluators,
            selector,
            checks,
            dispatcher,
            coordinator.clone() as Arc<dyn LeaseKeeper>,
        ));
        Self {
            config,
            store,
            ledger,
            coordinator,
            orchestrator,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// How often an idle worker rescans for claimable tasks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Subscribe to per-stage step events from this occurrence's pipeline.
    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.orchestrator.subscribe()
    }

    /// Enqueue a task for any occurrence sharing the store to claim.
    pub async fn submit(&self, task: Task) -> RuntimeResult<TaskId> {
        let task_id = task.id.clone();
        self.store.put_task(task).await?;
        tracing::debug!(task_id = %task_id, "task submitted");
        Ok(task_id)
    }

    /// Verify the audit chain, then start the worker pool.
    ///
    /// A chain that fails verification aborts startup: running over a
    /// tampered or truncated history would silently extend it.
    pub async fn start(&self) -> RuntimeResult<OccurrenceHandle> {
        let latest = self.ledger.latest_sequence().await?;
        if latest > 0 {
            let verification = self.ledger.verify(1, latest).await?;
            if !verification.valid {
                return Err(RuntimeError::ChainCompromised {
                    first_invalid: verification.first_invalid,
                    detail: verification
                        .error
                        .unwrap_or_else(|| "verification failed".to_string()),
                });
            }
            tracing::info!(
                entries = verification.entries_checked,
                "audit chain verified at startup"
            );
        }

        let workers = self.config.worker_count.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let worker = worker::Worker::new(
                index,
                self.config.clone(),
                self.store.clone(),
                self.ledger.clone(),
                self.coordinator.clone(),
                self.orchestrator.clone(),
                self.poll_interval,
                shutdown_rx.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        tracing::info!(
            occurrence = %self.config.occurrence_id,
            workers,
            signer = self.ledger.signer_key_id(),
            "occurrence started"
        );
        Ok(OccurrenceHandle {
            shutdown: shutdown_tx,
            handles,
        })
    }
}

/// Handle to a started occurrence's worker pool.
#[derive(Debug)]
pub struct OccurrenceHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl OccurrenceHandle {
    /// Signal shutdown and wait for every worker to reach a stage boundary
    /// and stop. In-flight thoughts are deferred with an audit record, not
    /// abandoned mid-stage.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker terminated abnormally");
            }
        }
    }
}
