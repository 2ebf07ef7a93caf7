//! Bounded worker pool: each worker claims one task at a time, drives it
//! through the pipeline (including follow-up thoughts) and settles it back
//! into the store.

use crate::coordinator::OccurrenceCoordinator;
use crate::RuntimeError;
use arbiter_ledger::AuditLedger;
use arbiter_pipeline::{PipelineDisposition, PipelineError, PipelineOrchestrator};
use arbiter_store::ArbiterStore;
use arbiter_types::{ActionKind, ArbiterConfig, AuditPayload, Task, TaskStatus, ThoughtKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Terminal action to task status mapping.
pub(crate) fn terminal_status(action: ActionKind) -> TaskStatus {
    match action {
        ActionKind::TaskComplete => TaskStatus::Completed,
        ActionKind::Reject => TaskStatus::Failed,
        // Defer, and any future terminal action without a sharper mapping.
        _ => TaskStatus::Deferred,
    }
}

pub(crate) struct Worker {
    index: usize,
    config: ArbiterConfig,
    store: Arc<dyn ArbiterStore>,
    ledger: Arc<AuditLedger>,
    coordinator: Arc<OccurrenceCoordinator>,
    orchestrator: Arc<PipelineOrchestrator>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: usize,
        config: ArbiterConfig,
        store: Arc<dyn ArbiterStore>,
        ledger: Arc<AuditLedger>,
        coordinator: Arc<OccurrenceCoordinator>,
        orchestrator: Arc<PipelineOrchestrator>,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            index,
            config,
            store,
            ledger,
            coordinator,
            orchestrator,
            poll_interval,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(worker = self.index, "worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.coordinator.claim_next().await {
                Ok(Some(task)) => {
                    let task_id = task.id.clone();
                    if let Err(e) = self.process(task).await {
                        tracing::warn!(
                            worker = self.index,
                            task_id = %task_id,
                            error = %e,
                            "task processing failed"
                        );
                    }
                }
                Ok(None) => self.idle().await,
                Err(e) => {
                    tracing::warn!(worker = self.index, error = %e, "claim scan failed");
                    self.idle().await;
                }
            }
        }
        tracing::debug!(worker = self.index, "worker stopped");
    }

    async fn idle(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    /// Drive one claimed task to a settled status. Non-terminal actions
    /// trigger follow-up thoughts on the same claim, bounded by the
    /// follow-up cap.
    async fn process(&self, mut task: Task) -> Result<(), RuntimeError> {
        let mut kind = ThoughtKind::Standard;
        loop {
            let outcome = match self
                .orchestrator
                .run_task(task.clone(), kind, &self.shutdown)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Audit and store failures keep the claim: the task
                    // becomes claimable again only once the lease expires,
                    // so another occurrence retries from scratch. Context
                    // and selection failures requeue immediately.
                    if !matches!(e, PipelineError::Audit(_) | PipelineError::Store(_)) {
                        let _ = self.coordinator.release(&task.id, TaskStatus::Queued).await;
                    }
                    return Err(e.into());
                }
            };

            match outcome.disposition {
                PipelineDisposition::Terminal(action) => {
                    self.coordinator
                        .release(&task.id, terminal_status(action))
                        .await?;
                    return Ok(());
                }
                PipelineDisposition::FollowUp(action) => {
                    if let Some(fresh) = self.store.get_task(&task.id).await? {
                        task = fresh;
                    }
                    task.retry_count += 1;
                    if task.retry_count > self.config.max_follow_ups {
                        tracing::info!(
                            task_id = %task.id,
                            follow_ups = task.retry_count - 1,
                            "follow-up cap reached; deferring task"
                        );
                        // The forced deferral is recorded like any other
                        // fallback. A commit failure keeps the claim, same
                        // as an audit failure inside the pipeline.
                        self.ledger
                            .commit(AuditPayload {
                                thought_id: outcome.thought.id.clone(),
                                task_id: task.id.clone(),
                                action: self.config.fallback_action,
                                params: serde_json::Value::Null,
                                verdict_summary: format!(
                                    "follow-up cap of {} reached after {}; deferring task",
                                    self.config.max_follow_ups, action
                                ),
                                depth: outcome.thought.depth,
                                fallback: true,
                            })
                            .await?;
                        self.store.update_task(task.clone()).await?;
                        self.coordinator
                            .release(&task.id, TaskStatus::Deferred)
                            .await?;
                        return Ok(());
                    }
                    self.store.update_task(task.clone()).await?;
                    if !self.coordinator.renew_lease(&task.id).await? {
                        tracing::warn!(
                            task_id = %task.id,
                            "lease lost before follow-up; abandoning task"
                        );
                        return Ok(());
                    }
                    tracing::debug!(task_id = %task.id, after = %action, "running follow-up thought");
                    kind = ThoughtKind::FollowUp;
                }
                PipelineDisposition::Requeue => {
                    self.coordinator.release(&task.id, TaskStatus::Queued).await?;
                    return Ok(());
                }
                PipelineDisposition::Cancelled => {
                    self.coordinator
                        .release(&task.id, TaskStatus::Deferred)
                        .await?;
                    return Ok(());
                }
            }
        }
    }
}
