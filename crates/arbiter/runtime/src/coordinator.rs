//! Occurrence-side view of the shared claim primitive.
//!
//! Multiple runtime occurrences coordinate exclusively through atomic
//! conditional writes on the shared store: claim, renew, release. There is
//! no leader, no lock service and no occurrence-to-occurrence channel. A
//! crashed occurrence simply stops renewing; its lease expires and the task
//! becomes claimable again.

use arbiter_pipeline::LeaseKeeper;
use arbiter_store::{ArbiterStore, StoreResult};
use arbiter_types::{OccurrenceId, Task, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// How many claimable tasks one scan considers before giving up. Losing
/// every race in a scan just means another occurrence is draining the
/// queue; the caller polls again.
const CLAIM_SCAN_LIMIT: usize = 8;

pub struct OccurrenceCoordinator {
    occurrence_id: OccurrenceId,
    store: Arc<dyn ArbiterStore>,
    lease_ttl: chrono::Duration,
}

impl OccurrenceCoordinator {
    pub fn new(
        occurrence_id: OccurrenceId,
        store: Arc<dyn ArbiterStore>,
        lease_ttl: chrono::Duration,
    ) -> Self {
        Self {
            occurrence_id,
            store,
            lease_ttl,
        }
    }

    pub fn occurrence_id(&self) -> &OccurrenceId {
        &self.occurrence_id
    }

    /// Claim the next available task: highest priority first, oldest first
    /// within a band. Returns `None` when nothing is claimable or every
    /// claim race in this scan was lost.
    pub async fn claim_next(&self) -> StoreResult<Option<Task>> {
        let now = Utc::now();
        let candidates = self.store.list_claimable(now, CLAIM_SCAN_LIMIT).await?;
        for candidate in candidates {
            let won = self
                .store
                .claim_if_unclaimed(&candidate.id, &self.occurrence_id, self.lease_ttl)
                .await?;
            if won {
                tracing::debug!(
                    task_id = %candidate.id,
                    occurrence = %self.occurrence_id,
                    "claimed task"
                );
                return self.store.get_task(&candidate.id).await;
            }
        }
        Ok(None)
    }

    /// Extend this occurrence's lease on a task. False means the lease was
    /// already lost.
    pub async fn renew_lease(&self, task_id: &TaskId) -> StoreResult<bool> {
        self.store
            .renew_lease(task_id, &self.occurrence_id, self.lease_ttl)
            .await
    }

    /// Release the claim and settle the task into `status`.
    pub async fn release(&self, task_id: &TaskId, status: TaskStatus) -> StoreResult<bool> {
        self.store
            .release_claim(task_id, &self.occurrence_id, status)
            .await
    }
}

#[async_trait]
impl LeaseKeeper for OccurrenceCoordinator {
    async fn renew(&self, task_id: &TaskId) -> bool {
        match self.renew_lease(task_id).await {
            Ok(renewed) => renewed,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "lease renewal errored");
                false
            }
        }
    }
}
