use crate::StoreResult;
use arbiter_types::{
    AuditEntry, OccurrenceId, Task, TaskId, TaskStatus, Thought, ThoughtId,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Storage interface for task records and the claim primitive.
///
/// `claim_if_unclaimed`, `renew_lease` and `release_claim` are atomic
/// conditional writes; occurrences never coordinate through anything else.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails with `Conflict` if the id already exists.
    async fn put_task(&self, task: Task) -> StoreResult<()>;

    /// Get one task by id.
    async fn get_task(&self, task_id: &TaskId) -> StoreResult<Option<Task>>;

    /// Overwrite an existing task record.
    async fn update_task(&self, task: Task) -> StoreResult<()>;

    /// List tasks claimable at `now`, highest priority first, oldest first
    /// within a priority band.
    async fn list_claimable(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Task>>;

    /// Atomically claim a task: set `claimed_by` and a fresh lease, only if
    /// the task is currently unclaimed or its lease has expired. Returns
    /// whether this occurrence won the claim.
    async fn claim_if_unclaimed(
        &self,
        task_id: &TaskId,
        occurrence_id: &OccurrenceId,
        lease_ttl: Duration,
    ) -> StoreResult<bool>;

    /// Extend the lease, only if `occurrence_id` still holds the claim.
    async fn renew_lease(
        &self,
        task_id: &TaskId,
        occurrence_id: &OccurrenceId,
        lease_ttl: Duration,
    ) -> StoreResult<bool>;

    /// Clear the claim and set a new status, only if `occurrence_id` holds
    /// the claim. Returns whether the release applied.
    async fn release_claim(
        &self,
        task_id: &TaskId,
        occurrence_id: &OccurrenceId,
        new_status: TaskStatus,
    ) -> StoreResult<bool>;
}

/// Storage interface for thought records.
#[async_trait]
pub trait ThoughtStore: Send + Sync {
    async fn put_thought(&self, thought: Thought) -> StoreResult<()>;
    async fn get_thought(&self, thought_id: &ThoughtId) -> StoreResult<Option<Thought>>;
    async fn update_thought(&self, thought: Thought) -> StoreResult<()>;
    /// All thoughts generated for a task, oldest first.
    async fn list_thoughts_for_task(&self, task_id: &TaskId) -> StoreResult<Vec<Thought>>;
}

/// Storage interface for the ordered, append-only audit chain.
///
/// The ledger prepares fully linked and signed entries; the store enforces
/// that appends are monotonic and gap-free. A concurrent writer that lost
/// the head race gets `Conflict` and must re-link against the new head.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a prepared entry. Fails with `Conflict` unless
    /// `entry.sequence` is exactly head+1 and `entry.previous_hash` matches
    /// the current head hash.
    async fn append_entry(&self, entry: AuditEntry) -> StoreResult<u64>;

    /// Latest sequence number and content hash, if any entries exist.
    async fn head(&self) -> StoreResult<Option<(u64, String)>>;

    /// Read entries with `seq_from <= sequence <= seq_to`, ascending.
    async fn read_range(&self, seq_from: u64, seq_to: u64) -> StoreResult<Vec<AuditEntry>>;
}

/// Unified storage bundle used by the runtime composition root.
pub trait ArbiterStore: TaskStore + ThoughtStore + AuditStore + Send + Sync {}

impl<T> ArbiterStore for T where T: TaskStore + ThoughtStore + AuditStore + Send + Sync {}
