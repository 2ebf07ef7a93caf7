//! In-memory reference implementation for the Arbiter storage traits.
//!
//! Deterministic and test-friendly. All conditional writes take the write
//! lock for the whole read-check-write sequence, which is what makes them
//! atomic with respect to concurrent claimers sharing the adapter.

use crate::traits::{AuditStore, TaskStore, ThoughtStore};
use crate::{StoreError, StoreResult};
use arbiter_types::{
    AuditEntry, OccurrenceId, Task, TaskId, TaskStatus, Thought, ThoughtId,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory storage adapter.
#[derive(Default)]
pub struct InMemoryStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    thoughts: RwLock<HashMap<ThoughtId, Thought>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn put_task(&self, task: Task) -> StoreResult<()> {
        let mut guard = self
            .tasks
            .write()
            .map_err(|_| StoreError::Backend("tasks lock poisoned".to_string()))?;
        if guard.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        guard.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> StoreResult<Option<Task>> {
        let guard = self
            .tasks
            .read()
            .map_err(|_| StoreError::Backend("tasks lock poisoned".to_string()))?;
        Ok(guard.get(task_id).cloned())
    }

    async fn update_task(&self, task: Task) -> StoreResult<()> {
        let mut guard = self
            .tasks
            .write()
            .map_err(|_| StoreError::Backend("tasks lock poisoned".to_string()))?;
        if !guard.contains_key(&task.id) {
            return Err(StoreError::NotFound(format!("task {} not found", task.id)));
        }
        guard.insert(task.id.clone(), task);
        Ok(())
    }

    async fn list_claimable(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Task>> {
        let guard = self
            .tasks
            .read()
            .map_err(|_| StoreError::Backend("tasks lock poisoned".to_string()))?;
        let mut claimable: Vec<Task> = guard
            .values()
            .filter(|t| t.is_claimable(now))
            .cloned()
            .collect();
        claimable.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        claimable.truncate(limit);
        Ok(claimable)
    }

    async fn claim_if_unclaimed(
        &self,
        task_id: &TaskId,
        occurrence_id: &OccurrenceId,
        lease_ttl: Duration,
    ) -> StoreResult<bool> {
        let mut guard = self
            .tasks
            .write()
            .map_err(|_| StoreError::Backend("tasks lock poisoned".to_string()))?;
        let task = guard
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {} not found", task_id)))?;

        let now = Utc::now();
        if !task.is_claimable(now) {
            return Ok(false);
        }

        task.claimed_by = Some(occurrence_id.clone());
        task.lease_expires_at = Some(now + lease_ttl);
        task.status = TaskStatus::Claimed;
        Ok(true)
    }

    async fn renew_lease(
        &self,
        task_id: &TaskId,
        occurrence_id: &OccurrenceId,
        lease_ttl: Duration,
    ) -> StoreResult<bool> {
        let mut guard = self
            .tasks
            .write()
            .map_err(|_| StoreError::Backend("tasks lock poisoned".to_string()))?;
        let task = guard
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {} not found", task_id)))?;

        let now = Utc::now();
        // An expired lease must not be renewable: the task is already fair
        // game for other occurrences.
        if task.claimed_by.as_ref() != Some(occurrence_id) || !task.has_live_claim(now) {
            return Ok(false);
        }

        task.lease_expires_at = Some(now + lease_ttl);
        Ok(true)
    }

    async fn release_claim(
        &self,
        task_id: &TaskId,
        occurrence_id: &OccurrenceId,
        new_status: TaskStatus,
    ) -> StoreResult<bool> {
        let mut guard = self
            .tasks
            .write()
            .map_err(|_| StoreError::Backend("tasks lock poisoned".to_string()))?;
        let task = guard
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {} not found", task_id)))?;

        if task.claimed_by.as_ref() != Some(occurrence_id) {
            return Ok(false);
        }

        task.claimed_by = None;
        task.lease_expires_at = None;
        task.status = new_status;
        Ok(true)
    }
}

#[async_trait]
impl ThoughtStore for InMemoryStore {
    async fn put_thought(&self, thought: Thought) -> StoreResult<()> {
        let mut guard = self
            .thoughts
            .write()
            .map_err(|_| StoreError::Backend("thoughts lock poisoned".to_string()))?;
        if guard.contains_key(&thought.id) {
            return Err(StoreError::Conflict(format!(
                "thought {} already exists",
                thought.id
            )));
        }
        guard.insert(thought.id.clone(), thought);
        Ok(())
    }

    async fn get_thought(&self, thought_id: &ThoughtId) -> StoreResult<Option<Thought>> {
        let guard = self
            .thoughts
            .read()
            .map_err(|_| StoreError::Backend("thoughts lock poisoned".to_string()))?;
        Ok(guard.get(thought_id).cloned())
    }

    async fn update_thought(&self, thought: Thought) -> StoreResult<()> {
        let mut guard = self
            .thoughts
            .write()
            .map_err(|_| StoreError::Backend("thoughts lock poisoned".to_string()))?;
        if !guard.contains_key(&thought.id) {
            return Err(StoreError::NotFound(format!(
                "thought {} not found",
                thought.id
            )));
        }
        guard.insert(thought.id.clone(), thought);
        Ok(())
    }

    async fn list_thoughts_for_task(&self, task_id: &TaskId) -> StoreResult<Vec<Thought>> {
        let guard = self
            .thoughts
            .read()
            .map_err(|_| StoreError::Backend("thoughts lock poisoned".to_string()))?;
        let mut thoughts: Vec<Thought> = guard
            .values()
            .filter(|t| &t.task_id == task_id)
            .cloned()
            .collect();
        thoughts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(thoughts)
    }
}

#[async_trait]
impl AuditStore for InMemoryStore {
    async fn append_entry(&self, entry: AuditEntry) -> StoreResult<u64> {
        let mut guard = self
            .audit
            .write()
            .map_err(|_| StoreError::Backend("audit lock poisoned".to_string()))?;

        let expected_sequence = guard.len() as u64 + 1;
        if entry.sequence != expected_sequence {
            return Err(StoreError::Conflict(format!(
                "audit append out of order: expected sequence {expected_sequence}, got {}",
                entry.sequence
            )));
        }

        let head_hash = guard.last().map(|e| e.content_hash.as_str());
        if entry.previous_hash.as_deref() != head_hash {
            return Err(StoreError::Conflict(format!(
                "audit append not linked to head: expected previous {:?}, got {:?}",
                head_hash, entry.previous_hash
            )));
        }

        let sequence = entry.sequence;
        guard.push(entry);
        Ok(sequence)
    }

    async fn head(&self) -> StoreResult<Option<(u64, String)>> {
        let guard = self
            .audit
            .read()
            .map_err(|_| StoreError::Backend("audit lock poisoned".to_string()))?;
        Ok(guard.last().map(|e| (e.sequence, e.content_hash.clone())))
    }

    async fn read_range(&self, seq_from: u64, seq_to: u64) -> StoreResult<Vec<AuditEntry>> {
        if seq_from == 0 || seq_to < seq_from {
            return Err(StoreError::InvalidInput(format!(
                "invalid audit range {seq_from}..{seq_to}"
            )));
        }
        let guard = self
            .audit
            .read()
            .map_err(|_| StoreError::Backend("audit lock poisoned".to_string()))?;
        Ok(guard
            .iter()
            .filter(|e| e.sequence >= seq_from && e.sequence <= seq_to)
            .cloned()
            .collect())
    }
}
