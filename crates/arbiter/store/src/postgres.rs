//! PostgreSQL adapter for Arbiter storage.
//!
//! Transactional source-of-truth backend. Claim, renewal and release are
//! single conditional UPDATE statements, so the at-most-one-live-claim
//! invariant holds across processes without any other coordination.

use crate::traits::{AuditStore, TaskStore, ThoughtStore};
use crate::{StoreError, StoreResult};
use arbiter_types::{
    AuditEntry, OccurrenceId, Priority, Task, TaskId, TaskStatus, Thought, ThoughtId,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS arbiter_tasks (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                priority INT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                claimed_by TEXT,
                lease_expires_at TIMESTAMPTZ,
                channel_id TEXT,
                retry_count BIGINT NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS arbiter_thoughts (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                record JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS arbiter_audit_entries (
                sequence BIGINT PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                content_hash TEXT NOT NULL,
                previous_hash TEXT,
                entry JSONB NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_arbiter_thoughts_task ON arbiter_thoughts (task_id)",
            "CREATE INDEX IF NOT EXISTS idx_arbiter_tasks_status ON arbiter_tasks (status, priority)",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

fn status_to_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Queued => "queued",
        TaskStatus::Claimed => "claimed",
        TaskStatus::Active => "active",
        TaskStatus::Completed => "completed",
        TaskStatus::Deferred => "deferred",
        TaskStatus::Failed => "failed",
    }
}

fn status_from_str(value: &str) -> StoreResult<TaskStatus> {
    match value {
        "queued" => Ok(TaskStatus::Queued),
        "claimed" => Ok(TaskStatus::Claimed),
        "active" => Ok(TaskStatus::Active),
        "completed" => Ok(TaskStatus::Completed),
        "deferred" => Ok(TaskStatus::Deferred),
        "failed" => Ok(TaskStatus::Failed),
        other => Err(StoreError::Serialization(format!(
            "unknown task status: {other}"
        ))),
    }
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> StoreResult<Task> {
    let status: String = row
        .try_get("status")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let priority: i32 = row
        .try_get("priority")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let retry_count: i64 = row
        .try_get("retry_count")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let id: String = row
        .try_get("id")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let claimed_by: Option<String> = row
        .try_get("claimed_by")
        .map_err(|e| StoreError::Backend(e.to_string()))?;

    Ok(Task {
        id: TaskId::new(id),
        description: row
            .try_get("description")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        priority: Priority::new(priority.clamp(0, Priority::MAX as i32) as u8),
        status: status_from_str(&status)?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        claimed_by: claimed_by.map(OccurrenceId::new),
        lease_expires_at: row
            .try_get("lease_expires_at")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        channel_id: row
            .try_get("channel_id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        retry_count: retry_count.max(0) as u32,
    })
}

#[async_trait]
impl TaskStore for PostgresStore {
    async fn put_task(&self, task: Task) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO arbiter_tasks
                (id, description, priority, status, created_at, claimed_by, lease_expires_at, channel_id, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(task.id.0.clone())
        .bind(task.description.clone())
        .bind(task.priority.value() as i32)
        .bind(status_to_str(task.status))
        .bind(task.created_at)
        .bind(task.claimed_by.as_ref().map(|o| o.0.clone()))
        .bind(task.lease_expires_at)
        .bind(task.channel_id.clone())
        .bind(task.retry_count as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> StoreResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM arbiter_tasks WHERE id = $1")
            .bind(task_id.0.clone())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn update_task(&self, task: Task) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE arbiter_tasks
            SET description = $2, priority = $3, status = $4, claimed_by = $5,
                lease_expires_at = $6, channel_id = $7, retry_count = $8
            WHERE id = $1
            "#,
        )
        .bind(task.id.0.clone())
        .bind(task.description.clone())
        .bind(task.priority.value() as i32)
        .bind(status_to_str(task.status))
        .bind(task.claimed_by.as_ref().map(|o| o.0.clone()))
        .bind(task.lease_expires_at)
        .bind(task.channel_id.clone())
        .bind(task.retry_count as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("task {} not found", task.id)));
        }
        Ok(())
    }

    async fn list_claimable(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM arbiter_tasks
            WHERE status = 'queued'
               OR (status IN ('claimed', 'active')
                   AND (claimed_by IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= $1))
            ORDER BY priority DESC, created_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.iter().map(row_to_task).collect()
    }

    async fn claim_if_unclaimed(
        &self,
        task_id: &TaskId,
        occurrence_id: &OccurrenceId,
        lease_ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE arbiter_tasks
            SET claimed_by = $2, lease_expires_at = $3, status = 'claimed'
            WHERE id = $1
              AND (status = 'queued'
                   OR (status IN ('claimed', 'active')
                       AND (claimed_by IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= $4)))
            "#,
        )
        .bind(task_id.0.clone())
        .bind(occurrence_id.0.clone())
        .bind(now + lease_ttl)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew_lease(
        &self,
        task_id: &TaskId,
        occurrence_id: &OccurrenceId,
        lease_ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE arbiter_tasks
            SET lease_expires_at = $3
            WHERE id = $1 AND claimed_by = $2 AND lease_expires_at > $4
            "#,
        )
        .bind(task_id.0.clone())
        .bind(occurrence_id.0.clone())
        .bind(now + lease_ttl)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(
        &self,
        task_id: &TaskId,
        occurrence_id: &OccurrenceId,
        new_status: TaskStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE arbiter_tasks
            SET claimed_by = NULL, lease_expires_at = NULL, status = $3
            WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(task_id.0.clone())
        .bind(occurrence_id.0.clone())
        .bind(status_to_str(new_status))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl ThoughtStore for PostgresStore {
    async fn put_thought(&self, thought: Thought) -> StoreResult<()> {
        let record = serde_json::to_value(&thought)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO arbiter_thoughts (id, task_id, created_at, record)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(thought.id.0.clone())
        .bind(thought.task_id.0.clone())
        .bind(thought.created_at)
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "thought {} already exists",
                thought.id
            )));
        }
        Ok(())
    }

    async fn get_thought(&self, thought_id: &ThoughtId) -> StoreResult<Option<Thought>> {
        let row = sqlx::query("SELECT record FROM arbiter_thoughts WHERE id = $1")
            .bind(thought_id.0.clone())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        row.map(|row| {
            let record: serde_json::Value = row
                .try_get("record")
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            serde_json::from_value(record).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn update_thought(&self, thought: Thought) -> StoreResult<()> {
        let record = serde_json::to_value(&thought)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = sqlx::query("UPDATE arbiter_thoughts SET record = $2 WHERE id = $1")
            .bind(thought.id.0.clone())
            .bind(record)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "thought {} not found",
                thought.id
            )));
        }
        Ok(())
    }

    async fn list_thoughts_for_task(&self, task_id: &TaskId) -> StoreResult<Vec<Thought>> {
        let rows = sqlx::query(
            "SELECT record FROM arbiter_thoughts WHERE task_id = $1 ORDER BY created_at ASC",
        )
        .bind(task_id.0.clone())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let record: serde_json::Value = row
                    .try_get("record")
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                serde_json::from_value(record)
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl AuditStore for PostgresStore {
    async fn append_entry(&self, entry: AuditEntry) -> StoreResult<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query("LOCK TABLE arbiter_audit_entries IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let head = sqlx::query(
            "SELECT sequence, content_hash FROM arbiter_audit_entries ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let (expected_sequence, head_hash) = match head {
            Some(row) => {
                let seq: i64 = row
                    .try_get("sequence")
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                let hash: String = row
                    .try_get("content_hash")
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                (seq as u64 + 1, Some(hash))
            }
            None => (1, None),
        };

        if entry.sequence != expected_sequence {
            return Err(StoreError::Conflict(format!(
                "audit append out of order: expected sequence {expected_sequence}, got {}",
                entry.sequence
            )));
        }
        if entry.previous_hash != head_hash {
            return Err(StoreError::Conflict(format!(
                "audit append not linked to head: expected previous {:?}, got {:?}",
                head_hash, entry.previous_hash
            )));
        }

        let record =
            serde_json::to_value(&entry).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO arbiter_audit_entries (sequence, timestamp, content_hash, previous_hash, entry)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.sequence as i64)
        .bind(entry.timestamp)
        .bind(entry.content_hash.clone())
        .bind(entry.previous_hash.clone())
        .bind(record)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(entry.sequence)
    }

    async fn head(&self) -> StoreResult<Option<(u64, String)>> {
        let row = sqlx::query(
            "SELECT sequence, content_hash FROM arbiter_audit_entries ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        row.map(|row| {
            let seq: i64 = row
                .try_get("sequence")
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let hash: String = row
                .try_get("content_hash")
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok((seq as u64, hash))
        })
        .transpose()
    }

    async fn read_range(&self, seq_from: u64, seq_to: u64) -> StoreResult<Vec<AuditEntry>> {
        if seq_from == 0 || seq_to < seq_from {
            return Err(StoreError::InvalidInput(format!(
                "invalid audit range {seq_from}..{seq_to}"
            )));
        }
        let rows = sqlx::query(
            "SELECT entry FROM arbiter_audit_entries WHERE sequence >= $1 AND sequence <= $2 ORDER BY sequence ASC",
        )
        .bind(seq_from as i64)
        .bind(seq_to as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let entry: serde_json::Value = row
                    .try_get("entry")
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                serde_json::from_value(entry).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}
