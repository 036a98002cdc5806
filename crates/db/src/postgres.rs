//! PostgreSQL-backed store and queue.
//!
//! Every guarded mutation is a single conditional `UPDATE`, and leasing
//! uses `FOR UPDATE SKIP LOCKED`, so multiple worker processes can share
//! one database without double-leasing or lost updates.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use coursecast_core::backoff::RetryPolicy;
use coursecast_core::status::{JobEventType, JobStatus};
use coursecast_core::types::{JobId, Timestamp, WorkerId};
use sqlx::{FromRow, PgPool};

use crate::models::{Job, JobEvent, NewJob, NewJobEvent, QueueEntry};
use crate::store::{
    CompletionUpdate, JobStore, Lease, NackOutcome, StoreError, TransitionOutcome, WorkQueue,
};

/// Column list for `jobs` queries.
const JOB_COLUMNS: &str = "\
    id, owner_ref, params, status, progress, provider_job_id, \
    result_url, thumbnail_url, duration_seconds, \
    error_message, error_code, retry_count, max_retries, \
    created_at, started_at, completed_at";

/// Column list for `queue_entries` queries.
const QUEUE_COLUMNS: &str = "\
    job_id, attempts, max_attempts, next_run_at, \
    locked_by, lock_expires_at, dead_lettered, enqueued_at";

/// Terminal status literals, as stored.
const TERMINAL: [&str; 3] = ["completed", "failed", "cancelled"];

/// PostgreSQL [`JobStore`] + [`WorkQueue`].
pub struct PgStore {
    pool: PgPool,
    retry_policy: RetryPolicy,
}

impl PgStore {
    /// Create a store with the default 5 s / 5 min backoff policy.
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    /// Create a store with a custom backoff policy.
    pub fn with_retry_policy(pool: PgPool, retry_policy: RetryPolicy) -> Self {
        Self { pool, retry_policy }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct JobRow {
    id: String,
    owner_ref: String,
    params: serde_json::Value,
    status: String,
    progress: i16,
    provider_job_id: Option<String>,
    result_url: Option<String>,
    thumbnail_url: Option<String>,
    duration_seconds: Option<f64>,
    error_message: Option<String>,
    error_code: Option<String>,
    retry_count: i32,
    max_retries: i32,
    created_at: Timestamp,
    started_at: Option<Timestamp>,
    completed_at: Option<Timestamp>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job status '{}'", row.status)))?;
        let params = serde_json::from_value(row.params)
            .map_err(|e| StoreError::Corrupt(format!("bad params payload: {e}")))?;
        Ok(Job {
            id: JobId::new(row.id),
            owner_ref: row.owner_ref,
            params,
            status,
            progress: row.progress,
            provider_job_id: row.provider_job_id,
            result_url: row.result_url,
            thumbnail_url: row.thumbnail_url,
            duration_seconds: row.duration_seconds,
            error_message: row.error_message,
            error_code: row.error_code,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    id: i64,
    job_id: String,
    event_type: String,
    message: String,
    metadata: serde_json::Value,
    created_at: Timestamp,
}

impl TryFrom<EventRow> for JobEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let event_type = JobEventType::parse(&row.event_type).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown event type '{}'", row.event_type))
        })?;
        Ok(JobEvent {
            id: row.id,
            job_id: JobId::new(row.job_id),
            event_type,
            message: row.message,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct QueueRow {
    job_id: String,
    attempts: i32,
    max_attempts: i32,
    next_run_at: Timestamp,
    locked_by: Option<String>,
    lock_expires_at: Option<Timestamp>,
    dead_lettered: bool,
    enqueued_at: Timestamp,
}

impl From<QueueRow> for QueueEntry {
    fn from(row: QueueRow) -> Self {
        QueueEntry {
            job_id: JobId::new(row.job_id),
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            next_run_at: row.next_run_at,
            locked_by: row.locked_by.map(WorkerId::new),
            lock_expires_at: row.lock_expires_at,
            dead_lettered: row.dead_lettered,
            enqueued_at: row.enqueued_at,
        }
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        let params = serde_json::to_value(&new.params)
            .map_err(|e| StoreError::Corrupt(format!("unserializable params: {e}")))?;

        let query = format!(
            "INSERT INTO jobs (id, owner_ref, params, status, max_retries) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO NOTHING \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(new.id.as_str())
            .bind(&new.owner_ref)
            .bind(&params)
            .bind(JobStatus::Pending.as_str())
            .bind(new.max_retries)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(StoreError::DuplicateJob(new.id)),
        }
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn find_by_provider_job_id(
        &self,
        provider_job_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE provider_job_id = $1");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(provider_job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn try_transition(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<TransitionOutcome, StoreError> {
        let query = format!(
            "UPDATE jobs SET status = $3 \
             WHERE id = $1 AND status = $2 AND status NOT IN ($4, $5, $6) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id.as_str())
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(TERMINAL[0])
            .bind(TERMINAL[1])
            .bind(TERMINAL[2])
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(TransitionOutcome::Applied(row.try_into()?)),
            None => {
                let current = self
                    .get_job(id)
                    .await?
                    .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;
                Ok(TransitionOutcome::Ignored(current.status))
            }
        }
    }

    async fn try_complete(
        &self,
        id: &JobId,
        update: CompletionUpdate,
    ) -> Result<TransitionOutcome, StoreError> {
        let query = format!(
            "UPDATE jobs \
             SET status = $2, result_url = $3, thumbnail_url = $4, \
                 duration_seconds = $5, error_message = $6, error_code = $7, \
                 completed_at = NOW(), \
                 progress = CASE WHEN $2 = 'completed' THEN 100 ELSE progress END \
             WHERE id = $1 AND status NOT IN ($8, $9, $10) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id.as_str())
            .bind(update.status.as_str())
            .bind(&update.result_url)
            .bind(&update.thumbnail_url)
            .bind(update.duration_seconds)
            .bind(&update.error_message)
            .bind(&update.error_code)
            .bind(TERMINAL[0])
            .bind(TERMINAL[1])
            .bind(TERMINAL[2])
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(TransitionOutcome::Applied(row.try_into()?)),
            None => {
                let current = self
                    .get_job(id)
                    .await?
                    .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;
                Ok(TransitionOutcome::Ignored(current.status))
            }
        }
    }

    async fn reset_for_retry(&self, id: &JobId) -> Result<TransitionOutcome, StoreError> {
        let query = format!(
            "UPDATE jobs SET status = $2, provider_job_id = NULL \
             WHERE id = $1 AND status = $3 \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id.as_str())
            .bind(JobStatus::Pending.as_str())
            .bind(JobStatus::Processing.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(TransitionOutcome::Applied(row.try_into()?)),
            None => {
                let current = self
                    .get_job(id)
                    .await?
                    .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;
                Ok(TransitionOutcome::Ignored(current.status))
            }
        }
    }

    async fn set_provider_job_id(
        &self,
        id: &JobId,
        provider_job_id: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET provider_job_id = $2 \
             WHERE id = $1 AND (provider_job_id IS NULL OR provider_job_id = $2)",
        )
        .bind(id.as_str())
        .bind(provider_job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_job(id).await? {
            Some(_) => Err(StoreError::ProviderIdAlreadySet(id.clone())),
            None => Err(StoreError::JobNotFound(id.clone())),
        }
    }

    async fn mark_started(&self, id: &JobId) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET started_at = NOW() WHERE id = $1 AND started_at IS NULL")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_progress(&self, id: &JobId, progress: i16) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE jobs SET progress = GREATEST(progress, $2) \
             WHERE id = $1 AND status NOT IN ($3, $4, $5)",
        )
        .bind(id.as_str())
        .bind(progress)
        .bind(TERMINAL[0])
        .bind(TERMINAL[1])
        .bind(TERMINAL[2])
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_retry(
        &self,
        id: &JobId,
        error_message: &str,
        error_code: &str,
    ) -> Result<Job, StoreError> {
        let query = format!(
            "UPDATE jobs \
             SET retry_count = LEAST(retry_count + 1, max_retries), \
                 error_message = $2, error_code = $3 \
             WHERE id = $1 \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id.as_str())
            .bind(error_message)
            .bind(error_code)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;
        row.try_into()
    }

    async fn append_event(&self, event: NewJobEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO job_events (job_id, event_type, message, metadata) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(event.job_id.as_str())
        .bind(event.event_type.as_str())
        .bind(&event.message)
        .bind(&event.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_for_job(&self, id: &JobId) -> Result<Vec<JobEvent>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, job_id, event_type, message, metadata, created_at \
             FROM job_events WHERE job_id = $1 ORDER BY id ASC",
        )
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobEvent::try_from).collect()
    }
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkQueue for PgStore {
    async fn enqueue(&self, job_id: &JobId, max_attempts: i32) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO queue_entries (job_id, max_attempts, next_run_at) \
             VALUES ($1, $2, NOW()) \
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(job_id.as_str())
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateJob(job_id.clone()));
        }
        Ok(())
    }

    async fn lease(
        &self,
        worker: &WorkerId,
        visibility_timeout: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let expires = Utc::now()
            + chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        // Single atomic claim: SKIP LOCKED prevents double-leasing races
        // between concurrent workers.
        let query = format!(
            "UPDATE queue_entries \
             SET locked_by = $1, lock_expires_at = $2 \
             WHERE job_id = ( \
                 SELECT job_id FROM queue_entries \
                 WHERE dead_lettered = FALSE \
                   AND next_run_at <= NOW() \
                   AND (lock_expires_at IS NULL OR lock_expires_at <= NOW()) \
                 ORDER BY next_run_at ASC, enqueued_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {QUEUE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, QueueRow>(&query)
            .bind(worker.as_str())
            .bind(expires)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Lease {
            job_id: JobId::new(row.job_id),
            attempts: row.attempts,
            lock_expires_at: expires,
        }))
    }

    async fn ack(&self, job_id: &JobId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue_entries WHERE job_id = $1")
            .bind(job_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, job_id: &JobId, error: &str) -> Result<NackOutcome, StoreError> {
        let query = format!(
            "UPDATE queue_entries \
             SET attempts = attempts + 1, locked_by = NULL, lock_expires_at = NULL \
             WHERE job_id = $1 \
             RETURNING {QUEUE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, QueueRow>(&query)
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(job_id.clone()))?;

        if row.attempts > row.max_attempts {
            sqlx::query("UPDATE queue_entries SET dead_lettered = TRUE WHERE job_id = $1")
                .bind(job_id.as_str())
                .execute(&self.pool)
                .await?;
            tracing::warn!(
                job_id = %job_id,
                attempts = row.attempts,
                error,
                "Queue entry dead-lettered",
            );
            return Ok(NackOutcome::DeadLettered {
                attempts: row.attempts,
            });
        }

        let delay = self.retry_policy.delay_for_attempt(row.attempts as u32);
        let next_run_at = Utc::now()
            + chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        sqlx::query("UPDATE queue_entries SET next_run_at = $2 WHERE job_id = $1")
            .bind(job_id.as_str())
            .bind(next_run_at)
            .execute(&self.pool)
            .await?;

        Ok(NackOutcome::Retried {
            attempts: row.attempts,
            next_run_at,
        })
    }

    async fn remove(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM queue_entries WHERE job_id = $1")
            .bind(job_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn entry(&self, job_id: &JobId) -> Result<Option<QueueEntry>, StoreError> {
        let query = format!("SELECT {QUEUE_COLUMNS} FROM queue_entries WHERE job_id = $1");
        let row = sqlx::query_as::<_, QueueRow>(&query)
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(QueueEntry::from))
    }
}
