//! Storage traits consumed by the pipeline.
//!
//! [`JobStore`] is the single source of truth for job state; every
//! status transition goes through a conditional update so that workers,
//! the reconciliation poller, and webhook ingest can race safely.
//! [`WorkQueue`] provides at-least-once delivery with exponential
//! backoff; consumers must be idempotent.

use std::time::Duration;

use async_trait::async_trait;
use coursecast_core::status::JobStatus;
use coursecast_core::types::{JobId, Timestamp, WorkerId};

use crate::models::{Job, JobEvent, NewJob, NewJobEvent, QueueEntry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from either storage trait.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced job does not exist.
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// A live (non-terminal) job or queue entry already uses this id.
    #[error("a live job already exists for idempotency key {0}")]
    DuplicateJob(JobId),

    /// `provider_job_id` is write-once and was already set.
    #[error("provider job id already set for job {0}")]
    ProviderIdAlreadySet(JobId),

    /// A row could not be decoded into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The underlying database failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// Transition types
// ---------------------------------------------------------------------------

/// Result of a conditional status update.
///
/// `Ignored` carries the status that was actually observed, letting a
/// losing racer distinguish "already terminal" from "someone else owns
/// this step".
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The update applied; the returned job reflects the new state.
    Applied(Job),
    /// The guard did not match; nothing changed.
    Ignored(JobStatus),
}

impl TransitionOutcome {
    /// Whether the update applied.
    pub fn applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

/// Final fields written together with a terminal status.
#[derive(Debug, Clone)]
pub struct CompletionUpdate {
    pub status: JobStatus,
    pub result_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
}

impl CompletionUpdate {
    /// Successful completion with the final artifact location.
    pub fn completed(
        result_url: impl Into<String>,
        thumbnail_url: Option<String>,
        duration_seconds: Option<f64>,
    ) -> Self {
        Self {
            status: JobStatus::Completed,
            result_url: Some(result_url.into()),
            thumbnail_url,
            duration_seconds,
            error_message: None,
            error_code: None,
        }
    }

    /// Terminal failure with a message and machine-readable code.
    pub fn failed(error_message: impl Into<String>, error_code: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            result_url: None,
            thumbnail_url: None,
            duration_seconds: None,
            error_message: Some(error_message.into()),
            error_code: Some(error_code.into()),
        }
    }

    /// Explicit cancellation.
    pub fn cancelled() -> Self {
        Self {
            status: JobStatus::Cancelled,
            result_url: None,
            thumbnail_url: None,
            duration_seconds: None,
            error_message: None,
            error_code: None,
        }
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// Durable persistence for job records and their audit trail.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a new PENDING job. Fails with [`StoreError::DuplicateJob`]
    /// when the id is already taken.
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError>;

    /// Fetch a job by id.
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Fetch a job by the provider-assigned id (webhook correlation).
    async fn find_by_provider_job_id(
        &self,
        provider_job_id: &str,
    ) -> Result<Option<Job>, StoreError>;

    /// Compare-and-swap the status from `from` to `to`.
    ///
    /// Applies only when the current status equals `from` and is not
    /// terminal. This is the primitive that linearizes transitions
    /// between racing observers.
    async fn try_transition(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Move the job into a terminal status with its final fields.
    ///
    /// Applies only when the current status is non-terminal; a completed
    /// update also pins `progress` to 100 and stamps `completed_at`.
    async fn try_complete(
        &self,
        id: &JobId,
        update: CompletionUpdate,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Schedule a retry: compare-and-swap PROCESSING back to PENDING and
    /// clear `provider_job_id` in the same atomic step.
    ///
    /// A retried attempt re-submits to the provider, so the id from the
    /// failed attempt must not linger (webhooks for it are stale).
    async fn reset_for_retry(&self, id: &JobId) -> Result<TransitionOutcome, StoreError>;

    /// Record the provider-assigned id. Write-once: a second call with a
    /// different value fails with [`StoreError::ProviderIdAlreadySet`].
    async fn set_provider_job_id(
        &self,
        id: &JobId,
        provider_job_id: &str,
    ) -> Result<(), StoreError>;

    /// Stamp `started_at` if it is not already set.
    async fn mark_started(&self, id: &JobId) -> Result<(), StoreError>;

    /// Raise `progress`. Monotonic: a lower value is ignored.
    async fn update_progress(&self, id: &JobId, progress: i16) -> Result<(), StoreError>;

    /// Record a retry: increments `retry_count` (clamped to
    /// `max_retries`) and stores the triggering error.
    async fn record_retry(
        &self,
        id: &JobId,
        error_message: &str,
        error_code: &str,
    ) -> Result<Job, StoreError>;

    /// Append an audit trail entry.
    async fn append_event(&self, event: NewJobEvent) -> Result<(), StoreError>;

    /// All audit entries for a job, ordered by append sequence.
    async fn events_for_job(&self, id: &JobId) -> Result<Vec<JobEvent>, StoreError>;
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

/// A successful lease: time-bounded exclusive ownership of one entry.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job_id: JobId,
    /// Nack count at lease time (0 on first delivery).
    pub attempts: i32,
    pub lock_expires_at: Timestamp,
}

/// Result of a nack.
#[derive(Debug, Clone)]
pub enum NackOutcome {
    /// The entry was rescheduled with backoff.
    Retried {
        /// Nack count after this failure (1-based).
        attempts: i32,
        /// When the entry becomes leasable again.
        next_run_at: Timestamp,
    },
    /// The attempt budget is exhausted; the entry will never be leased
    /// again. The caller is responsible for failing the job and acking.
    DeadLettered {
        attempts: i32,
    },
}

/// Durable, at-least-once work queue with per-job retry scheduling.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Create a ready entry for the job. Fails with
    /// [`StoreError::DuplicateJob`] when a live entry already exists.
    async fn enqueue(&self, job_id: &JobId, max_attempts: i32) -> Result<(), StoreError>;

    /// Atomically lease one ready entry, or `None` when nothing is due.
    ///
    /// The selection and lock stamp happen in a single atomic
    /// read-modify-write so two workers can never hold live leases on
    /// the same entry.
    async fn lease(
        &self,
        worker: &WorkerId,
        visibility_timeout: Duration,
    ) -> Result<Option<Lease>, StoreError>;

    /// Remove the entry. Called once the job is terminal.
    async fn ack(&self, job_id: &JobId) -> Result<(), StoreError>;

    /// Report a failed attempt: reschedules with exponential backoff or
    /// dead-letters when the budget is spent. Clears the lock either way.
    async fn nack(&self, job_id: &JobId, error: &str) -> Result<NackOutcome, StoreError>;

    /// Remove the entry outside the ack path (explicit cancellation).
    /// Returns whether an entry existed.
    async fn remove(&self, job_id: &JobId) -> Result<bool, StoreError>;

    /// Inspect the entry for a job, if present.
    async fn entry(&self, job_id: &JobId) -> Result<Option<QueueEntry>, StoreError>;
}
