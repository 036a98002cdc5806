//! Pipeline error taxonomy.
//!
//! Job-lifecycle errors never cross the worker pool boundary: they are
//! captured as job events and `error_message`/`error_code` fields, and
//! callers observe them through status reads. The variants here surface
//! only from the client-facing intake/cancel/webhook entry points.

use coursecast_core::error::CoreError;
use coursecast_core::types::JobId;
use coursecast_db::store::StoreError;
use coursecast_provider::error::{ProviderError, PublishError};

/// Errors surfaced by the pipeline's public operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Domain validation or lookup failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A live job already exists for this idempotency key; the caller
    /// should use the existing job.
    #[error("a live job already exists for id {0}")]
    DuplicateJob(JobId),

    /// Storage failure.
    #[error(transparent)]
    Store(StoreError),

    /// Provider call failure (retried internally via backoff).
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Artifact publishing failure (non-fatal; logged).
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// The reconciliation poller exhausted its budget. Treated as a
    /// transient failure eligible for retry.
    #[error("polling budget exhausted for job {0}")]
    PollingTimeout(JobId),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateJob(id) => PipelineError::DuplicateJob(id),
            other => PipelineError::Store(other),
        }
    }
}
