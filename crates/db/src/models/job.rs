//! Job entity model and the client-facing status read model.

use coursecast_core::request::GenerationParams;
use coursecast_core::status::JobStatus;
use coursecast_core::types::{JobId, Timestamp};
use serde::Serialize;

/// One request to generate a video for a content unit.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// Caller-assigned identifier, unique, doubles as the idempotency key.
    pub id: JobId,
    /// Opaque reference to the content unit (e.g. a chapter id).
    pub owner_ref: String,
    /// Validated generation parameters.
    pub params: GenerationParams,
    pub status: JobStatus,
    /// 0..=100; monotonically non-decreasing while the job is live.
    pub progress: i16,
    /// Provider-assigned id; set at most once, never changed afterwards.
    pub provider_job_id: Option<String>,
    /// Set if and only if `status == Completed`.
    pub result_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl Job {
    /// Project into the client-facing status read model.
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            status: self.status,
            progress: self.progress,
            result_url: self.result_url.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
            duration_seconds: self.duration_seconds,
            error: self.error_message.clone(),
            error_code: self.error_code.clone(),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Fields required to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub owner_ref: String,
    pub params: GenerationParams,
    pub max_retries: i32,
}

/// Default retry budget for a new job.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

impl NewJob {
    /// Create a job description with the default retry budget.
    pub fn new(id: JobId, owner_ref: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            id,
            owner_ref: owner_ref.into(),
            params,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// What a status reader (dashboard client) sees for one job.
///
/// Transient internal errors are invisible here except through
/// `retry_count` increasing and `progress` not advancing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub progress: i16,
    pub result_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_seconds: Option<f64>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}
