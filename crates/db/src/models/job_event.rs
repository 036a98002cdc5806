//! Append-only audit trail entries for a job.

use coursecast_core::status::JobEventType;
use coursecast_core::types::{JobId, Timestamp};
use serde::Serialize;

/// One audit trail entry. Never mutated or deleted; strictly ordered by
/// `id` (append sequence) within a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    /// Monotonic append sequence, unique across all jobs.
    pub id: i64,
    pub job_id: JobId,
    pub event_type: JobEventType,
    pub message: String,
    /// Structured context (attempt numbers, provider status, delays).
    pub metadata: serde_json::Value,
    pub created_at: Timestamp,
}

/// Fields required to append an audit entry.
#[derive(Debug, Clone)]
pub struct NewJobEvent {
    pub job_id: JobId,
    pub event_type: JobEventType,
    pub message: String,
    pub metadata: serde_json::Value,
}

impl NewJobEvent {
    /// Create an entry with an empty metadata object.
    pub fn new(job_id: JobId, event_type: JobEventType, message: impl Into<String>) -> Self {
        Self {
            job_id,
            event_type,
            message: message.into(),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    /// Attach structured metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
