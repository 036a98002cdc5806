//! Job lifecycle status and audit event types.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a generation job.
///
/// Transitions are linearized by the single-owner queue lease; terminal
/// statuses are immutable except for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue for a worker lease.
    Pending,
    /// Owned by a worker; submitted to or awaiting the provider.
    Processing,
    /// Provider finished; the artifact is being published to storage.
    Publishing,
    /// Finished successfully; `result_url` is set.
    Completed,
    /// Retries exhausted. No further leases.
    Failed,
    /// Explicitly cancelled before reaching a terminal outcome.
    Cancelled,
}

impl JobStatus {
    /// String representation for database storage and the read model.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Publishing => "publishing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the storage representation back into the enum.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "publishing" => Some(JobStatus::Publishing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether this status permits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// JobEventType
// ---------------------------------------------------------------------------

/// Kind of an append-only audit trail entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    /// Job record created.
    Created,
    /// Job enqueued (initially or on retry).
    Queued,
    /// A worker took ownership and began execution.
    Processing,
    /// The reconciliation poller observed a provider status.
    Polling,
    /// Publishing the artifact failed; the job completed with the
    /// provider URL as a degraded fallback.
    PublishError,
    /// Job reached COMPLETED.
    Completed,
    /// Job reached FAILED.
    Failed,
    /// Job reached CANCELLED.
    Cancelled,
}

impl JobEventType {
    /// String representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::Created => "created",
            JobEventType::Queued => "queued",
            JobEventType::Processing => "processing",
            JobEventType::Polling => "polling",
            JobEventType::PublishError => "publish_error",
            JobEventType::Completed => "completed",
            JobEventType::Failed => "failed",
            JobEventType::Cancelled => "cancelled",
        }
    }

    /// Parse the storage representation back into the enum.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(JobEventType::Created),
            "queued" => Some(JobEventType::Queued),
            "processing" => Some(JobEventType::Processing),
            "polling" => Some(JobEventType::Polling),
            "publish_error" => Some(JobEventType::PublishError),
            "completed" => Some(JobEventType::Completed),
            "failed" => Some(JobEventType::Failed),
            "cancelled" => Some(JobEventType::Cancelled),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Publishing.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Publishing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn event_type_round_trips_through_str() {
        for kind in [
            JobEventType::Created,
            JobEventType::Queued,
            JobEventType::Processing,
            JobEventType::Polling,
            JobEventType::PublishError,
            JobEventType::Completed,
            JobEventType::Failed,
            JobEventType::Cancelled,
        ] {
            assert_eq!(JobEventType::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }
}
