//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`JobSignal`]s. It is
//! designed to be shared via `Arc<EventBus>` between the worker pool,
//! webhook ingest, and status streams.

use chrono::{DateTime, Utc};
use coursecast_core::types::JobId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Signal names
// ---------------------------------------------------------------------------

/// Job was enqueued (initially or for a retry).
pub const SIGNAL_JOB_QUEUED: &str = "job.queued";

/// A worker took ownership of the job.
pub const SIGNAL_JOB_PROCESSING: &str = "job.processing";

/// Progress estimate advanced.
pub const SIGNAL_JOB_PROGRESS: &str = "job.progress";

/// Job completed successfully.
pub const SIGNAL_JOB_COMPLETED: &str = "job.completed";

/// Job failed terminally.
pub const SIGNAL_JOB_FAILED: &str = "job.failed";

/// Job was cancelled.
pub const SIGNAL_JOB_CANCELLED: &str = "job.cancelled";

// ---------------------------------------------------------------------------
// JobSignal
// ---------------------------------------------------------------------------

/// A change notification for a single job.
///
/// Signals carry no authoritative state: receivers re-read the store,
/// which stays the single source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSignal {
    /// Dot-separated signal name, e.g. [`SIGNAL_JOB_COMPLETED`].
    pub signal: String,

    /// The job the signal refers to.
    pub job_id: JobId,

    /// Free-form JSON payload carrying signal-specific data.
    pub payload: serde_json::Value,

    /// When the signal was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl JobSignal {
    /// Create a signal with an empty payload.
    pub fn new(signal: impl Into<String>, job_id: JobId) -> Self {
        Self {
            signal: signal.into(),
            job_id,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    /// Set the JSON payload for the signal.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus for [`JobSignal`]s.
///
/// Wraps a [`broadcast::Sender`] so any number of subscribers can
/// independently receive every published signal.
pub struct EventBus {
    sender: broadcast::Sender<JobSignal>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest un-consumed messages are
    /// dropped and slow receivers observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a signal to all current subscribers.
    ///
    /// With zero subscribers the signal is silently dropped; the store
    /// remains authoritative, so nothing is lost.
    pub fn publish(&self, signal: JobSignal) {
        // A SendError only means there are zero receivers right now.
        let _ = self.sender.send(signal);
    }

    /// Subscribe to all signals published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<JobSignal> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
