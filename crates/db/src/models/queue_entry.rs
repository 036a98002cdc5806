//! Scheduling record owned by the work queue.

use coursecast_core::types::{JobId, Timestamp, WorkerId};

/// One schedulable unit wrapping a job reference.
///
/// Created on enqueue; removed on terminal ack or explicit cancellation.
/// `locked_by`/`lock_expires_at` give crash-safe single ownership: an
/// expired lock makes the entry leasable again.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job_id: JobId,
    /// Number of times the entry has been nacked.
    pub attempts: i32,
    /// Nacking past this bound dead-letters the entry.
    pub max_attempts: i32,
    /// Earliest instant the entry may be leased (backoff scheduling).
    pub next_run_at: Timestamp,
    pub locked_by: Option<WorkerId>,
    pub lock_expires_at: Option<Timestamp>,
    /// Dead-lettered entries are never leased again.
    pub dead_lettered: bool,
    pub enqueued_at: Timestamp,
}

impl QueueEntry {
    /// Whether the entry may be handed to a worker at `now`.
    pub fn is_ready(&self, now: Timestamp) -> bool {
        if self.dead_lettered || self.next_run_at > now {
            return false;
        }
        match self.lock_expires_at {
            Some(expires) => expires <= now,
            None => true,
        }
    }
}
