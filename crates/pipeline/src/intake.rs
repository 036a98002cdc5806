//! Client-facing job intake and cancellation.

use std::sync::Arc;

use coursecast_core::request::GenerationParams;
use coursecast_core::status::JobEventType;
use coursecast_core::types::JobId;
use coursecast_db::models::{Job, NewJob, NewJobEvent};
use coursecast_db::store::{CompletionUpdate, JobStore, TransitionOutcome, WorkQueue};
use coursecast_events::bus::{EventBus, JobSignal, SIGNAL_JOB_CANCELLED, SIGNAL_JOB_QUEUED};

use crate::config::PipelineConfig;
use crate::error::PipelineError;

/// Creates jobs and feeds them into the work queue.
pub struct JobIntake {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    bus: Arc<EventBus>,
    max_retries: i32,
}

impl JobIntake {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        bus: Arc<EventBus>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            max_retries: config.max_retries,
        }
    }

    /// Validate, persist, and enqueue a new generation job.
    ///
    /// Invalid parameters are rejected before any side effect. A job id
    /// that is already in use fails with
    /// [`PipelineError::DuplicateJob`], signalling the caller to read
    /// the existing job instead.
    pub async fn submit(
        &self,
        id: JobId,
        owner_ref: &str,
        params: GenerationParams,
    ) -> Result<Job, PipelineError> {
        params.check()?;

        let job = self
            .store
            .create_job(NewJob::new(id, owner_ref, params).with_max_retries(self.max_retries))
            .await?;
        self.store
            .append_event(NewJobEvent::new(
                job.id.clone(),
                JobEventType::Created,
                "Job created",
            ))
            .await?;

        // Audit before the entry becomes leasable: a worker may pick the
        // job up the instant enqueue returns.
        self.store
            .append_event(NewJobEvent::new(
                job.id.clone(),
                JobEventType::Queued,
                "Job enqueued",
            ))
            .await?;
        self.queue.enqueue(&job.id, self.max_retries).await?;
        self.bus
            .publish(JobSignal::new(SIGNAL_JOB_QUEUED, job.id.clone()));

        tracing::info!(job_id = %job.id, owner_ref, "Job submitted");
        Ok(job)
    }

    /// Cancel a job if it has not reached a terminal state.
    ///
    /// Returns `true` if the job was cancelled, `false` if it was
    /// already completed, failed, or cancelled. Workers observe the
    /// cancellation at their next state-machine step.
    pub async fn cancel(&self, id: &JobId) -> Result<bool, PipelineError> {
        match self
            .store
            .try_complete(id, CompletionUpdate::cancelled())
            .await?
        {
            TransitionOutcome::Applied(_) => {
                self.queue.remove(id).await?;
                self.store
                    .append_event(NewJobEvent::new(
                        id.clone(),
                        JobEventType::Cancelled,
                        "Job cancelled",
                    ))
                    .await?;
                self.bus
                    .publish(JobSignal::new(SIGNAL_JOB_CANCELLED, id.clone()));
                tracing::info!(job_id = %id, "Job cancelled");
                Ok(true)
            }
            TransitionOutcome::Ignored(status) => {
                tracing::debug!(
                    job_id = %id,
                    status = status.as_str(),
                    "Cancel ignored, job already terminal",
                );
                Ok(false)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use coursecast_core::status::JobStatus;
    use coursecast_db::memory::MemoryStore;

    fn params() -> GenerationParams {
        GenerationParams {
            script: "hello".into(),
            avatar_id: "a1".into(),
            voice_id: None,
            target_duration_secs: None,
        }
    }

    fn intake(store: &Arc<MemoryStore>) -> JobIntake {
        JobIntake::new(
            Arc::clone(store) as Arc<dyn JobStore>,
            Arc::clone(store) as Arc<dyn WorkQueue>,
            Arc::new(EventBus::default()),
            &PipelineConfig::default(),
        )
    }

    #[tokio::test]
    async fn submit_creates_pending_job_and_queue_entry() {
        let store = Arc::new(MemoryStore::new());
        let intake = intake(&store);

        let job = intake
            .submit(JobId::new("j1"), "chapter-9", params())
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.owner_ref, "chapter-9");
        assert_eq!(job.max_retries, 3);

        let entry = store.entry(&job.id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 0);

        let events = store.events_for_job(&job.id).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![JobEventType::Created, JobEventType::Queued]);
    }

    #[tokio::test]
    async fn invalid_params_are_rejected_without_side_effects() {
        let store = Arc::new(MemoryStore::new());
        let intake = intake(&store);

        let mut bad = params();
        bad.script = String::new();
        let err = intake
            .submit(JobId::new("j1"), "chapter-9", bad)
            .await
            .unwrap_err();
        assert_matches!(err, PipelineError::Core(_));

        assert!(store.get_job(&JobId::new("j1")).await.unwrap().is_none());
        assert!(store.entry(&JobId::new("j1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let intake = intake(&store);

        intake
            .submit(JobId::new("j1"), "chapter-9", params())
            .await
            .unwrap();
        let err = intake
            .submit(JobId::new("j1"), "chapter-9", params())
            .await
            .unwrap_err();
        assert_matches!(err, PipelineError::DuplicateJob(_));
    }

    #[tokio::test]
    async fn cancel_removes_entry_and_records_event() {
        let store = Arc::new(MemoryStore::new());
        let intake = intake(&store);
        let job = intake
            .submit(JobId::new("j1"), "chapter-9", params())
            .await
            .unwrap();

        assert!(intake.cancel(&job.id).await.unwrap());

        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(store.entry(&job.id).await.unwrap().is_none());

        let events = store.events_for_job(&job.id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == JobEventType::Cancelled));
    }

    #[tokio::test]
    async fn cancel_of_terminal_job_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let intake = intake(&store);
        let job = intake
            .submit(JobId::new("j1"), "chapter-9", params())
            .await
            .unwrap();

        assert!(intake.cancel(&job.id).await.unwrap());
        // Second cancel: already terminal.
        assert!(!intake.cancel(&job.id).await.unwrap());
    }
}
