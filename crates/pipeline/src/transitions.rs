//! Guarded terminal transitions.
//!
//! Every path that can finish a job (worker poll loop, webhook ingest,
//! crash-recovery resume) funnels through the two services here, so a
//! webhook and the poller racing on the same outcome converge on exactly
//! one recorded transition instead of toggling state.

use std::sync::Arc;

use coursecast_core::error_codes;
use coursecast_core::status::{JobEventType, JobStatus};
use coursecast_core::types::JobId;
use coursecast_db::models::{Job, NewJobEvent};
use coursecast_db::store::{
    CompletionUpdate, JobStore, NackOutcome, TransitionOutcome, WorkQueue,
};
use coursecast_events::bus::{
    EventBus, JobSignal, SIGNAL_JOB_COMPLETED, SIGNAL_JOB_FAILED, SIGNAL_JOB_QUEUED,
};
use coursecast_provider::publisher::ArtifactPublisher;

use crate::error::PipelineError;

// ---------------------------------------------------------------------------
// Success path
// ---------------------------------------------------------------------------

/// Terminal success as observed from the provider.
#[derive(Debug, Clone)]
pub struct ProviderSuccess {
    /// Provider-hosted artifact URL; may expire, hence publishing.
    pub result_url: String,
    pub thumbnail_url: Option<String>,
    pub duration_seconds: Option<f64>,
}

/// Result of attempting a success completion.
#[derive(Debug)]
pub enum CompletionOutcome {
    /// This caller won the transition and the job is now COMPLETED.
    Completed(Job),
    /// Another observer already resolved the job; nothing was changed.
    AlreadyResolved(JobStatus),
}

/// Applies provider success: publish the artifact, then complete.
pub struct TerminalTransitions {
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn ArtifactPublisher>,
    bus: Arc<EventBus>,
}

impl TerminalTransitions {
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn ArtifactPublisher>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            publisher,
            bus,
        }
    }

    /// Attempt the PROCESSING → PUBLISHING → COMPLETED sequence.
    ///
    /// The PROCESSING → PUBLISHING swap is the race guard: the losing
    /// observer gets [`CompletionOutcome::AlreadyResolved`] and must
    /// no-op. `resume` lets the lease holder re-enter for a job found
    /// already in PUBLISHING (a previous owner crashed mid-publish).
    ///
    /// Publish failures are non-fatal: the job still completes with the
    /// provider URL as a degraded fallback, and the failure is recorded
    /// as a `publish_error` audit event.
    pub async fn complete_success(
        &self,
        job_id: &JobId,
        success: ProviderSuccess,
        resume: bool,
    ) -> Result<CompletionOutcome, PipelineError> {
        match self
            .store
            .try_transition(job_id, JobStatus::Processing, JobStatus::Publishing)
            .await?
        {
            TransitionOutcome::Applied(_) => {}
            TransitionOutcome::Ignored(JobStatus::Publishing) if resume => {}
            TransitionOutcome::Ignored(status) => {
                return Ok(CompletionOutcome::AlreadyResolved(status));
            }
        }

        let (result_url, thumbnail_url) = match self.publisher.publish(&success.result_url).await
        {
            Ok(artifact) => (
                artifact.permanent_url,
                artifact.thumbnail_url.or_else(|| success.thumbnail_url.clone()),
            ),
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    error = %e,
                    "Artifact publish failed, completing with provider URL",
                );
                self.store
                    .append_event(
                        NewJobEvent::new(
                            job_id.clone(),
                            JobEventType::PublishError,
                            format!("Publish failed: {e}"),
                        )
                        .with_metadata(serde_json::json!({
                            "error_code": error_codes::PUBLISH_FAILED,
                            "source_url": success.result_url.clone(),
                        })),
                    )
                    .await?;
                (success.result_url.clone(), success.thumbnail_url.clone())
            }
        };

        let update = CompletionUpdate::completed(
            result_url.clone(),
            thumbnail_url,
            success.duration_seconds,
        );
        match self.store.try_complete(job_id, update).await? {
            TransitionOutcome::Applied(job) => {
                self.store
                    .append_event(
                        NewJobEvent::new(
                            job_id.clone(),
                            JobEventType::Completed,
                            "Video generation completed",
                        )
                        .with_metadata(serde_json::json!({ "result_url": result_url })),
                    )
                    .await?;
                self.bus.publish(
                    JobSignal::new(SIGNAL_JOB_COMPLETED, job_id.clone())
                        .with_payload(serde_json::json!({ "result_url": job.result_url.clone() })),
                );
                tracing::info!(job_id = %job_id, "Job completed");
                Ok(CompletionOutcome::Completed(job))
            }
            TransitionOutcome::Ignored(status) => {
                Ok(CompletionOutcome::AlreadyResolved(status))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Failure path
// ---------------------------------------------------------------------------

/// Result of routing an attempt failure.
#[derive(Debug)]
pub enum FailureDisposition {
    /// The queue rescheduled the job with backoff.
    RetryScheduled {
        /// Nack count after this failure.
        attempts: i32,
    },
    /// The retry budget is spent; the job is now FAILED and dequeued.
    FailedTerminal,
    /// Another observer already moved the job on; nothing was changed.
    NotOwner(JobStatus),
}

/// Routes attempt failures into retry-with-backoff or terminal FAILED.
///
/// Both the worker pool and webhook ingest use this; the store CAS makes
/// concurrent routing of the same failure converge on a single effect.
pub struct FailureRouter {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    bus: Arc<EventBus>,
}

impl FailureRouter {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self { store, queue, bus }
    }

    /// Route one failed attempt.
    ///
    /// `message` is human-readable; `code` is one of the
    /// [`error_codes`] constants.
    pub async fn route(
        &self,
        job_id: &JobId,
        message: &str,
        code: &str,
    ) -> Result<FailureDisposition, PipelineError> {
        let Some(entry) = self.queue.entry(job_id).await? else {
            // Entry gone: cancelled or already resolved elsewhere.
            let job = self.store.get_job(job_id).await?;
            let status = job.map(|j| j.status).unwrap_or(JobStatus::Cancelled);
            return Ok(FailureDisposition::NotOwner(status));
        };

        if entry.attempts + 1 > entry.max_attempts {
            return self.fail_terminal(job_id, message, code).await;
        }

        // Retry: the CAS back to PENDING decides ownership, so two
        // observers of the same failure produce a single nack.
        match self.store.reset_for_retry(job_id).await? {
            TransitionOutcome::Ignored(status) => Ok(FailureDisposition::NotOwner(status)),
            TransitionOutcome::Applied(_) => match self.queue.nack(job_id, message).await? {
                NackOutcome::Retried {
                    attempts,
                    next_run_at,
                } => {
                    self.store.record_retry(job_id, message, code).await?;
                    self.store
                        .append_event(
                            NewJobEvent::new(
                                job_id.clone(),
                                JobEventType::Queued,
                                format!("Retry {attempts} scheduled: {message}"),
                            )
                            .with_metadata(serde_json::json!({
                                "attempt": attempts,
                                "error_code": code,
                                "next_run_at": next_run_at,
                            })),
                        )
                        .await?;
                    self.bus
                        .publish(JobSignal::new(SIGNAL_JOB_QUEUED, job_id.clone()));
                    tracing::info!(
                        job_id = %job_id,
                        attempt = attempts,
                        error_code = code,
                        "Job rescheduled with backoff",
                    );
                    Ok(FailureDisposition::RetryScheduled { attempts })
                }
                // The entry crossed the budget between peek and nack.
                NackOutcome::DeadLettered { .. } => {
                    self.fail_terminal(job_id, message, code).await
                }
            },
        }
    }

    /// Terminal failure: FAILED status, audit event, queue removal.
    async fn fail_terminal(
        &self,
        job_id: &JobId,
        message: &str,
        code: &str,
    ) -> Result<FailureDisposition, PipelineError> {
        match self
            .store
            .try_complete(job_id, CompletionUpdate::failed(message, code))
            .await?
        {
            TransitionOutcome::Ignored(status) => Ok(FailureDisposition::NotOwner(status)),
            TransitionOutcome::Applied(job) => {
                self.queue.ack(job_id).await?;
                self.store
                    .append_event(
                        NewJobEvent::new(
                            job_id.clone(),
                            JobEventType::Failed,
                            format!("Retries exhausted: {message}"),
                        )
                        .with_metadata(serde_json::json!({
                            "error_code": code,
                            "retry_count": job.retry_count,
                        })),
                    )
                    .await?;
                self.bus.publish(
                    JobSignal::new(SIGNAL_JOB_FAILED, job_id.clone())
                        .with_payload(serde_json::json!({ "error_code": code })),
                );
                tracing::warn!(job_id = %job_id, error_code = code, "Job failed terminally");
                Ok(FailureDisposition::FailedTerminal)
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
    use async_trait::async_trait;
    use coursecast_core::request::GenerationParams;
    use coursecast_db::memory::MemoryStore;
    use coursecast_db::models::NewJob;
    use coursecast_provider::error::PublishError;
    use coursecast_provider::publisher::PublishedArtifact;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakePublisher {
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakePublisher {
        fn ok() -> Self {
            Self {
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ArtifactPublisher for FakePublisher {
        async fn publish(&self, source_url: &str) -> Result<PublishedArtifact, PublishError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PublishError::Upload("storage rejected upload".into()));
            }
            Ok(PublishedArtifact {
                permanent_url: format!("https://cdn.app/{}", source_url.rsplit('/').next().unwrap_or("v")),
                thumbnail_url: None,
            })
        }
    }

    fn params() -> GenerationParams {
        GenerationParams {
            script: "hello".into(),
            avatar_id: "a1".into(),
            voice_id: None,
            target_duration_secs: None,
        }
    }

    async fn processing_job(store: &MemoryStore, id: &str) -> JobId {
        let job_id = JobId::new(id);
        store
            .create_job(NewJob::new(job_id.clone(), "ch-1", params()))
            .await
            .unwrap();
        store
            .try_transition(&job_id, JobStatus::Pending, JobStatus::Processing)
            .await
            .unwrap();
        job_id
    }

    fn success() -> ProviderSuccess {
        ProviderSuccess {
            result_url: "https://x/video.mp4".into(),
            thumbnail_url: Some("https://x/thumb.jpg".into()),
            duration_seconds: Some(81.0),
        }
    }

    #[tokio::test]
    async fn complete_success_publishes_and_records_one_event() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(FakePublisher::ok());
        let bus = Arc::new(EventBus::default());
        let transitions = TerminalTransitions::new(
            store.clone() as Arc<dyn JobStore>,
            publisher.clone(),
            bus,
        );
        let job_id = processing_job(&store, "j1").await;

        let outcome = transitions
            .complete_success(&job_id, success(), false)
            .await
            .unwrap();
        assert_matches!(outcome, CompletionOutcome::Completed(_));

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_url.as_deref(), Some("https://cdn.app/video.mp4"));
        assert_eq!(job.progress, 100);

        let events = store.events_for_job(&job_id).await.unwrap();
        let completed: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == JobEventType::Completed)
            .collect();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn publish_failure_falls_back_to_provider_url() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(FakePublisher::failing());
        let bus = Arc::new(EventBus::default());
        let transitions = TerminalTransitions::new(
            store.clone() as Arc<dyn JobStore>,
            publisher,
            bus,
        );
        let job_id = processing_job(&store, "j1").await;

        let outcome = transitions
            .complete_success(&job_id, success(), false)
            .await
            .unwrap();
        assert_matches!(outcome, CompletionOutcome::Completed(_));

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        // The provider's original URL survives as a degraded fallback.
        assert_eq!(job.result_url.as_deref(), Some("https://x/video.mp4"));

        let events = store.events_for_job(&job_id).await.unwrap();
        let publish_errors: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == JobEventType::PublishError)
            .collect();
        assert_eq!(publish_errors.len(), 1);
    }

    #[tokio::test]
    async fn racing_completions_record_exactly_one_transition() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(FakePublisher::ok());
        let bus = Arc::new(EventBus::default());
        let transitions = Arc::new(TerminalTransitions::new(
            store.clone() as Arc<dyn JobStore>,
            publisher.clone(),
            bus,
        ));
        let job_id = processing_job(&store, "j1").await;

        // Webhook and poller observe the same terminal status and race.
        let a = {
            let t = Arc::clone(&transitions);
            let id = job_id.clone();
            tokio::spawn(async move { t.complete_success(&id, success(), false).await })
        };
        let b = {
            let t = Arc::clone(&transitions);
            let id = job_id.clone();
            tokio::spawn(async move { t.complete_success(&id, success(), false).await })
        };
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

        let winners = [&a, &b]
            .iter()
            .filter(|o| matches!(o, CompletionOutcome::Completed(_)))
            .count();
        assert_eq!(winners, 1, "exactly one racer may win");

        let events = store.events_for_job(&job_id).await.unwrap();
        let completed = events
            .iter()
            .filter(|e| e.event_type == JobEventType::Completed)
            .count();
        assert_eq!(completed, 1, "exactly one COMPLETED event");

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn completion_on_terminal_job_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(FakePublisher::ok());
        let bus = Arc::new(EventBus::default());
        let transitions = TerminalTransitions::new(
            store.clone() as Arc<dyn JobStore>,
            publisher.clone(),
            bus,
        );
        let job_id = processing_job(&store, "j1").await;
        store
            .try_complete(&job_id, CompletionUpdate::cancelled())
            .await
            .unwrap();

        let outcome = transitions
            .complete_success(&job_id, success(), false)
            .await
            .unwrap();
        assert_matches!(
            outcome,
            CompletionOutcome::AlreadyResolved(JobStatus::Cancelled)
        );
        // The loser must not have touched storage.
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert!(job.result_url.is_none());
    }

    #[tokio::test]
    async fn failure_routes_to_retry_until_budget_spent() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::default());
        let router = FailureRouter::new(
            store.clone() as Arc<dyn JobStore>,
            store.clone() as Arc<dyn WorkQueue>,
            bus,
        );
        let job_id = processing_job(&store, "j1").await;
        store.enqueue(&job_id, 3).await.unwrap();

        for expected in 1..=3 {
            let disposition = router
                .route(&job_id, "provider down", error_codes::PROVIDER_UNAVAILABLE)
                .await
                .unwrap();
            assert_matches!(
                disposition,
                FailureDisposition::RetryScheduled { attempts } if attempts == expected
            );
            // Simulate the next lease cycle taking ownership again.
            store
                .try_transition(&job_id, JobStatus::Pending, JobStatus::Processing)
                .await
                .unwrap();
        }

        let disposition = router
            .route(&job_id, "provider down", error_codes::PROVIDER_UNAVAILABLE)
            .await
            .unwrap();
        assert_matches!(disposition, FailureDisposition::FailedTerminal);

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert!(store.entry(&job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_routing_without_queue_entry_is_not_owner() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::default());
        let router = FailureRouter::new(
            store.clone() as Arc<dyn JobStore>,
            store.clone() as Arc<dyn WorkQueue>,
            bus,
        );
        let job_id = processing_job(&store, "j1").await;
        // No queue entry: e.g. the job was cancelled and dequeued.

        let disposition = router
            .route(&job_id, "late failure", error_codes::GENERATION_FAILED)
            .await
            .unwrap();
        assert_matches!(disposition, FailureDisposition::NotOwner(_));
    }
}
