//! In-memory store and queue for tests and local development.
//!
//! A single mutex guards all state, so every conditional update runs as
//! one atomic read-modify-write, the same guarantee the PostgreSQL
//! implementation gets from conditional `UPDATE` statements.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use coursecast_core::backoff::RetryPolicy;
use coursecast_core::progress::{advance_progress, PROGRESS_COMPLETE};
use coursecast_core::status::JobStatus;
use coursecast_core::types::{JobId, WorkerId};
use tokio::sync::Mutex;

use crate::models::{Job, JobEvent, NewJob, NewJobEvent, QueueEntry};
use crate::store::{
    CompletionUpdate, JobStore, Lease, NackOutcome, StoreError, TransitionOutcome, WorkQueue,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    events: Vec<JobEvent>,
    queue: HashMap<JobId, QueueEntry>,
    event_seq: i64,
}

/// Shared in-memory [`JobStore`] + [`WorkQueue`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    retry_policy: RetryPolicy,
}

impl MemoryStore {
    /// Create a store with the default 5 s / 5 min backoff policy.
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    /// Create a store with a custom backoff policy.
    pub fn with_retry_policy(retry_policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retry_policy,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&new.id) {
            return Err(StoreError::DuplicateJob(new.id));
        }

        let job = Job {
            id: new.id.clone(),
            owner_ref: new.owner_ref,
            params: new.params,
            status: JobStatus::Pending,
            progress: 0,
            provider_job_id: None,
            result_url: None,
            thumbnail_url: None,
            duration_seconds: None,
            error_message: None,
            error_code: None,
            retry_count: 0,
            max_retries: new.max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        inner.jobs.insert(new.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(id).cloned())
    }

    async fn find_by_provider_job_id(
        &self,
        provider_job_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .find(|j| j.provider_job_id.as_deref() == Some(provider_job_id))
            .cloned())
    }

    async fn try_transition(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;

        if job.status.is_terminal() || job.status != from {
            return Ok(TransitionOutcome::Ignored(job.status));
        }

        job.status = to;
        Ok(TransitionOutcome::Applied(job.clone()))
    }

    async fn try_complete(
        &self,
        id: &JobId,
        update: CompletionUpdate,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;

        if job.status.is_terminal() {
            return Ok(TransitionOutcome::Ignored(job.status));
        }

        job.status = update.status;
        job.result_url = update.result_url;
        job.thumbnail_url = update.thumbnail_url;
        job.duration_seconds = update.duration_seconds;
        job.error_message = update.error_message;
        job.error_code = update.error_code;
        job.completed_at = Some(Utc::now());
        if update.status == JobStatus::Completed {
            job.progress = PROGRESS_COMPLETE;
        }
        Ok(TransitionOutcome::Applied(job.clone()))
    }

    async fn reset_for_retry(&self, id: &JobId) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;

        if job.status != JobStatus::Processing {
            return Ok(TransitionOutcome::Ignored(job.status));
        }

        job.status = JobStatus::Pending;
        job.provider_job_id = None;
        Ok(TransitionOutcome::Applied(job.clone()))
    }

    async fn set_provider_job_id(
        &self,
        id: &JobId,
        provider_job_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;

        match &job.provider_job_id {
            None => {
                job.provider_job_id = Some(provider_job_id.to_string());
                Ok(())
            }
            Some(existing) if existing == provider_job_id => Ok(()),
            Some(_) => Err(StoreError::ProviderIdAlreadySet(id.clone())),
        }
    }

    async fn mark_started(&self, id: &JobId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_progress(&self, id: &JobId, progress: i16) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;
        if !job.status.is_terminal() {
            job.progress = advance_progress(job.progress, progress);
        }
        Ok(())
    }

    async fn record_retry(
        &self,
        id: &JobId,
        error_message: &str,
        error_code: &str,
    ) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;
        job.retry_count = (job.retry_count + 1).min(job.max_retries);
        job.error_message = Some(error_message.to_string());
        job.error_code = Some(error_code.to_string());
        Ok(job.clone())
    }

    async fn append_event(&self, event: NewJobEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.event_seq += 1;
        let id = inner.event_seq;
        inner.events.push(JobEvent {
            id,
            job_id: event.job_id,
            event_type: event.event_type,
            message: event.message,
            metadata: event.metadata,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn events_for_job(&self, id: &JobId) -> Result<Vec<JobEvent>, StoreError> {
        let inner = self.inner.lock().await;
        let mut events: Vec<JobEvent> = inner
            .events
            .iter()
            .filter(|e| &e.job_id == id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.id);
        Ok(events)
    }
}

#[async_trait]
impl WorkQueue for MemoryStore {
    async fn enqueue(&self, job_id: &JobId, max_attempts: i32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.queue.contains_key(job_id) {
            return Err(StoreError::DuplicateJob(job_id.clone()));
        }
        let now = Utc::now();
        inner.queue.insert(
            job_id.clone(),
            QueueEntry {
                job_id: job_id.clone(),
                attempts: 0,
                max_attempts,
                next_run_at: now,
                locked_by: None,
                lock_expires_at: None,
                dead_lettered: false,
                enqueued_at: now,
            },
        );
        Ok(())
    }

    async fn lease(
        &self,
        worker: &WorkerId,
        visibility_timeout: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        // Deterministic selection: oldest due entry first.
        let mut candidates: Vec<&QueueEntry> =
            inner.queue.values().filter(|e| e.is_ready(now)).collect();
        candidates.sort_by_key(|e| (e.next_run_at, e.enqueued_at));
        let Some(job_id) = candidates.first().map(|e| e.job_id.clone()) else {
            return Ok(None);
        };

        let timeout = chrono::Duration::from_std(visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let expires = now + timeout;

        let entry = inner
            .queue
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.clone()))?;
        entry.locked_by = Some(worker.clone());
        entry.lock_expires_at = Some(expires);

        Ok(Some(Lease {
            job_id,
            attempts: entry.attempts,
            lock_expires_at: expires,
        }))
    }

    async fn ack(&self, job_id: &JobId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.queue.remove(job_id);
        Ok(())
    }

    async fn nack(&self, job_id: &JobId, error: &str) -> Result<NackOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let policy = self.retry_policy.clone();
        let entry = inner
            .queue
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.clone()))?;

        entry.attempts += 1;
        entry.locked_by = None;
        entry.lock_expires_at = None;

        if entry.attempts > entry.max_attempts {
            entry.dead_lettered = true;
            tracing::warn!(
                job_id = %job_id,
                attempts = entry.attempts,
                error,
                "Queue entry dead-lettered",
            );
            return Ok(NackOutcome::DeadLettered {
                attempts: entry.attempts,
            });
        }

        let delay = policy.delay_for_attempt(entry.attempts as u32);
        let delay = chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        entry.next_run_at = Utc::now() + delay;

        Ok(NackOutcome::Retried {
            attempts: entry.attempts,
            next_run_at: entry.next_run_at,
        })
    }

    async fn remove(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.queue.remove(job_id).is_some())
    }

    async fn entry(&self, job_id: &JobId) -> Result<Option<QueueEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.queue.get(job_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use coursecast_core::request::GenerationParams;
    use coursecast_core::status::JobEventType;

    fn params() -> GenerationParams {
        GenerationParams {
            script: "hello".into(),
            avatar_id: "a1".into(),
            voice_id: None,
            target_duration_secs: None,
        }
    }

    fn new_job(id: &str) -> NewJob {
        NewJob::new(JobId::new(id), "chapter-1", params())
    }

    async fn store_with_job(id: &str) -> MemoryStore {
        let store = MemoryStore::new();
        store.create_job(new_job(id)).await.unwrap();
        store
    }

    // -- JobStore -----------------------------------------------------------

    #[tokio::test]
    async fn create_job_starts_pending() {
        let store = MemoryStore::new();
        let job = store.create_job(new_job("j1")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 3);
    }

    #[tokio::test]
    async fn duplicate_job_id_rejected() {
        let store = store_with_job("j1").await;
        let err = store.create_job(new_job("j1")).await.unwrap_err();
        assert_matches!(err, StoreError::DuplicateJob(_));
    }

    #[tokio::test]
    async fn transition_applies_only_from_expected_status() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");

        let outcome = store
            .try_transition(&id, JobStatus::Pending, JobStatus::Processing)
            .await
            .unwrap();
        assert_matches!(outcome, TransitionOutcome::Applied(ref j) if j.status == JobStatus::Processing);

        // Second identical CAS observes the new status and is ignored.
        let outcome = store
            .try_transition(&id, JobStatus::Pending, JobStatus::Processing)
            .await
            .unwrap();
        assert_matches!(outcome, TransitionOutcome::Ignored(JobStatus::Processing));
    }

    #[tokio::test]
    async fn terminal_status_is_immutable() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");
        store
            .try_complete(&id, CompletionUpdate::cancelled())
            .await
            .unwrap();

        let outcome = store
            .try_transition(&id, JobStatus::Cancelled, JobStatus::Processing)
            .await
            .unwrap();
        assert_matches!(outcome, TransitionOutcome::Ignored(JobStatus::Cancelled));

        let outcome = store
            .try_complete(
                &id,
                CompletionUpdate::completed("https://x/v.mp4", None, None),
            )
            .await
            .unwrap();
        assert_matches!(outcome, TransitionOutcome::Ignored(JobStatus::Cancelled));

        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result_url.is_none());
    }

    #[tokio::test]
    async fn complete_sets_result_and_full_progress() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");

        let outcome = store
            .try_complete(
                &id,
                CompletionUpdate::completed("https://x/v.mp4", Some("https://x/t.jpg".into()), Some(42.5)),
            )
            .await
            .unwrap();
        assert!(outcome.applied());

        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_url.as_deref(), Some("https://x/v.mp4"));
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn provider_job_id_is_write_once() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");

        store.set_provider_job_id(&id, "p1").await.unwrap();
        // Same value is an idempotent no-op.
        store.set_provider_job_id(&id, "p1").await.unwrap();
        // A different value is a violation.
        let err = store.set_provider_job_id(&id, "p2").await.unwrap_err();
        assert_matches!(err, StoreError::ProviderIdAlreadySet(_));

        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.provider_job_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn reset_for_retry_returns_to_pending_and_clears_provider_id() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");
        store
            .try_transition(&id, JobStatus::Pending, JobStatus::Processing)
            .await
            .unwrap();
        store.set_provider_job_id(&id, "p1").await.unwrap();

        let outcome = store.reset_for_retry(&id).await.unwrap();
        assert!(outcome.applied());

        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.provider_job_id.is_none());

        // A fresh attempt may set a new provider id.
        store.set_provider_job_id(&id, "p2").await.unwrap();

        // Only PROCESSING jobs can be reset.
        let outcome = store.reset_for_retry(&id).await.unwrap();
        assert_matches!(outcome, TransitionOutcome::Ignored(JobStatus::Pending));
    }

    #[tokio::test]
    async fn find_by_provider_job_id_resolves() {
        let store = store_with_job("j1").await;
        store
            .set_provider_job_id(&JobId::new("j1"), "p1")
            .await
            .unwrap();

        let job = store.find_by_provider_job_id("p1").await.unwrap().unwrap();
        assert_eq!(job.id, JobId::new("j1"));
        assert!(store.find_by_provider_job_id("p9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");

        store.update_progress(&id, 40).await.unwrap();
        store.update_progress(&id, 30).await.unwrap();
        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.progress, 40);

        store.update_progress(&id, 55).await.unwrap();
        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.progress, 55);
    }

    #[tokio::test]
    async fn retry_count_clamps_at_max_retries() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");

        for _ in 0..5 {
            store.record_retry(&id, "boom", "provider_unavailable").await.unwrap();
        }
        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.error_code.as_deref(), Some("provider_unavailable"));
    }

    #[tokio::test]
    async fn events_are_ordered_per_job() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");

        for (kind, msg) in [
            (JobEventType::Created, "created"),
            (JobEventType::Queued, "queued"),
            (JobEventType::Processing, "processing"),
        ] {
            store
                .append_event(NewJobEvent::new(id.clone(), kind, msg))
                .await
                .unwrap();
        }

        let events = store.events_for_job(&id).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(events[0].event_type, JobEventType::Created);
        assert_eq!(events[2].event_type, JobEventType::Processing);
    }

    // -- WorkQueue ----------------------------------------------------------

    #[tokio::test]
    async fn enqueue_then_lease_returns_entry() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");
        store.enqueue(&id, 3).await.unwrap();

        let lease = store
            .lease(&WorkerId::new("w1"), Duration::from_secs(60))
            .await
            .unwrap()
            .expect("entry should be ready");
        assert_eq!(lease.job_id, id);
        assert_eq!(lease.attempts, 0);
    }

    #[tokio::test]
    async fn duplicate_enqueue_rejected() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");
        store.enqueue(&id, 3).await.unwrap();
        let err = store.enqueue(&id, 3).await.unwrap_err();
        assert_matches!(err, StoreError::DuplicateJob(_));
    }

    #[tokio::test]
    async fn locked_entry_is_not_leasable_by_others() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");
        store.enqueue(&id, 3).await.unwrap();

        let first = store
            .lease(&WorkerId::new("w1"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .lease(&WorkerId::new("w2"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.is_none(), "lock must exclude a second worker");
    }

    #[tokio::test]
    async fn expired_lock_allows_re_lease() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");
        store.enqueue(&id, 3).await.unwrap();

        // Zero visibility: the lock expires immediately.
        store
            .lease(&WorkerId::new("w1"), Duration::ZERO)
            .await
            .unwrap()
            .expect("first lease");

        let second = store
            .lease(&WorkerId::new("w2"), Duration::from_secs(60))
            .await
            .unwrap()
            .expect("expired lock should be re-leasable");
        assert_eq!(second.job_id, id);
    }

    #[tokio::test]
    async fn ack_removes_entry() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");
        store.enqueue(&id, 3).await.unwrap();
        store.ack(&id).await.unwrap();

        assert!(store.entry(&id).await.unwrap().is_none());
        let lease = store
            .lease(&WorkerId::new("w1"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test]
    async fn nack_backs_off_and_eventually_dead_letters() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");
        store.enqueue(&id, 3).await.unwrap();

        let mut last_delay = chrono::Duration::zero();
        for expected_attempt in 1..=3 {
            let before = Utc::now();
            let outcome = store.nack(&id, "provider down").await.unwrap();
            match outcome {
                NackOutcome::Retried {
                    attempts,
                    next_run_at,
                } => {
                    assert_eq!(attempts, expected_attempt);
                    let delay = next_run_at - before;
                    // Non-decreasing backoff up to the cap.
                    assert!(delay >= last_delay, "attempt {expected_attempt} shrank");
                    last_delay = delay;
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }

        let outcome = store.nack(&id, "provider down").await.unwrap();
        assert_matches!(outcome, NackOutcome::DeadLettered { attempts: 4 });

        // Dead-lettered entries are never leased again, even when due.
        let lease = store
            .lease(&WorkerId::new("w1"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test]
    async fn nack_schedules_expected_backoff_delays() {
        let policy = RetryPolicy {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
        };
        let store = MemoryStore::with_retry_policy(policy);
        store.create_job(new_job("j1")).await.unwrap();
        let id = JobId::new("j1");
        store.enqueue(&id, 3).await.unwrap();

        for expected_secs in [5i64, 10, 20] {
            let before = Utc::now();
            let outcome = store.nack(&id, "boom").await.unwrap();
            let NackOutcome::Retried { next_run_at, .. } = outcome else {
                panic!("expected retry");
            };
            let delay = (next_run_at - before).num_milliseconds();
            let expected_ms = expected_secs * 1_000;
            assert!(
                (delay - expected_ms).abs() < 500,
                "expected ~{expected_ms}ms, got {delay}ms"
            );
        }
    }

    #[tokio::test]
    async fn backed_off_entry_is_not_ready_until_due() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");
        store.enqueue(&id, 3).await.unwrap();
        store.nack(&id, "boom").await.unwrap();

        // next_run_at is ~5s out; nothing is leasable right now.
        let lease = store
            .lease(&WorkerId::new("w1"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let store = store_with_job("j1").await;
        let id = JobId::new("j1");
        store.enqueue(&id, 3).await.unwrap();

        assert!(store.remove(&id).await.unwrap());
        assert!(!store.remove(&id).await.unwrap());
    }

    #[tokio::test]
    async fn lease_prefers_oldest_due_entry() {
        let store = MemoryStore::new();
        for id in ["j1", "j2"] {
            store.create_job(new_job(id)).await.unwrap();
        }
        store.enqueue(&JobId::new("j1"), 3).await.unwrap();
        store.enqueue(&JobId::new("j2"), 3).await.unwrap();

        let lease = store
            .lease(&WorkerId::new("w1"), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.job_id, JobId::new("j1"));
    }
}
