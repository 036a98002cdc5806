//! Per-lease execution of the job state machine.
//!
//! A runner drives one leased job as far as it can: take ownership,
//! submit to the provider, await the provider outcome, then route into
//! completion or the failure path. Every step re-checks job state first,
//! which is what makes at-least-once delivery safe: a duplicate
//! delivery of a finished job acks and exits without side effects.

use std::sync::Arc;

use coursecast_core::error_codes;
use coursecast_core::status::{JobEventType, JobStatus};
use coursecast_core::types::{JobId, WorkerId};
use coursecast_db::models::NewJobEvent;
use coursecast_db::store::{JobStore, Lease, TransitionOutcome, WorkQueue};
use coursecast_events::bus::{EventBus, JobSignal, SIGNAL_JOB_PROCESSING};
use coursecast_provider::client::ProviderClient;
use coursecast_provider::publisher::ArtifactPublisher;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::limiter::SubmitLimiter;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::transitions::{
    CompletionOutcome, FailureDisposition, FailureRouter, TerminalTransitions,
};

/// Executes leased jobs through the generation state machine.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    provider: Arc<dyn ProviderClient>,
    limiter: Arc<SubmitLimiter>,
    transitions: TerminalTransitions,
    failures: FailureRouter,
    reconciler: Reconciler,
    bus: Arc<EventBus>,
    submit_timeout: std::time::Duration,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        provider: Arc<dyn ProviderClient>,
        publisher: Arc<dyn ArtifactPublisher>,
        bus: Arc<EventBus>,
        limiter: Arc<SubmitLimiter>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            transitions: TerminalTransitions::new(
                Arc::clone(&store),
                publisher,
                Arc::clone(&bus),
            ),
            failures: FailureRouter::new(
                Arc::clone(&store),
                Arc::clone(&queue),
                Arc::clone(&bus),
            ),
            reconciler: Reconciler::new(
                Arc::clone(&store),
                Arc::clone(&provider),
                Arc::clone(&bus),
                config,
            ),
            store,
            queue,
            provider,
            limiter,
            bus,
            submit_timeout: config.submit_timeout,
        }
    }

    /// Execute one leased job until it is handed off, resolved, or the
    /// shutdown token fires.
    pub async fn run_lease(
        &self,
        lease: &Lease,
        worker: &WorkerId,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let job_id = &lease.job_id;
        let Some(job) = self.store.get_job(job_id).await? else {
            tracing::warn!(job_id = %job_id, "Leased entry has no job row, dropping it");
            self.queue.ack(job_id).await?;
            return Ok(());
        };

        // Duplicate delivery of a finished job: ack without side effects.
        if job.status.is_terminal() {
            self.queue.ack(job_id).await?;
            return Ok(());
        }

        // A job found in PUBLISHING lost its previous owner mid-publish;
        // this lease resumes the completion instead of starting over.
        let resume_publishing = job.status == JobStatus::Publishing;

        if job.status == JobStatus::Pending {
            match self
                .store
                .try_transition(job_id, JobStatus::Pending, JobStatus::Processing)
                .await?
            {
                TransitionOutcome::Applied(_) => {
                    self.store.mark_started(job_id).await?;
                    self.store
                        .append_event(
                            NewJobEvent::new(
                                job_id.clone(),
                                JobEventType::Processing,
                                "Worker took ownership",
                            )
                            .with_metadata(serde_json::json!({
                                "worker_id": worker,
                                "delivery_attempts": lease.attempts,
                            })),
                        )
                        .await?;
                    self.bus
                        .publish(JobSignal::new(SIGNAL_JOB_PROCESSING, job_id.clone()));
                }
                TransitionOutcome::Ignored(status) => {
                    // Cancelled (or otherwise resolved) between lease and
                    // ownership; nothing to execute.
                    if status.is_terminal() {
                        self.queue.ack(job_id).await?;
                    }
                    return Ok(());
                }
            }
        }

        let provider_job_id = match &job.provider_job_id {
            // Submission already happened on a previous delivery.
            Some(existing) => existing.clone(),
            None => match self.submit(job_id, cancel).await? {
                Some(provider_job_id) => provider_job_id,
                None => return Ok(()),
            },
        };

        match self
            .reconciler
            .await_outcome(job_id, &provider_job_id, cancel)
            .await?
        {
            ReconcileOutcome::Succeeded(success) => {
                match self
                    .transitions
                    .complete_success(job_id, success, resume_publishing)
                    .await?
                {
                    CompletionOutcome::Completed(_) => self.queue.ack(job_id).await?,
                    CompletionOutcome::AlreadyResolved(status) if status.is_terminal() => {
                        self.queue.ack(job_id).await?;
                    }
                    // A retry was scheduled elsewhere; the entry stays.
                    CompletionOutcome::AlreadyResolved(_) => {}
                }
            }
            ReconcileOutcome::ProviderFailed { message } => {
                self.route_failure(job_id, &message, error_codes::GENERATION_FAILED)
                    .await?;
            }
            ReconcileOutcome::TimedOut => {
                self.route_failure(
                    job_id,
                    "polling budget exhausted without a terminal provider status",
                    error_codes::POLLING_TIMEOUT,
                )
                .await?;
            }
            ReconcileOutcome::ExternallyResolved(status) => {
                if status.is_terminal() {
                    self.queue.ack(job_id).await?;
                }
                // Non-terminal (PENDING): a webhook routed this attempt
                // to retry already; leave the entry for its next run.
            }
            // Shutdown: leave the lease to expire, redelivery is safe.
            ReconcileOutcome::Cancelled => {}
        }

        Ok(())
    }

    /// Rate-limited provider submission with its per-call timeout.
    ///
    /// Returns `None` when the lease should be released without further
    /// work (cancellation observed, shutdown, or failure already routed).
    async fn submit(
        &self,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, PipelineError> {
        // Cancellation check before the provider call.
        if self.ack_if_terminal(job_id).await? {
            return Ok(None);
        }

        if !self.limiter.acquire(cancel).await {
            return Ok(None);
        }

        // The limiter wait can be long; re-check before submitting.
        if self.ack_if_terminal(job_id).await? {
            return Ok(None);
        }

        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Store(coursecast_db::store::StoreError::JobNotFound(
                    job_id.clone(),
                ))
            })?;

        match tokio::time::timeout(self.submit_timeout, self.provider.submit(&job.params)).await
        {
            Ok(Ok(provider_job_id)) => {
                self.store
                    .set_provider_job_id(job_id, &provider_job_id)
                    .await?;
                tracing::info!(
                    job_id = %job_id,
                    provider_job_id = %provider_job_id,
                    "Generation submitted",
                );
                Ok(Some(provider_job_id))
            }
            Ok(Err(e)) => {
                self.route_failure(job_id, &e.to_string(), e.error_code())
                    .await?;
                Ok(None)
            }
            Err(_elapsed) => {
                self.route_failure(
                    job_id,
                    "provider submission timed out",
                    error_codes::PROVIDER_UNAVAILABLE,
                )
                .await?;
                Ok(None)
            }
        }
    }

    /// Route a failed attempt, acking the entry when someone else
    /// already resolved the job terminally.
    async fn route_failure(
        &self,
        job_id: &JobId,
        message: &str,
        code: &str,
    ) -> Result<(), PipelineError> {
        match self.failures.route(job_id, message, code).await? {
            FailureDisposition::NotOwner(status) if status.is_terminal() => {
                self.queue.ack(job_id).await?;
            }
            FailureDisposition::NotOwner(_)
            | FailureDisposition::RetryScheduled { .. }
            | FailureDisposition::FailedTerminal => {}
        }
        Ok(())
    }

    /// Ack and report `true` when the job is already terminal.
    async fn ack_if_terminal(&self, job_id: &JobId) -> Result<bool, PipelineError> {
        let Some(job) = self.store.get_job(job_id).await? else {
            self.queue.ack(job_id).await?;
            return Ok(true);
        };
        if job.status.is_terminal() {
            self.queue.ack(job_id).await?;
            return Ok(true);
        }
        Ok(false)
    }
}
