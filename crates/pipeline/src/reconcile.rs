//! Fallback status reconciliation via provider polling.
//!
//! When no webhook arrives, the worker holding a job's lease polls the
//! provider until a terminal status is observed or the polling budget
//! runs out. Before every poll the job is re-read, so a webhook (or a
//! cancel) that resolves the job first turns the poller into a no-op.

use std::sync::Arc;

use coursecast_core::progress::poll_progress_estimate;
use coursecast_core::status::{JobEventType, JobStatus};
use coursecast_core::types::JobId;
use coursecast_db::models::NewJobEvent;
use coursecast_db::store::JobStore;
use coursecast_events::bus::{EventBus, JobSignal, SIGNAL_JOB_PROGRESS};
use coursecast_provider::client::ProviderClient;
use coursecast_provider::types::ProviderJobStatus;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::transitions::ProviderSuccess;

/// How one reconciliation pass ended.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// The provider finished successfully.
    Succeeded(ProviderSuccess),
    /// The provider reported a terminal failure for this attempt.
    ProviderFailed { message: String },
    /// The polling budget was exhausted without a terminal status.
    TimedOut,
    /// Something else (webhook, cancel, retry routing) already moved
    /// the job out from under the poller.
    ExternallyResolved(JobStatus),
    /// Shutdown was requested.
    Cancelled,
}

/// Polls the provider for jobs awaiting a terminal status.
pub struct Reconciler {
    store: Arc<dyn JobStore>,
    provider: Arc<dyn ProviderClient>,
    bus: Arc<EventBus>,
    grace: std::time::Duration,
    interval: std::time::Duration,
    budget: u32,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn ProviderClient>,
        bus: Arc<EventBus>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            provider,
            bus,
            grace: config.poll_grace,
            interval: config.poll_interval,
            budget: config.poll_budget,
        }
    }

    /// Poll until the provider reaches a terminal status.
    ///
    /// `provider_job_id` must already be recorded on the job. The loop
    /// checks the cancellation token at every step; it never sleeps
    /// without a cancellation check.
    pub async fn await_outcome(
        &self,
        job_id: &JobId,
        provider_job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, PipelineError> {
        // Grace window: give the webhook a chance to land first.
        tokio::select! {
            _ = cancel.cancelled() => return Ok(ReconcileOutcome::Cancelled),
            _ = tokio::time::sleep(self.grace) => {}
        }

        let mut polls = 0u32;
        loop {
            // Re-read before mutating anything: a webhook or cancel may
            // have resolved the job while we slept.
            let job = self
                .store
                .get_job(job_id)
                .await?
                .ok_or_else(|| {
                    PipelineError::Store(coursecast_db::store::StoreError::JobNotFound(
                        job_id.clone(),
                    ))
                })?;
            if !matches!(job.status, JobStatus::Processing | JobStatus::Publishing) {
                return Ok(ReconcileOutcome::ExternallyResolved(job.status));
            }

            if polls >= self.budget {
                return Ok(ReconcileOutcome::TimedOut);
            }

            match self.provider.poll_status(provider_job_id).await {
                Ok(response) => {
                    polls += 1;
                    self.store
                        .append_event(
                            NewJobEvent::new(
                                job_id.clone(),
                                JobEventType::Polling,
                                format!("Provider status: {:?}", response.status),
                            )
                            .with_metadata(serde_json::json!({
                                "provider_status": response.status,
                                "poll": polls,
                            })),
                        )
                        .await?;

                    let estimate = poll_progress_estimate(polls);
                    self.store.update_progress(job_id, estimate).await?;
                    self.bus.publish(
                        JobSignal::new(SIGNAL_JOB_PROGRESS, job_id.clone())
                            .with_payload(serde_json::json!({ "progress": estimate })),
                    );

                    match response.status {
                        ProviderJobStatus::Completed => {
                            return match response.result_url {
                                Some(result_url) => {
                                    Ok(ReconcileOutcome::Succeeded(ProviderSuccess {
                                        result_url,
                                        thumbnail_url: response.thumbnail_url,
                                        duration_seconds: response.duration_seconds,
                                    }))
                                }
                                None => Ok(ReconcileOutcome::ProviderFailed {
                                    message: "provider reported completion without a result URL"
                                        .to_string(),
                                }),
                            };
                        }
                        ProviderJobStatus::Failed => {
                            return Ok(ReconcileOutcome::ProviderFailed {
                                message: response
                                    .error
                                    .unwrap_or_else(|| "provider reported failure".to_string()),
                            });
                        }
                        ProviderJobStatus::Pending | ProviderJobStatus::Processing => {}
                    }
                }
                Err(e) => {
                    // A failed poll consumes budget but is otherwise
                    // transient; the next tick retries.
                    polls += 1;
                    tracing::warn!(
                        job_id = %job_id,
                        provider_job_id,
                        poll = polls,
                        error = %e,
                        "Provider poll failed",
                    );
                    self.store
                        .append_event(
                            NewJobEvent::new(
                                job_id.clone(),
                                JobEventType::Polling,
                                format!("Poll failed: {e}"),
                            )
                            .with_metadata(serde_json::json!({
                                "error_code": e.error_code(),
                                "poll": polls,
                            })),
                        )
                        .await?;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(ReconcileOutcome::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
