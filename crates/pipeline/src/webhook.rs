//! Inbound provider webhook ingest.
//!
//! Webhooks and the reconciliation poller are idempotent-compatible:
//! both route through the guarded transitions in
//! [`crate::transitions`], so whichever observes the terminal state
//! first performs it and the other no-ops.

use std::sync::Arc;

use coursecast_core::error_codes;
use coursecast_core::types::JobId;
use coursecast_db::models::Job;
use coursecast_db::store::{JobStore, WorkQueue};
use coursecast_events::bus::EventBus;
use coursecast_provider::publisher::ArtifactPublisher;
use coursecast_provider::types::ProviderJobStatus;
use serde::Deserialize;

use crate::error::PipelineError;
use crate::transitions::{
    CompletionOutcome, FailureDisposition, FailureRouter, ProviderSuccess, TerminalTransitions,
};

/// Push notification from the provider.
///
/// Either `job_id` or `provider_job_id` must be present; `job_id` wins
/// when both are given.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookUpdate {
    /// Always `"status_update"` in the current contract.
    pub event_type: String,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub provider_job_id: Option<String>,
    pub status: ProviderJobStatus,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// How an inbound webhook was handled.
#[derive(Debug, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// The webhook performed a state transition.
    Applied,
    /// The job was already resolved; the webhook no-opped.
    AlreadyResolved,
    /// Non-terminal or stale notification; nothing to do.
    Ignored,
    /// No job matches the notification.
    UnknownJob,
}

/// Applies provider webhooks to the job pipeline.
pub struct WebhookIngest {
    store: Arc<dyn JobStore>,
    transitions: TerminalTransitions,
    failures: FailureRouter,
}

impl WebhookIngest {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        publisher: Arc<dyn ArtifactPublisher>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            transitions: TerminalTransitions::new(
                Arc::clone(&store),
                publisher,
                Arc::clone(&bus),
            ),
            failures: FailureRouter::new(Arc::clone(&store), queue, bus),
            store,
        }
    }

    /// Handle one webhook notification.
    pub async fn handle(
        &self,
        update: WebhookUpdate,
    ) -> Result<WebhookDisposition, PipelineError> {
        let Some(job) = self.resolve_job(&update).await? else {
            tracing::warn!(
                job_id = ?update.job_id,
                provider_job_id = ?update.provider_job_id,
                "Webhook for unknown job, dropping",
            );
            return Ok(WebhookDisposition::UnknownJob);
        };

        // A webhook for a previous attempt's provider id is stale: the
        // retry path cleared it before re-submitting.
        if let Some(provider_job_id) = &update.provider_job_id {
            if job.provider_job_id.as_deref() != Some(provider_job_id.as_str()) {
                tracing::debug!(
                    job_id = %job.id,
                    provider_job_id,
                    "Webhook references a stale provider id, ignoring",
                );
                return Ok(WebhookDisposition::Ignored);
            }
        }

        if job.status.is_terminal() {
            return Ok(WebhookDisposition::AlreadyResolved);
        }

        match update.status {
            ProviderJobStatus::Completed => {
                let Some(result_url) = update.result_url else {
                    tracing::warn!(
                        job_id = %job.id,
                        "Completion webhook without a result URL, ignoring",
                    );
                    return Ok(WebhookDisposition::Ignored);
                };
                let success = ProviderSuccess {
                    result_url,
                    thumbnail_url: update.thumbnail_url,
                    duration_seconds: update.duration_seconds,
                };
                match self
                    .transitions
                    .complete_success(&job.id, success, false)
                    .await?
                {
                    CompletionOutcome::Completed(_) => Ok(WebhookDisposition::Applied),
                    CompletionOutcome::AlreadyResolved(_) => {
                        Ok(WebhookDisposition::AlreadyResolved)
                    }
                }
            }
            ProviderJobStatus::Failed => {
                let message = update
                    .error
                    .unwrap_or_else(|| "provider reported failure".to_string());
                match self
                    .failures
                    .route(&job.id, &message, error_codes::GENERATION_FAILED)
                    .await?
                {
                    FailureDisposition::RetryScheduled { .. }
                    | FailureDisposition::FailedTerminal => Ok(WebhookDisposition::Applied),
                    FailureDisposition::NotOwner(_) => Ok(WebhookDisposition::AlreadyResolved),
                }
            }
            ProviderJobStatus::Pending | ProviderJobStatus::Processing => {
                tracing::debug!(
                    job_id = %job.id,
                    status = ?update.status,
                    "Non-terminal webhook, ignoring",
                );
                Ok(WebhookDisposition::Ignored)
            }
        }
    }

    async fn resolve_job(&self, update: &WebhookUpdate) -> Result<Option<Job>, PipelineError> {
        if let Some(job_id) = &update.job_id {
            return Ok(self.store.get_job(job_id).await?);
        }
        if let Some(provider_job_id) = &update.provider_job_id {
            return Ok(self
                .store
                .find_by_provider_job_id(provider_job_id)
                .await?);
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
