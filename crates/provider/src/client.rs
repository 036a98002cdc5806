//! Abstract interface to the external generation service.

use async_trait::async_trait;
use coursecast_core::request::GenerationParams;

use crate::error::ProviderError;
use crate::types::ProviderPollResponse;

/// Submit and poll operations against the generation provider.
///
/// Submission is the only quota-limited call; polling is cheap and is
/// driven by the reconciliation poller when no webhook arrives.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Submit a generation request. Returns the provider-assigned id.
    async fn submit(&self, params: &GenerationParams) -> Result<String, ProviderError>;

    /// Poll the current status of a previously submitted generation.
    async fn poll_status(
        &self,
        provider_job_id: &str,
    ) -> Result<ProviderPollResponse, ProviderError>;
}
