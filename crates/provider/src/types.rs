//! Wire types for the generation provider.

use serde::{Deserialize, Serialize};

/// Provider-side lifecycle of a submitted generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderJobStatus {
    /// Accepted but not yet running.
    Pending,
    /// Generation in progress.
    Processing,
    /// Finished; `result_url` is available.
    Completed,
    /// The generation failed provider-side.
    Failed,
}

impl ProviderJobStatus {
    /// Whether the provider will report no further changes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderJobStatus::Completed | ProviderJobStatus::Failed)
    }
}

/// Response of a status poll.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderPollResponse {
    pub status: ProviderJobStatus,
    /// Set when `status == completed`. Provider-hosted; may expire.
    pub result_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_seconds: Option<f64>,
    /// Set when `status == failed`.
    pub error: Option<String>,
}

/// Response returned by the provider when a submission is accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Provider-assigned identifier for the queued generation.
    pub video_id: String,
}
