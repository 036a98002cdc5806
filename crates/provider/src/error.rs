//! Error types for provider and publisher calls.

use coursecast_core::error_codes;

/// Errors from the generation provider.
///
/// All variants are currently retried via queue backoff; the taxonomy
/// still distinguishes them so callers can log and surface accurate
/// error codes, and so a fast-fail path can be added without touching
/// call sites.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider could not be reached or returned a server error.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The provider rejected the generation parameters.
    #[error("Provider rejected parameters: {0}")]
    InvalidParams(String),

    /// The provider quota is exhausted.
    #[error("Provider quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The provider returned a body that could not be parsed.
    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Machine-readable code stored on the job record.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProviderError::Unavailable(_) => error_codes::PROVIDER_UNAVAILABLE,
            ProviderError::InvalidParams(_) => error_codes::PROVIDER_INVALID_PARAMS,
            ProviderError::QuotaExceeded(_) => error_codes::PROVIDER_QUOTA_EXCEEDED,
            ProviderError::Malformed(_) => error_codes::PROVIDER_UNAVAILABLE,
        }
    }
}

/// Errors from publishing an artifact to durable storage.
///
/// Treated as non-fatal by the worker pool: the job completes with the
/// provider URL as a degraded fallback.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The storage endpoint could not be reached or refused the upload.
    #[error("Publish failed: {0}")]
    Upload(String),
}
