//! Machine-readable error code constants.
//!
//! Stored in `Job.error_code` and surfaced unchanged through the status
//! read model so dashboard clients can branch without parsing messages.

/// The provider rejected or could not accept a submission.
pub const PROVIDER_UNAVAILABLE: &str = "provider_unavailable";

/// The provider rejected the generation parameters.
pub const PROVIDER_INVALID_PARAMS: &str = "provider_invalid_params";

/// The provider quota was exhausted.
pub const PROVIDER_QUOTA_EXCEEDED: &str = "provider_quota_exceeded";

/// The provider reported the generation itself failed.
pub const GENERATION_FAILED: &str = "generation_failed";

/// The reconciliation poller ran out of polling budget.
pub const POLLING_TIMEOUT: &str = "polling_timeout";

/// Publishing the artifact to durable storage failed (non-fatal).
pub const PUBLISH_FAILED: &str = "publish_failed";

/// Retries were exhausted without a successful outcome.
pub const RETRIES_EXHAUSTED: &str = "retries_exhausted";
