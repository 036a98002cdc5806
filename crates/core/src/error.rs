//! Domain-level error type shared across the workspace.

/// Errors raised by domain logic in this crate and its consumers.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A referenced entity does not exist.
    #[error("{entity} with id {id} not found")]
    NotFound {
        /// Entity kind, e.g. `"job"`.
        entity: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// Input failed validation and was rejected before any side effect.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation conflicts with current state (e.g. duplicate id).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a job-not-found error.
    pub fn job_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity: "job",
            id: id.into(),
        }
    }
}
