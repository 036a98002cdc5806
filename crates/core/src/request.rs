//! Submission payload for a generation job.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;

/// Parameters for one video-generation request.
///
/// Validated before the job is created; an invalid request never reaches
/// the queue. Scripts are capped at 8,000 characters and target durations
/// at 5..=600 seconds.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GenerationParams {
    /// Narration script the avatar will speak.
    #[validate(length(min = 1, max = 8000))]
    pub script: String,

    /// Provider-side avatar identifier.
    #[validate(length(min = 1, max = 64))]
    pub avatar_id: String,

    /// Optional provider-side voice identifier.
    #[validate(length(min = 1, max = 64))]
    pub voice_id: Option<String>,

    /// Optional target duration in seconds.
    #[validate(range(min = 5, max = 600))]
    pub target_duration_secs: Option<u32>,
}

impl GenerationParams {
    /// Validate the request, mapping field errors into [`CoreError`].
    pub fn check(&self) -> Result<(), CoreError> {
        self.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))
    }
}
