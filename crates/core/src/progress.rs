//! Progress estimation and monotonicity helpers.
//!
//! Providers rarely report fine-grained progress, so the poller derives
//! a coarse estimate from the number of polls performed. Progress on a
//! job is monotonically non-decreasing until a terminal status sets it
//! to its final value.

/// Ceiling for poll-derived progress; only completion reaches 100.
pub const MAX_POLL_PROGRESS: i16 = 95;

/// Progress value recorded when a job completes.
pub const PROGRESS_COMPLETE: i16 = 100;

/// Estimate progress from the number of provider polls performed.
///
/// Grows two points per poll and saturates at [`MAX_POLL_PROGRESS`].
pub fn poll_progress_estimate(poll_count: u32) -> i16 {
    let estimate = poll_count.saturating_mul(2).min(MAX_POLL_PROGRESS as u32);
    estimate as i16
}

/// Apply the monotonicity rule: progress never moves backwards.
pub fn advance_progress(current: i16, candidate: i16) -> i16 {
    candidate.max(current)
}
