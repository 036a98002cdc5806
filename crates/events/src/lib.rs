//! Live status fan-out for the job pipeline.
//!
//! [`bus::EventBus`] is the in-process broadcast hub the worker pool and
//! reconciliation publish to; [`stream::StatusStream`] turns it (plus a
//! store poll as a staleness bound) into a per-job subscription channel.

pub mod bus;
pub mod stream;
