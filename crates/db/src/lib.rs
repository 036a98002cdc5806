//! Durable persistence for jobs, their audit trail, and the work queue.
//!
//! The [`store::JobStore`] and [`store::WorkQueue`] traits are the only
//! surface the pipeline sees. Two implementations ship here:
//! [`memory::MemoryStore`] for tests and local development, and
//! [`postgres::PgStore`] backed by sqlx conditional writes.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;
