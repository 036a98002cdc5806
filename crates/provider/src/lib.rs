//! Clients for the external generation provider and artifact storage.
//!
//! The pipeline only sees the [`client::ProviderClient`] and
//! [`publisher::ArtifactPublisher`] traits; the HTTP implementations
//! here are what the worker binary wires in.

pub mod client;
pub mod error;
pub mod http;
pub mod publisher;
pub mod types;
