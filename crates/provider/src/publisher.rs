//! Artifact publishing to durable storage.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::PublishError;

/// Default timeout for a publish call.
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(60);

/// Location of a published artifact on durable storage.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishedArtifact {
    /// Stable URL the dashboard can embed indefinitely.
    pub permanent_url: String,
    pub thumbnail_url: Option<String>,
}

/// Uploads a finished artifact from the provider's temporary URL to
/// durable storage, returning a stable URL.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    /// Publish the artifact at `source_url`.
    async fn publish(&self, source_url: &str) -> Result<PublishedArtifact, PublishError>;
}

/// HTTP implementation posting to a media-storage ingest endpoint.
pub struct HttpArtifactPublisher {
    client: reqwest::Client,
    ingest_url: String,
    timeout: Duration,
}

impl HttpArtifactPublisher {
    /// Create a publisher for the given ingest endpoint.
    pub fn new(ingest_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            ingest_url: ingest_url.into(),
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ArtifactPublisher for HttpArtifactPublisher {
    async fn publish(&self, source_url: &str) -> Result<PublishedArtifact, PublishError> {
        let body = serde_json::json!({ "source_url": source_url });

        let response = self
            .client
            .post(&self.ingest_url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::Upload(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(PublishError::Upload(format!("HTTP {status}: {text}")));
        }

        response
            .json()
            .await
            .map_err(|e| PublishError::Upload(format!("bad ingest response: {e}")))
    }
}
