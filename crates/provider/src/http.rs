//! HTTP implementation of [`ProviderClient`] using [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use coursecast_core::request::GenerationParams;

use crate::client::ProviderClient;
use crate::error::ProviderError;
use crate::types::{ProviderPollResponse, SubmitResponse};

/// Default timeout for a submission request.
const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a status poll.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the generation provider's REST API.
pub struct HttpProviderClient {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    submit_timeout: Duration,
    poll_timeout: Duration,
}

impl HttpProviderClient {
    /// Create a client for the given base URL, e.g. `https://api.provider.com`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: None,
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Attach a bearer token sent with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Override both per-call timeouts.
    pub fn with_timeouts(mut self, submit: Duration, poll: Duration) -> Self {
        self.submit_timeout = submit;
        self.poll_timeout = poll;
        self
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Map an HTTP status + body to the provider error taxonomy.
    async fn classify_failure(response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());

        if status.as_u16() == 429 {
            ProviderError::QuotaExceeded(body)
        } else if status.is_client_error() {
            ProviderError::InvalidParams(format!("HTTP {status}: {body}"))
        } else {
            ProviderError::Unavailable(format!("HTTP {status}: {body}"))
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn submit(&self, params: &GenerationParams) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "script": params.script,
            "avatar_id": params.avatar_id,
            "voice_id": params.voice_id,
            "target_duration_secs": params.target_duration_secs,
        });

        let response = self
            .authorize(self.client.post(format!("{}/v1/videos", self.api_url)))
            .timeout(self.submit_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let accepted: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        tracing::info!(
            provider_job_id = %accepted.video_id,
            avatar_id = %params.avatar_id,
            "Generation submitted to provider",
        );
        Ok(accepted.video_id)
    }

    async fn poll_status(
        &self,
        provider_job_id: &str,
    ) -> Result<ProviderPollResponse, ProviderError> {
        let response = self
            .authorize(
                self.client
                    .get(format!("{}/v1/videos/{provider_job_id}", self.api_url)),
            )
            .timeout(self.poll_timeout)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}
