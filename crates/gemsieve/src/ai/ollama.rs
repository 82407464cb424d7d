//! Ollama HTTP client for local or self-hosted inference.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::warn;

use crate::ai::{AiError, CompletionClient, CompletionRequest};
use crate::constants::{TRANSPORT_MAX_ATTEMPTS, TRANSPORT_TIMEOUT_SECS};

const PROVIDER: &str = "ollama";

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    backoff: ExponentialBuilder,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

impl OllamaClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, AiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(TRANSPORT_TIMEOUT_SECS))
            .build()
            .map_err(AiError::ClientBuild)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            backoff: ExponentialBuilder::default().with_max_times(TRANSPORT_MAX_ATTEMPTS - 1),
        })
    }

    async fn generate_once(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let mut payload = json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": false,
        });
        if !request.system.is_empty() {
            payload["system"] = json!(request.system);
        }
        if request.json_mode {
            payload["format"] = json!("json");
        }

        let mut builder = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&payload);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder.send().await.map_err(|source| AiError::Request {
            provider: PROVIDER,
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AiError::HttpStatus {
                provider: PROVIDER,
                status: status.as_u16(),
            });
        }
        let body: GenerateResponse =
            response.json().await.map_err(|source| AiError::Request {
                provider: PROVIDER,
                source,
            })?;
        body.response
            .ok_or(AiError::MalformedResponse { provider: PROVIDER })
    }
}

#[async_trait]
impl CompletionClient for OllamaClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let attempt = || self.generate_once(request);
        attempt
            .retry(self.backoff.clone())
            .sleep(sleep)
            .when(AiError::is_transient)
            .notify(|err: &AiError, delay: Duration| {
                warn!(
                    provider = PROVIDER,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "retrying completion request"
                );
            })
            .await
    }
}
