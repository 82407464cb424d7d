//! Anthropic messages-API client.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::warn;

use crate::ai::{AiError, CompletionClient, CompletionRequest};
use crate::constants::{TRANSPORT_MAX_ATTEMPTS, TRANSPORT_TIMEOUT_SECS};

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    backoff: ExponentialBuilder,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicClient {
    pub fn from_env() -> Result<Self, AiError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| AiError::MissingApiKey("ANTHROPIC_API_KEY"))?;
        Self::new(DEFAULT_BASE_URL, &api_key)
    }

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

    async fn message_once(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let mut payload = json!({
            "model": request.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": request.prompt}],
        });
        if !request.system.is_empty() {
            payload["system"] = json!(request.system);
        }

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|source| AiError::Request {
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
        let body: MessagesResponse =
            response.json().await.map_err(|source| AiError::Request {
                provider: PROVIDER,
                source,
            })?;
        let text: String = body
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect();
        if text.is_empty() {
            return Err(AiError::MalformedResponse { provider: PROVIDER });
        }
        Ok(text)
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let attempt = || self.message_once(request);
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

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn concatenates_text_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [
                    {"type": "text", "text": "{\"subject_line\": "},
                    {"type": "text", "text": "\"hello\"}"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = AnthropicClient::new(&server.uri(), "test-key").expect("client");
        let request = CompletionRequest {
            system: "engagement".to_string(),
            prompt: "write".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            json_mode: false,
            template: "ENGAGEMENT_PROMPT",
            sender_domain: "acme.com".to_string(),
        };
        let raw = client.complete(&request).await.expect("complete");
        assert_eq!(raw, "{\"subject_line\": \"hello\"}");
    }
}
