//! OpenAI chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::warn;

use crate::ai::{AiError, CompletionClient, CompletionRequest};
use crate::constants::{TRANSPORT_MAX_ATTEMPTS, TRANSPORT_TIMEOUT_SECS};

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    backoff: ExponentialBuilder,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn from_env() -> Result<Self, AiError> {
        let api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| AiError::MissingApiKey("OPENAI_API_KEY"))?;
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

    async fn chat_once(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let mut messages = Vec::new();
        if !request.system.is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut payload = json!({
            "model": request.model,
            "messages": messages,
        });
        if request.json_mode {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
        let body: ChatResponse = response.json().await.map_err(|source| AiError::Request {
            provider: PROVIDER,
            source,
        })?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(AiError::MalformedResponse { provider: PROVIDER })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let attempt = || self.chat_once(request);
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
    async fn extracts_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "{\"industry\": \"Agency\"}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiClient::new(&server.uri(), "test-key").expect("client");
        let request = CompletionRequest {
            system: "json".to_string(),
            prompt: "classify".to_string(),
            model: "gpt-4o-mini".to_string(),
            json_mode: true,
            template: "CLASSIFICATION_PROMPT",
            sender_domain: "acme.com".to_string(),
        };
        let raw = client.complete(&request).await.expect("complete");
        assert!(raw.contains("Agency"));
    }
}
