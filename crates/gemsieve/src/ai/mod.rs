//! Language-model transport: one `complete()` contract, three providers.
//!
//! Providers are selected by a `provider:name` tag (`ollama:mistral-nemo`,
//! `anthropic:claude-sonnet-4-5`, `openai:gpt-4o-mini`). Every client is
//! `Send + Sync` and safe for concurrent calls. The audit decorator in
//! [`audit`] wraps any client and records exact prompt/response pairs.

mod anthropic;
mod audit;
mod ollama;
mod openai;
pub mod prompts;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use audit::AuditingClient;

use crate::config::AiConfig;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("unknown AI provider `{0}` (expected ollama, openai, or anthropic)")]
    UnknownProvider(String),
    #[error("missing {0} API key")]
    MissingApiKey(&'static str),
    #[error("{provider} request failed: {source}")]
    Request {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} returned HTTP {status}")]
    HttpStatus { provider: &'static str, status: u16 },
    #[error("{provider} response missing completion text")]
    MalformedResponse { provider: &'static str },
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl AiError {
    /// Transport-level failures are retried; schema failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AiError::Request { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            AiError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// One rendered prompt on its way to a model. The template id and sender
/// domain ride along so the audit interceptor can record them without
/// re-deriving them from prompt text.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub model: String,
    pub json_mode: bool,
    pub template: &'static str,
    pub sender_domain: String,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError>;
}

/// Parse `provider:name`, defaulting the provider to ollama when no colon is
/// present. Returns the client plus the bare model name.
pub fn provider_for(
    model_spec: &str,
    config: &AiConfig,
) -> Result<(Arc<dyn CompletionClient>, String), AiError> {
    let (provider, model) = match model_spec.split_once(':') {
        Some((provider, model)) => (provider, model),
        None => ("ollama", model_spec),
    };

    let client: Arc<dyn CompletionClient> = match provider {
        "ollama" => Arc::new(ollama::OllamaClient::new(
            &config.ollama_base_url,
            &config.ollama_api_key,
        )?),
        "openai" => Arc::new(openai::OpenAiClient::from_env()?),
        "anthropic" => Arc::new(anthropic::AnthropicClient::from_env()?),
        other => return Err(AiError::UnknownProvider(other.to_string())),
    };
    Ok((client, model.to_string()))
}

/// Pull a JSON value out of a model response: direct parse first, then the
/// contents of a fenced code block.
pub fn extract_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let rest = &trimmed[start + fence.len()..];
            if let Some(end) = rest.find("```") {
                if let Ok(value) = serde_json::from_str::<Value>(rest[..end].trim()) {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_handles_bare_and_fenced_payloads() {
        let bare = r#"{"industry": "SaaS"}"#;
        assert_eq!(extract_json(bare).expect("bare")["industry"], "SaaS");

        let fenced = "Here you go:\n```json\n{\"industry\": \"SaaS\"}\n```";
        assert_eq!(extract_json(fenced).expect("fenced")["industry"], "SaaS");

        let plain_fence = "```\n{\"n\": 1}\n```";
        assert_eq!(extract_json(plain_fence).expect("plain")["n"], 1);

        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn provider_spec_defaults_to_ollama() {
        let config = AiConfig::default();
        let (_, model) = provider_for("mistral-nemo", &config).expect("bare spec");
        assert_eq!(model, "mistral-nemo");
        let (_, model) = provider_for("ollama:llama3", &config).expect("tagged spec");
        assert_eq!(model, "llama3");
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = AiConfig::default();
        assert!(matches!(
            provider_for("bard:gemini", &config),
            Err(AiError::UnknownProvider(_))
        ));
    }
}
