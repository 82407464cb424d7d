//! Audit interceptor: a `CompletionClient` decorator that records every call
//! under the current pipeline run.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

use crate::ai::{AiError, CompletionClient, CompletionRequest, extract_json};
use crate::store::{NewAuditEntry, Store};

pub struct AuditingClient {
    inner: Arc<dyn CompletionClient>,
    store: Mutex<Store>,
    run_id: i64,
    stage: String,
}

impl AuditingClient {
    pub fn new(inner: Arc<dyn CompletionClient>, store: Store, run_id: i64, stage: &str) -> Self {
        Self {
            inner,
            store: Mutex::new(store),
            run_id,
            stage: stage.to_string(),
        }
    }

    fn record(&self, request: &CompletionRequest, raw: &str, duration_ms: i64) {
        let parsed = extract_json(raw).map(|value| value.to_string());
        let entry = NewAuditEntry {
            pipeline_run_id: self.run_id,
            stage: self.stage.clone(),
            sender_domain: request.sender_domain.clone(),
            prompt_template: request.template.to_string(),
            prompt_rendered: request.prompt.clone(),
            system_prompt: request.system.clone(),
            model_used: request.model.clone(),
            response_raw: raw.to_string(),
            response_parsed: parsed,
            duration_ms,
        };
        let result = match self.store.lock() {
            Ok(store) => store.insert_audit_entry(&entry).map(|_| ()),
            Err(_) => return,
        };
        // Audit logging must never fail the pipeline.
        if let Err(error) = result {
            warn!(run_id = self.run_id, stage = %self.stage, %error, "audit log write failed");
        }
    }
}

#[async_trait]
impl CompletionClient for AuditingClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let start = Instant::now();
        let raw = self.inner.complete(request).await?;
        let duration_ms = start.elapsed().as_millis() as i64;
        self.record(request, &raw, duration_ms);
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedClient(&'static str);

    #[async_trait]
    impl CompletionClient for CannedClient {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, AiError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn records_prompt_and_parsed_response() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.db");
        let store = Store::open(&path).expect("store");
        let run_id = store.create_run("classify", "web", None).expect("run");

        let client = AuditingClient::new(
            Arc::new(CannedClient("{\"industry\": \"SaaS\"}")),
            store,
            run_id,
            "classify",
        );
        let request = CompletionRequest {
            system: "json only".to_string(),
            prompt: "Classify this sender.".to_string(),
            model: "mistral-nemo".to_string(),
            json_mode: true,
            template: "CLASSIFICATION_PROMPT",
            sender_domain: "acme.com".to_string(),
        };
        client.complete(&request).await.expect("complete");

        let check = Store::open(&path).expect("reopen");
        let entries = check.list_audit_entries(None, 10, 0).expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].prompt_template, "CLASSIFICATION_PROMPT");
        assert_eq!(entries[0].sender_domain, "acme.com");
        assert_eq!(entries[0].prompt_rendered, "Classify this sender.");
        assert!(entries[0].response_parsed.as_deref().unwrap().contains("SaaS"));
    }
}
