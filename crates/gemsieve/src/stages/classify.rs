//! AI sender classification with override layering and few-shot retrain.
//!
//! Messages are grouped by sender domain; one call classifies the domain's
//! most recent messages and the result is copied to every message from that
//! domain. Overrides pre-fill fields before the call and outrank the model
//! afterwards; message-scope overrides outrank sender-scope.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::ai::prompts::{CLASSIFICATION_PROMPT, CLASSIFICATION_PROMPT_ID, CLASSIFICATION_SYSTEM, render};
use crate::ai::{CompletionClient, CompletionRequest, extract_json};
use crate::models::Classification;
use crate::stages::{CancelToken, StageError, StageReport};
use crate::store::{ClassifyInput, Store};

/// How many recent messages inform one domain classification.
const SAMPLE_SIZE: usize = 3;
const ENTITY_SUMMARY_LIMIT: usize = 20;
const RETRAIN_EXAMPLE_LIMIT: usize = 10;

/// Fields an override may target; when every one of them is overridden the
/// AI call is skipped entirely.
const OVERRIDABLE_FIELDS: [&str; 7] = [
    "industry",
    "company_size_estimate",
    "marketing_sophistication",
    "sender_intent",
    "product_type",
    "product_description",
    "target_audience",
];

pub struct ClassifyOptions {
    pub model_spec: String,
    pub model: String,
    pub max_body_chars: usize,
    pub retrain: bool,
}

pub async fn run(
    store: &Store,
    client: &dyn CompletionClient,
    options: &ClassifyOptions,
    cancel: &CancelToken,
) -> Result<StageReport, StageError> {
    let mut report = StageReport::default();
    let pending = store.unclassified_messages()?;
    if pending.is_empty() {
        return Ok(report);
    }

    let few_shot = if options.retrain {
        build_few_shot_block(store)?
    } else {
        String::new()
    };

    // Rows arrive ordered by domain, newest first within a domain.
    let mut by_domain: Vec<(String, Vec<ClassifyInput>)> = Vec::new();
    for row in pending {
        match by_domain.last_mut() {
            Some((domain, rows)) if *domain == row.sender_domain => rows.push(row),
            _ => by_domain.push((row.sender_domain.clone(), vec![row])),
        }
    }

    for (domain, rows) in by_domain {
        cancel.check()?;

        let sender_overrides = store.sender_overrides(&domain)?;
        let sample: Vec<&ClassifyInput> = rows.iter().take(SAMPLE_SIZE).collect();
        let representative = sample[0];

        let fully_overridden = OVERRIDABLE_FIELDS
            .iter()
            .all(|field| sender_overrides.contains_key(*field));

        let base = if fully_overridden {
            Value::Object(serde_json::Map::new())
        } else {
            let message_ids: Vec<String> =
                sample.iter().map(|r| r.message_id.clone()).collect();
            let entity_summary = entity_summary(store, &message_ids)?;
            let prompt = build_prompt(
                representative,
                &entity_summary,
                options.max_body_chars,
                &few_shot,
            );
            let request = CompletionRequest {
                system: CLASSIFICATION_SYSTEM.to_string(),
                prompt,
                model: options.model.clone(),
                json_mode: true,
                template: CLASSIFICATION_PROMPT_ID,
                sender_domain: domain.clone(),
            };
            match client.complete(&request).await {
                Ok(raw) => match extract_json(&raw) {
                    Some(value) => value,
                    None => {
                        warn!(domain, "classification response was not valid JSON");
                        report.record_item_error(format!("{domain}: invalid JSON response"));
                        continue;
                    }
                },
                Err(error) => {
                    warn!(domain, %error, "classification call failed");
                    report.record_item_error(format!("{domain}: {error}"));
                    continue;
                }
            }
        };

        for row in &rows {
            let message_overrides = store.message_overrides(&row.message_id)?;
            let classification = merge_classification(
                &row.message_id,
                &base,
                &sender_overrides,
                &message_overrides,
                &options.model_spec,
            );
            store.upsert_classification(&classification)?;
            report.processed += 1;
        }
    }

    Ok(report)
}

fn build_prompt(
    row: &ClassifyInput,
    entity_summary: &str,
    max_body_chars: usize,
    few_shot: &str,
) -> String {
    let body: String = row.body_clean.chars().take(max_body_chars).collect();
    let vars = HashMap::from([
        ("from_name", row.from_name.clone()),
        ("from_address", row.from_address.clone()),
        ("subject", row.subject.clone()),
        (
            "esp_identified",
            row.esp_identified.clone().unwrap_or_else(|| "unknown".to_string()),
        ),
        ("offer_types", row.offer_types.join(", ")),
        ("cta_texts", row.cta_texts.join(", ")),
        ("extracted_entities_summary", entity_summary.to_string()),
        ("max_body_chars", max_body_chars.to_string()),
        ("body_clean", body),
    ]);
    let mut prompt = render(CLASSIFICATION_PROMPT, &vars);
    prompt.push_str(few_shot);
    prompt
}

fn entity_summary(store: &Store, message_ids: &[String]) -> Result<String, StageError> {
    let entities = store.entities_for_messages(message_ids)?;
    if entities.is_empty() {
        return Ok("None".to_string());
    }
    let parts: Vec<String> = entities
        .iter()
        .take(ENTITY_SUMMARY_LIMIT)
        .map(|e| format!("{}: {}", e.entity_type, e.entity_value))
        .collect();
    Ok(parts.join("; "))
}

/// Corrections block appended to the prompt in retrain mode, built from the
/// most recent overrides as few-shot guidance.
fn build_few_shot_block(store: &Store) -> Result<String, StageError> {
    let recent = store.recent_overrides(RETRAIN_EXAMPLE_LIMIT)?;
    if recent.is_empty() {
        return Ok(String::new());
    }
    let mut block =
        String::from("\n\nPrevious classification corrections (use these to improve accuracy):\n");
    for override_row in recent {
        let domain = override_row.sender_domain.as_deref().unwrap_or("unknown");
        let original = override_row.original_value.as_deref().unwrap_or("unknown");
        block.push_str(&format!(
            "CORRECTION: For sender domain '{domain}', the {} was classified as '{original}' but should be '{}'.\n",
            override_row.field_name, override_row.corrected_value,
        ));
    }
    Ok(block)
}

fn merge_classification(
    message_id: &str,
    ai: &Value,
    sender_overrides: &HashMap<String, String>,
    message_overrides: &HashMap<String, String>,
    model_spec: &str,
) -> Classification {
    let field = |name: &str| -> String {
        if let Some(value) = message_overrides.get(name) {
            return value.clone();
        }
        if let Some(value) = sender_overrides.get(name) {
            return value.clone();
        }
        ai.get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let numeric_field = |name: &str| -> i64 {
        if let Some(value) = message_overrides.get(name).or_else(|| sender_overrides.get(name)) {
            return value.parse().unwrap_or(0);
        }
        ai.get(name).and_then(Value::as_i64).unwrap_or(0)
    };

    let pain_points = ai
        .get("pain_points_addressed")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let has_override = !sender_overrides.is_empty() || !message_overrides.is_empty();

    Classification {
        message_id: message_id.to_string(),
        industry: field("industry"),
        company_size_estimate: field("company_size_estimate"),
        marketing_sophistication: numeric_field("marketing_sophistication"),
        sender_intent: field("sender_intent"),
        product_type: field("product_type"),
        product_description: field("product_description"),
        pain_points,
        target_audience: field("target_audience"),
        partner_program_detected: ai
            .get("partner_program_detected")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        renewal_signal_detected: ai
            .get("renewal_signal_detected")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        ai_confidence: ai.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
        model_used: model_spec.to_string(),
        has_override,
    }
}
