//! Declarative ESP fingerprinting.
//!
//! A sender matches the first rule whose signals ALL hold against its
//! headers. Rules come from a YAML file when configured, otherwise from the
//! built-in table. Senders signing DKIM with their own root domain fall back
//! to `custom_smtp` at low confidence.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

pub const CUSTOM_SMTP: &str = "custom_smtp";

#[derive(Debug, Clone, Deserialize)]
pub struct EspRule {
    pub name: String,
    pub confidence: String,
    pub signals: Vec<EspSignal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EspSignal {
    ReturnPathContains(String),
    DkimDomainEquals(String),
    HeaderPresent(String),
    TrackingDomainPresent(String),
    XMailerContains(String),
}

/// Load rules from a YAML list, or fall back to the built-in table when the
/// path is unset or missing.
pub fn load_rules(path: Option<&Path>) -> Vec<EspRule> {
    if let Some(path) = path {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(rules) = serde_yaml::from_str::<Vec<EspRule>>(&raw) {
                return rules;
            }
        }
    }
    default_rules()
}

/// Match headers (lowercase keys) against the rule set.
pub fn match_esp(
    headers: &HashMap<String, Vec<String>>,
    sender_root: &str,
    rules: &[EspRule],
) -> Option<(String, String)> {
    for rule in rules {
        if !rule.signals.is_empty() && rule.signals.iter().all(|s| signal_holds(s, headers)) {
            return Some((rule.name.clone(), rule.confidence.clone()));
        }
    }

    // Own-domain DKIM with no ESP fingerprint reads as self-hosted mail.
    if !sender_root.is_empty() {
        let dkim = header_str(headers, "dkim-signature");
        if dkim.contains(&format!("d={sender_root}")) {
            return Some((CUSTOM_SMTP.to_string(), "low".to_string()));
        }
    }
    None
}

fn signal_holds(signal: &EspSignal, headers: &HashMap<String, Vec<String>>) -> bool {
    match signal {
        EspSignal::ReturnPathContains(needle) => {
            header_str(headers, "return-path").contains(&needle.to_ascii_lowercase())
        }
        EspSignal::DkimDomainEquals(domain) => header_str(headers, "dkim-signature")
            .contains(&format!("d={}", domain.to_ascii_lowercase())),
        EspSignal::HeaderPresent(name) => headers
            .get(&name.to_ascii_lowercase())
            .is_some_and(|values| !values.is_empty()),
        EspSignal::TrackingDomainPresent(domain) => {
            let needle = domain.to_ascii_lowercase();
            headers
                .values()
                .flatten()
                .any(|value| value.to_ascii_lowercase().contains(&needle))
        }
        EspSignal::XMailerContains(needle) => {
            header_str(headers, "x-mailer").contains(&needle.to_ascii_lowercase())
        }
    }
}

fn header_str(headers: &HashMap<String, Vec<String>>, name: &str) -> String {
    headers
        .get(name)
        .map(|values| values.join(" ").to_ascii_lowercase())
        .unwrap_or_default()
}

fn rule(name: &str, confidence: &str, signals: Vec<EspSignal>) -> EspRule {
    EspRule {
        name: name.to_string(),
        confidence: confidence.to_string(),
        signals,
    }
}

pub fn default_rules() -> Vec<EspRule> {
    use EspSignal::*;
    vec![
        rule("HubSpot", "high", vec![ReturnPathContains("hubspotemail.net".into())]),
        rule("Salesforce", "high", vec![ReturnPathContains("exacttarget.com".into())]),
        rule("Klaviyo", "high", vec![ReturnPathContains("klaviyomail.com".into())]),
        rule(
            "ActiveCampaign",
            "high",
            vec![ReturnPathContains("acemsrvc.com".into())],
        ),
        rule("Marketo", "high", vec![ReturnPathContains("mktomail.com".into())]),
        rule("Pardot", "high", vec![ReturnPathContains("pardot.com".into())]),
        rule("Mailchimp", "high", vec![ReturnPathContains("mcsv.net".into())]),
        rule("Mailchimp", "medium", vec![XMailerContains("mailchimp".into())]),
        rule("SendGrid", "high", vec![ReturnPathContains("sendgrid.net".into())]),
        rule("Postmark", "high", vec![HeaderPresent("x-pm-message-id".into())]),
        rule(
            "ConvertKit",
            "medium",
            vec![ReturnPathContains("convertkit".into())],
        ),
        rule(
            "Constant Contact",
            "high",
            vec![ReturnPathContains("constantcontact.com".into())],
        ),
        rule("Mailgun", "high", vec![ReturnPathContains("mailgun.org".into())]),
        rule("amazon_ses", "medium", vec![ReturnPathContains("amazonses.com".into())]),
        rule("SparkPost", "medium", vec![ReturnPathContains("sparkpostmail.com".into())]),
    ]
}

/// ESPs whose presence signals an enterprise-grade marketing stack.
pub fn esp_tier(esp: Option<&str>) -> u8 {
    match esp {
        Some("HubSpot") | Some("Salesforce") | Some("Klaviyo") | Some("ActiveCampaign")
        | Some("Marketo") | Some("Pardot") => 3,
        Some("SendGrid") | Some("Mailchimp") | Some("ConvertKit") | Some("Postmark")
        | Some("Constant Contact") | Some("Mailgun") | Some("amazon_ses") | Some("SparkPost") => 2,
        _ => 1,
    }
}
