//! Header forensics: ESP fingerprinting, authentication verdicts, infra
//! fields, domain normalization, and the per-domain temporal rollup.

use std::collections::HashMap;

use chrono::{Datelike, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::domains::{address_host, organizational_root};
use crate::esp::{self, EspRule};
use crate::mail::thread_state::parse_date;
use crate::models::{Message, ParsedMetadata, SenderTemporal};
use crate::stages::{CancelToken, StageError, StageReport};
use crate::store::Store;

static ANGLE_ADDR: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^>]+)>").expect("angle addr"));
static DKIM_DOMAIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"d=([^\s;]+)").expect("dkim domain"));
static RECEIVED_IP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\]").expect("received ip"));
static RECEIVED_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)from\s+([A-Za-z0-9.-]+)").expect("received host"));
static UNSUB_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"<(https?://[^>]+)>").expect("unsub url"));
static UNSUB_MAILTO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<mailto:([^>?]+)[^>]*>").expect("unsub mailto"));

pub fn run(store: &Store, rules: &[EspRule], cancel: &CancelToken) -> Result<StageReport, StageError> {
    let mut report = StageReport::default();
    let pending = store.messages_without_metadata()?;

    for message in pending {
        cancel.check()?;
        let meta = extract_one(&message, rules);
        store.upsert_parsed_metadata(&meta)?;
        report.processed += 1;
    }

    rollup_sender_temporal(store)?;
    Ok(report)
}

/// One parsed-metadata row from a message's raw headers.
pub fn extract_one(message: &Message, rules: &[EspRule]) -> ParsedMetadata {
    let headers = lowercase_headers(&message.headers_raw);

    let raw_host = address_host(&message.from_address);
    let sender_domain = organizational_root(&raw_host);

    let envelope_sender = headers.get("return-path").and_then(|values| {
        values.first().map(|raw| {
            ANGLE_ADDR
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| raw.trim().to_string())
        })
    });

    let esp = esp::match_esp(&headers, &sender_domain, rules);
    let (esp_identified, esp_confidence) = match esp {
        Some((name, confidence)) => (Some(name), Some(confidence)),
        None => (None, None),
    };

    let dkim_domain = headers
        .get("dkim-signature")
        .and_then(|values| values.first())
        .and_then(|raw| DKIM_DOMAIN.captures(raw))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let spf_result = auth_result(&headers, "spf");
    let dmarc_result = auth_result(&headers, "dmarc");

    // The outermost Received header carries the originating hop.
    let (mail_server, sending_ip) = headers
        .get("received")
        .and_then(|values| values.last())
        .map(|raw| {
            let ip = RECEIVED_IP
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            let host = RECEIVED_HOST
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            (host, ip)
        })
        .unwrap_or((None, None));

    let (list_unsubscribe_url, list_unsubscribe_email) = headers
        .get("list-unsubscribe")
        .and_then(|values| values.first())
        .map(|raw| {
            let url = UNSUB_URL
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            let mailto = UNSUB_MAILTO
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            (url, mailto)
        })
        .unwrap_or((None, None));

    let precedence = headers
        .get("precedence")
        .and_then(|values| values.first())
        .map(|v| v.trim().to_ascii_lowercase());
    let bulk_precedence = matches!(precedence.as_deref(), Some("bulk" | "list" | "junk"));
    let marketing_esp = matches!(
        esp_identified.as_deref(),
        Some(name) if name != esp::CUSTOM_SMTP && esp::esp_tier(Some(name)) >= 2
    );
    let is_bulk = bulk_precedence || list_unsubscribe_url.is_some() || marketing_esp;

    ParsedMetadata {
        message_id: message.message_id.clone(),
        sender_domain,
        sender_subdomain: raw_host,
        envelope_sender,
        esp_identified,
        esp_confidence,
        dkim_domain,
        spf_result,
        dmarc_result,
        sending_ip,
        mail_server,
        x_mailer: headers
            .get("x-mailer")
            .and_then(|values| values.first())
            .map(|v| v.trim().to_string()),
        precedence,
        feedback_id: headers
            .get("feedback-id")
            .and_then(|values| values.first())
            .map(|v| v.trim().to_string()),
        list_unsubscribe_url,
        list_unsubscribe_email,
        is_bulk,
    }
}

fn lowercase_headers(headers: &HashMap<String, Vec<String>>) -> HashMap<String, Vec<String>> {
    headers
        .iter()
        .map(|(name, values)| (name.to_ascii_lowercase(), values.clone()))
        .collect()
}

/// SPF/DMARC verdicts from Authentication-Results, with Received-SPF as a
/// secondary source for SPF.
fn auth_result(headers: &HashMap<String, Vec<String>>, protocol: &str) -> Option<String> {
    let pattern = Regex::new(&format!(r"(?i){protocol}=(\w+)")).expect("auth pattern");
    if let Some(values) = headers.get("authentication-results") {
        for value in values {
            if let Some(captures) = pattern.captures(value) {
                return Some(captures[1].to_ascii_lowercase());
            }
        }
    }
    if protocol == "spf" {
        if let Some(values) = headers.get("received-spf") {
            if let Some(first) = values.first() {
                let verdict = first.trim().split_whitespace().next()?.to_ascii_lowercase();
                if matches!(
                    verdict.as_str(),
                    "pass" | "fail" | "softfail" | "neutral" | "none" | "temperror" | "permerror"
                ) {
                    return Some(verdict);
                }
            }
        }
    }
    None
}

/// Recompute `sender_temporal` for every domain: counts, span, mean gap
/// between consecutive messages, and modal send hour/weekday.
fn rollup_sender_temporal(store: &Store) -> Result<(), StageError> {
    let mut by_domain: HashMap<String, Vec<chrono::DateTime<chrono::Utc>>> = HashMap::new();
    for (domain, date) in store.message_dates_by_domain()? {
        if let Some(parsed) = parse_date(&date) {
            by_domain.entry(domain).or_default().push(parsed);
        }
    }

    for (domain, mut dates) in by_domain {
        dates.sort();
        let total = dates.len() as i64;
        let first_seen = dates.first().map(|d| d.to_rfc3339());
        let last_seen = dates.last().map(|d| d.to_rfc3339());

        let avg_frequency_days = if dates.len() > 1 {
            let gaps: i64 = dates.windows(2).map(|w| (w[1] - w[0]).num_days()).sum();
            Some(gaps as f64 / (dates.len() - 1) as f64)
        } else {
            None
        };

        let most_common_send_hour = modal(dates.iter().map(|d| d.hour() as i64));
        let most_common_send_day =
            modal(dates.iter().map(|d| d.weekday().num_days_from_monday() as i64));

        store.upsert_sender_temporal(&SenderTemporal {
            sender_domain: domain,
            first_seen,
            last_seen,
            total_messages: total,
            avg_frequency_days,
            most_common_send_hour,
            most_common_send_day,
        })?;
    }
    Ok(())
}

fn modal(values: impl Iterator<Item = i64>) -> Option<i64> {
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for value in values {
        *counts.entry(value).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(value, count)| (*count, -*value))
        .map(|(value, _)| value)
}
