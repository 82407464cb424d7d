//! Entity extraction: NER spans plus regex-sourced money, dates, roles,
//! phones, URLs, and procurement signals.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::EntityConfig;
use crate::mail::thread_state::parse_date;
use crate::models::{EntitySource, EntityType, ExtractedEntity, Message, ParsedContent};
use crate::ner::NerTagger;
use crate::stages::{CancelToken, StageError, StageReport};
use crate::store::Store;

const NER_TEXT_LIMIT: usize = 50_000;
const CONTEXT_WINDOW: usize = 50;

pub async fn run(
    store: &Store,
    config: &EntityConfig,
    tagger: Option<&dyn NerTagger>,
    cancel: &CancelToken,
) -> Result<StageReport, StageError> {
    let mut report = StageReport::default();

    for (message, content) in store.messages_without_entities()? {
        cancel.check()?;
        match extract_for_message(&message, &content, config, tagger).await {
            Ok(entities) => {
                store.replace_entities(&message.message_id, &entities)?;
                report.processed += 1;
            }
            Err(error) => report.record_item_error(error),
        }
    }
    Ok(report)
}

async fn extract_for_message(
    message: &Message,
    content: &ParsedContent,
    config: &EntityConfig,
    tagger: Option<&dyn NerTagger>,
) -> Result<Vec<ExtractedEntity>, StageError> {
    let mut entities = Vec::new();
    let body = &content.body_clean;
    let signature = content.signature_block.as_deref().unwrap_or("");

    if let Some(tagger) = tagger {
        let ner_text: String = body.chars().take(NER_TEXT_LIMIT).collect();
        if !ner_text.trim().is_empty() {
            for span in tagger.tag(&ner_text).await? {
                let Some(entity_type) = map_ner_label(&span.label) else {
                    continue;
                };
                let value = slice_span(&ner_text, span.start, span.end);
                if value.is_empty() {
                    continue;
                }
                entities.push(ExtractedEntity {
                    message_id: message.message_id.clone(),
                    entity_type,
                    entity_value: value.clone(),
                    entity_normalized: Some(value.trim().to_string()),
                    context: Some(context_around(&ner_text, span.start, span.end)),
                    confidence: span.confidence,
                    source: EntitySource::Spacy,
                });
            }
        }
        if !signature.trim().is_empty() {
            for span in tagger.tag(signature).await? {
                let Some(entity_type) = map_ner_label(&span.label) else {
                    continue;
                };
                if !matches!(entity_type, EntityType::Person | EntityType::Organization) {
                    continue;
                }
                let value = slice_span(signature, span.start, span.end);
                if value.is_empty() {
                    continue;
                }
                entities.push(ExtractedEntity {
                    message_id: message.message_id.clone(),
                    entity_type,
                    entity_value: value.clone(),
                    entity_normalized: Some(value.trim().to_string()),
                    context: Some("signature".to_string()),
                    confidence: span.confidence.max(0.9),
                    source: EntitySource::Spacy,
                });
            }
        }
    }

    // Sender as a person entity with relationship classification.
    if !message.from_name.is_empty() {
        let relationship = classify_person_relationship("", &message.from_address);
        entities.push(ExtractedEntity {
            message_id: message.message_id.clone(),
            entity_type: EntityType::Person,
            entity_value: message.from_name.clone(),
            entity_normalized: Some(message.from_name.trim().to_string()),
            context: Some(format!(
                "From: {} <{}> ({relationship})",
                message.from_name, message.from_address
            )),
            confidence: 1.0,
            source: EntitySource::Header,
        });
    }

    // CC addresses become low-confidence person entities.
    for cc in &message.cc_addresses {
        if cc.is_empty() {
            continue;
        }
        let relationship = classify_person_relationship("", cc);
        entities.push(ExtractedEntity {
            message_id: message.message_id.clone(),
            entity_type: EntityType::Person,
            entity_value: cc.clone(),
            entity_normalized: Some(cc.trim().to_string()),
            context: Some(format!("CC: <{cc}> ({relationship})")),
            confidence: 0.6,
            source: EntitySource::Header,
        });
    }

    let search_text = format!("{body} {}", message.subject);
    if config.extract_monetary {
        entities.extend(extract_monetary(&message.message_id, &search_text));
    }
    if config.extract_dates {
        entities.extend(extract_dates(&message.message_id, body));
    }
    if config.extract_procurement {
        entities.extend(extract_procurement(&message.message_id, body));
    }
    entities.extend(extract_roles(&message.message_id, signature, &message.from_name));
    entities.extend(extract_phones(&message.message_id, signature));
    entities.extend(extract_urls(&message.message_id, body));

    Ok(entities)
}

fn map_ner_label(label: &str) -> Option<EntityType> {
    match label {
        "PERSON" => Some(EntityType::Person),
        "ORG" | "GPE" => Some(EntityType::Organization),
        "MONEY" => Some(EntityType::Money),
        "DATE" => Some(EntityType::Date),
        _ => None,
    }
}

fn slice_span(text: &str, start: usize, end: usize) -> String {
    text.get(start..end).unwrap_or("").trim().to_string()
}

fn context_around(text: &str, start: usize, end: usize) -> String {
    let from = start.saturating_sub(CONTEXT_WINDOW);
    let to = (end + CONTEXT_WINDOW).min(text.len());
    // Walk to char boundaries so the window never splits a code point.
    let from = (0..=from).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
    let to = (to..=text.len()).find(|i| text.is_char_boundary(*i)).unwrap_or(text.len());
    text[from..to].trim().to_string()
}

static AUTOMATED_LOCAL_PARTS: [&str; 9] = [
    "noreply", "no-reply", "donotreply", "notifications", "mailer-daemon", "bounce", "automated",
    "system", "alerts",
];
static DECISION_MAKER_TITLES: [&str; 13] = [
    "ceo", "cto", "cfo", "coo", "cmo", "founder", "co-founder", "president", "vp",
    "vice president", "director", "head of", "partner",
];
static VENDOR_LOCAL_PARTS: [&str; 5] = ["sales", "support", "billing", "account", "success"];

/// decision_maker | automated | vendor_contact | peer, from the title (when
/// known) and the address local part.
pub fn classify_person_relationship(role: &str, address: &str) -> &'static str {
    let local = address
        .split('@')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if AUTOMATED_LOCAL_PARTS.iter().any(|p| local.contains(p)) {
        return "automated";
    }
    let role_lower = role.to_ascii_lowercase();
    if DECISION_MAKER_TITLES.iter().any(|t| role_lower.contains(t)) {
        return "decision_maker";
    }
    if VENDOR_LOCAL_PARTS.iter().any(|p| local.contains(p)) {
        return "vendor_contact";
    }
    "peer"
}

static MONEY_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"\$[\d,]+(?:\.\d{2})?").expect("usd amount"),
            "USD amount",
        ),
        (
            Regex::new(r"(?i)\d+[k]?\s*(?:ARR|MRR|/mo|/yr)").expect("saas metric"),
            "SaaS metric",
        ),
        (
            Regex::new(r"(?i)\d+%\s*(?:off|discount|commission|revenue share)").expect("pct offer"),
            "percentage offer",
        ),
    ]
});

fn extract_monetary(message_id: &str, text: &str) -> Vec<ExtractedEntity> {
    let mut out = Vec::new();
    for (pattern, context) in MONEY_PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            out.push(ExtractedEntity {
                message_id: message_id.to_string(),
                entity_type: EntityType::Money,
                entity_value: m.as_str().to_string(),
                entity_normalized: Some(m.as_str().trim().to_string()),
                context: Some(context.to_string()),
                confidence: 0.85,
                source: EntitySource::Regex,
            });
        }
    }
    out
}

static DATE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    let date = r"([A-Za-z]+ \d{1,2},?\s*\d{4}|\d{1,2}/\d{1,2}/\d{2,4})";
    vec![
        (
            Regex::new(&format!(r"(?i)renew(?:s|al)?\s+(?:on|by|before)\s+{date}"))
                .expect("renewal date"),
            "renewal",
        ),
        (
            Regex::new(&format!(r"(?i)expir(?:es|ed|y)?\s+(?:on\s+)?{date}")).expect("expiration date"),
            "expiration",
        ),
        (
            Regex::new(&format!(r"(?i)(?:by|before|due)\s+{date}")).expect("deadline date"),
            "deadline",
        ),
    ]
});

/// Dates in renewal/expiration/deadline context. Future dates encode their
/// bucket in `entity_normalized` as `<bucket>:future`.
fn extract_dates(message_id: &str, text: &str) -> Vec<ExtractedEntity> {
    let now = Utc::now();
    let mut out = Vec::new();
    for (pattern, context) in DATE_PATTERNS.iter() {
        for captures in pattern.captures_iter(text) {
            let raw = captures[1].trim().to_string();
            let normalized = match parse_loose_date(&raw) {
                Some(parsed) if parsed > now => format!("{context}:future"),
                Some(_) => format!("{context}:past"),
                None => raw.clone(),
            };
            out.push(ExtractedEntity {
                message_id: message_id.to_string(),
                entity_type: EntityType::Date,
                entity_value: raw,
                entity_normalized: Some(normalized),
                context: Some(context.to_string()),
                confidence: 0.8,
                source: EntitySource::Regex,
            });
        }
    }
    out
}

/// Forgiving parser for prose dates: "June 15, 2026", "6/15/2026",
/// "6/15/26", and RFC forms.
pub fn parse_loose_date(raw: &str) -> Option<chrono::DateTime<Utc>> {
    if let Some(parsed) = parse_date(raw) {
        return Some(parsed);
    }
    let cleaned = raw.replace(',', " ");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    for format in ["%B %d %Y", "%b %d %Y", "%m/%d/%Y", "%m/%d/%y"] {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(&cleaned, format) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|dt| chrono::DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }
    None
}

/// Procurement signal bands with their keyword sets.
static PROCUREMENT_SIGNALS: [(&str, &[&str]); 3] = [
    (
        "active_buying",
        &[
            "evaluating solutions",
            "looking for a vendor",
            "rfp",
            "request for proposal",
            "shortlist",
            "proof of concept",
            "poc",
        ],
    ),
    (
        "contract_activity",
        &[
            "terms of service",
            "sla",
            "service level agreement",
            "data processing agreement",
            "master service agreement",
            "sow",
            "statement of work",
        ],
    ),
    (
        "security_review",
        &[
            "soc 2",
            "iso 27001",
            "security questionnaire",
            "vendor risk assessment",
            "penetration test",
            "gdpr compliance",
        ],
    ),
];

fn extract_procurement(message_id: &str, text: &str) -> Vec<ExtractedEntity> {
    let lower = text.to_ascii_lowercase();
    let mut out = Vec::new();
    for (band, keywords) in PROCUREMENT_SIGNALS {
        for keyword in keywords {
            if lower.contains(keyword) {
                out.push(ExtractedEntity {
                    message_id: message_id.to_string(),
                    entity_type: EntityType::ProcurementSignal,
                    entity_value: keyword.to_string(),
                    entity_normalized: Some(band.to_string()),
                    context: Some(band.to_string()),
                    confidence: 0.75,
                    source: EntitySource::Regex,
                });
            }
        }
    }
    out
}

static TITLE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)(?:^|\n)\s*((?:VP|Vice President|Director|Head|Manager|CEO|CTO|CFO|COO|CMO|Founder|Co-Founder|President|Partner|Principal|Lead|Senior|Sr\.|Jr\.)[^\n]{0,50})",
    )
    .expect("title pattern")
});

fn extract_roles(message_id: &str, signature: &str, from_name: &str) -> Vec<ExtractedEntity> {
    if signature.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    if let Some(captures) = TITLE_PATTERN.captures(signature) {
        let title = captures[1].trim().to_string();
        if title.len() < 100 {
            out.push(ExtractedEntity {
                message_id: message_id.to_string(),
                entity_type: EntityType::Role,
                entity_value: if from_name.is_empty() {
                    "Unknown".to_string()
                } else {
                    from_name.to_string()
                },
                entity_normalized: Some(title.clone()),
                context: Some(format!("Role: {title}")),
                confidence: 0.85,
                source: EntitySource::Regex,
            });
        }
    }
    out
}

static PHONE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]\d{3}[-.\s]\d{4}").expect("phone pattern")
});

fn extract_phones(message_id: &str, signature: &str) -> Vec<ExtractedEntity> {
    PHONE_PATTERN
        .find_iter(signature)
        .map(|m| ExtractedEntity {
            message_id: message_id.to_string(),
            entity_type: EntityType::Phone,
            entity_value: m.as_str().to_string(),
            entity_normalized: Some(m.as_str().trim().to_string()),
            context: Some("signature".to_string()),
            confidence: 0.8,
            source: EntitySource::Regex,
        })
        .collect()
}

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s<>\)\]]+").expect("url pattern"));

fn extract_urls(message_id: &str, body: &str) -> Vec<ExtractedEntity> {
    URL_PATTERN
        .find_iter(body)
        .map(|m| ExtractedEntity {
            message_id: message_id.to_string(),
            entity_type: EntityType::Url,
            entity_value: m.as_str().to_string(),
            entity_normalized: Some(m.as_str().trim_end_matches('.').to_string()),
            context: None,
            confidence: 0.9,
            source: EntitySource::Regex,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ner::{NerError, TaggedSpan};
    use async_trait::async_trait;

    struct StubTagger(Vec<(usize, usize, &'static str)>);

    #[async_trait]
    impl NerTagger for StubTagger {
        async fn tag(&self, _text: &str) -> Result<Vec<TaggedSpan>, NerError> {
            Ok(self
                .0
                .iter()
                .map(|(start, end, label)| TaggedSpan {
                    start: *start,
                    end: *end,
                    label: label.to_string(),
                    confidence: 0.8,
                })
                .collect())
        }
    }

    fn seeded_store(body: &str, signature: Option<&str>, cc: Vec<String>) -> Store {
        let store = Store::in_memory().expect("store");
        let message = Message {
            message_id: "m1".to_string(),
            thread_id: "t1".to_string(),
            from_address: "jane@acme.com".to_string(),
            from_name: "Jane Doe".to_string(),
            subject: "Budget check".to_string(),
            cc_addresses: cc,
            body_text: Some(body.to_string()),
            ..Message::default()
        };
        store.upsert_message(&message).expect("message");
        let content = ParsedContent {
            message_id: "m1".to_string(),
            body_clean: body.to_string(),
            signature_block: signature.map(|s| s.to_string()),
            ..ParsedContent::default()
        };
        store.upsert_parsed_content(&content).expect("content");
        store
    }

    #[tokio::test]
    async fn monetary_and_procurement_extraction() {
        let store = seeded_store(
            "We have a $12,000 budget and an RFP out. 20% commission available.",
            None,
            Vec::new(),
        );
        let config = EntityConfig::default();
        run(&store, &config, None, &CancelToken::new())
            .await
            .expect("run");

        let entities = store.entities_for_message("m1").expect("entities");
        let money: Vec<_> = entities
            .iter()
            .filter(|e| e.entity_type == EntityType::Money)
            .collect();
        assert!(money.iter().any(|e| e.entity_value == "$12,000"));
        assert!(money.iter().any(|e| e.context.as_deref() == Some("percentage offer")));

        let procurement: Vec<_> = entities
            .iter()
            .filter(|e| e.entity_type == EntityType::ProcurementSignal)
            .collect();
        assert!(procurement
            .iter()
            .any(|e| e.entity_normalized.as_deref() == Some("active_buying")));
    }

    #[tokio::test]
    async fn config_toggles_disable_branches() {
        let store = seeded_store("Budget: $9,000. SOC 2 report attached.", None, Vec::new());
        let config = EntityConfig {
            extract_monetary: false,
            extract_procurement: false,
            ..EntityConfig::default()
        };
        run(&store, &config, None, &CancelToken::new())
            .await
            .expect("run");
        let entities = store.entities_for_message("m1").expect("entities");
        assert!(!entities.iter().any(|e| e.entity_type == EntityType::Money));
        assert!(!entities
            .iter()
            .any(|e| e.entity_type == EntityType::ProcurementSignal));
    }

    #[tokio::test]
    async fn future_renewal_dates_are_bucketed() {
        let store = seeded_store(
            "Your plan renews on June 15, 2099. The old one expired on January 2, 2020.",
            None,
            Vec::new(),
        );
        run(&store, &EntityConfig::default(), None, &CancelToken::new())
            .await
            .expect("run");
        let entities = store.entities_for_message("m1").expect("entities");
        let dates: Vec<_> = entities
            .iter()
            .filter(|e| e.entity_type == EntityType::Date)
            .collect();
        assert!(dates
            .iter()
            .any(|e| e.entity_normalized.as_deref() == Some("renewal:future")));
        assert!(dates
            .iter()
            .any(|e| e.entity_normalized.as_deref() == Some("expiration:past")));
    }

    #[tokio::test]
    async fn header_entities_carry_relationship_context() {
        let store = seeded_store(
            "Quick note.",
            None,
            vec!["support@vendor.com".to_string(), "bob@peer.io".to_string()],
        );
        run(&store, &EntityConfig::default(), None, &CancelToken::new())
            .await
            .expect("run");
        let entities = store.entities_for_message("m1").expect("entities");
        let header: Vec<_> = entities
            .iter()
            .filter(|e| e.source == EntitySource::Header)
            .collect();
        assert_eq!(header.len(), 3);
        assert!(header
            .iter()
            .any(|e| e.context.as_deref().unwrap_or("").contains("vendor_contact")));
        assert!(header
            .iter()
            .any(|e| e.context.as_deref().unwrap_or("").contains("(peer)")));
        let ccs: Vec<_> = header.iter().filter(|e| e.confidence == 0.6).collect();
        assert_eq!(ccs.len(), 2);
    }

    #[tokio::test]
    async fn ner_spans_map_to_typed_entities() {
        let body = "Maria Lopez from Globex wants a call.";
        let store = seeded_store(body, None, Vec::new());
        let tagger = StubTagger(vec![(0, 11, "PERSON"), (17, 23, "ORG")]);
        run(
            &store,
            &EntityConfig::default(),
            Some(&tagger),
            &CancelToken::new(),
        )
        .await
        .expect("run");
        let entities = store.entities_for_message("m1").expect("entities");
        assert!(entities.iter().any(|e| {
            e.entity_type == EntityType::Person
                && e.entity_value == "Maria Lopez"
                && e.source == EntitySource::Spacy
        }));
        assert!(entities
            .iter()
            .any(|e| e.entity_type == EntityType::Organization && e.entity_value == "Globex"));
    }

    #[test]
    fn person_relationship_classification() {
        assert_eq!(
            classify_person_relationship("", "noreply@acme.com"),
            "automated"
        );
        assert_eq!(
            classify_person_relationship("VP Marketing", "jane@acme.com"),
            "decision_maker"
        );
        assert_eq!(
            classify_person_relationship("", "support@acme.com"),
            "vendor_contact"
        );
        assert_eq!(classify_person_relationship("", "bob@acme.com"), "peer");
    }

    #[test]
    fn role_titles_come_from_the_signature() {
        let roles = extract_roles("m1", "Jane Doe\nVP Marketing, Acme\n555-0100", "Jane Doe");
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].entity_type, EntityType::Role);
        assert!(roles[0]
            .entity_normalized
            .as_deref()
            .expect("title")
            .starts_with("VP Marketing"));
    }

    #[test]
    fn loose_date_parser_accepts_common_forms() {
        assert!(parse_loose_date("June 15, 2026").is_some());
        assert!(parse_loose_date("6/15/2026").is_some());
        assert!(parse_loose_date("6/15/26").is_some());
        assert!(parse_loose_date("next Tuesday").is_none());
    }
}
