//! Sender profiling and gem detection.
//!
//! Profiles aggregate everything known about a domain; detection then runs
//! ten typed rules, each gated by the relationship eligibility matrix and
//! suppressed entirely for excluded or suppress-flagged senders.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::{EngagementConfig, ScoringConfig};
use crate::esp::esp_tier;
use crate::known::KnownEntities;
use crate::models::{
    Classification, Contact, EntityType, GemExplanation, GemSignal, GemType, Message,
    MonetarySignal, NewGem, RelationshipType, SenderProfile, Thread,
};
use crate::stages::relationships::{classify as classify_relationship, scan_completion_signals};
use crate::stages::{CancelToken, StageError, StageReport};
use crate::stages::entities::parse_loose_date;
use crate::store::Store;

const MAX_PROFILE_CTAS: usize = 50;
/// Text-scan warm boost ceiling; entity cross-references add on top.
const WARM_BOOST_CAP: i64 = 30;
/// An industry with at least this many profiles is saturated enough to mine
/// for intelligence.
const INDUSTRY_SATURATION: i64 = 10;

pub struct ProfileOptions {
    pub scoring: ScoringConfig,
    pub engagement: EngagementConfig,
}

pub fn run(
    store: &Store,
    options: &ProfileOptions,
    known: &KnownEntities,
    cancel: &CancelToken,
) -> Result<StageReport, StageError> {
    let mut report = StageReport::default();

    for domain in store.sender_domains()? {
        cancel.check()?;
        if let Some(profile) = build_profile(store, &domain)? {
            store.upsert_profile(&profile)?;
            report.processed += 1;
        }
    }

    report.processed += detect_gems(store, options, known, cancel)?;
    Ok(report)
}

// ----------------------------------------------------------------------
// Profile assembly
// ----------------------------------------------------------------------

fn build_profile(store: &Store, domain: &str) -> Result<Option<SenderProfile>, StageError> {
    let messages = store.messages_for_domain(domain)?;
    if messages.is_empty() {
        return Ok(None);
    }

    let classifications = store.classifications_for_domain(domain)?;
    let contents = store.contents_for_domain(domain)?;
    let meta = store.metadata_for_domain(domain)?;
    let entities = store.entities_for_domain(domain)?;
    let temporal = store.get_sender_temporal(domain)?;
    let threads = store.threads_for_domain(domain)?;

    let first = &messages[0];
    let last = &messages[messages.len() - 1];

    let industry = majority_vote(classifications.iter().map(|c| c.industry.as_str()));
    let company_size =
        majority_vote(classifications.iter().map(|c| c.company_size_estimate.as_str()));

    // AI sophistication: average plus first-half/second-half trend.
    let soph_scores: Vec<i64> = classifications
        .iter()
        .map(|c| c.marketing_sophistication)
        .filter(|s| *s > 0)
        .collect();
    let ai_soph_avg = if soph_scores.is_empty() {
        0.0
    } else {
        soph_scores.iter().sum::<i64>() as f64 / soph_scores.len() as f64
    };
    let trend = sophistication_trend(&soph_scores);

    let latest = classifications.last();
    let product_type = latest.map(|c| c.product_type.clone()).unwrap_or_default();
    let product_description = latest
        .map(|c| c.product_description.clone())
        .unwrap_or_default();
    let pain_points = latest.map(|c| c.pain_points.clone()).unwrap_or_default();
    let target_audience = latest
        .map(|c| c.target_audience.clone())
        .unwrap_or_default();

    // Content rollups.
    let mut offer_dist: HashMap<String, i64> = HashMap::new();
    let mut ctas = Vec::new();
    let mut utm_names = Vec::new();
    let mut has_personalization = false;
    let mut social_links = HashMap::new();
    let mut physical_address = None;
    let mut partner_urls = Vec::new();
    let mut max_template_complexity = 0i64;
    for content in &contents {
        for offer in &content.offer_types {
            *offer_dist.entry(offer.clone()).or_default() += 1;
        }
        ctas.extend(content.cta_texts.iter().cloned());
        for utm in &content.utm_campaigns {
            if let Some(name) = utm.get("utm_campaign") {
                utm_names.push(name.clone());
            }
        }
        has_personalization |= content.has_personalization;
        for (platform, url) in &content.social_links {
            social_links
                .entry(platform.clone())
                .or_insert_with(|| url.clone());
        }
        if content.has_physical_address {
            if let Some(text) = &content.physical_address_text {
                physical_address = Some(text.clone());
            }
        }
        if let Some(urls) = content.link_intents.get("partner_program") {
            partner_urls.extend(urls.iter().cloned());
        }
        max_template_complexity = max_template_complexity.max(content.template_complexity_score);
    }
    let unique_ctas = dedupe(ctas, MAX_PROFILE_CTAS);
    let unique_utms = dedupe(utm_names, usize::MAX);
    let unique_partner_urls = dedupe(partner_urls, usize::MAX);

    let known_contacts = collapse_contacts(&entities, &messages);

    let monetary_signals: Vec<MonetarySignal> = entities
        .iter()
        .filter(|e| e.entity_type == EntityType::Money)
        .map(|e| MonetarySignal {
            amount: e.entity_value.clone(),
            context: e.context.clone().unwrap_or_default(),
        })
        .collect();

    let renewal_dates: Vec<String> = entities
        .iter()
        .filter(|e| {
            e.entity_type == EntityType::Date
                && matches!(e.context.as_deref(), Some("renewal" | "expiration"))
        })
        .map(|e| e.entity_value.clone())
        .collect();

    let has_partner_program = !unique_partner_urls.is_empty()
        || classifications.iter().any(|c| c.partner_program_detected)
        || offer_dist.contains_key("partnership");

    let authentication_quality = match &meta {
        Some(meta) => {
            let passing = [meta.spf_result.as_deref(), meta.dmarc_result.as_deref()]
                .iter()
                .filter(|r| **r == Some("pass"))
                .count();
            let has_dkim = meta.dkim_domain.is_some();
            if passing == 2 && has_dkim {
                "excellent"
            } else if passing >= 1 || has_dkim {
                "good"
            } else {
                "poor"
            }
        }
        None => "unknown",
    }
    .to_string();

    let deterministic = deterministic_sophistication(
        meta.as_ref().and_then(|m| m.esp_identified.as_deref()),
        has_personalization,
        !unique_utms.is_empty(),
        max_template_complexity,
        meta.as_ref().and_then(|m| m.spf_result.as_deref()),
        meta.as_ref().and_then(|m| m.dkim_domain.as_deref()),
        meta.as_ref().and_then(|m| m.dmarc_result.as_deref()),
        meta.as_ref()
            .and_then(|m| m.list_unsubscribe_url.as_deref())
            .is_some(),
        unique_utms.len(),
    );
    let sophistication_avg = if ai_soph_avg > 0.0 {
        0.6 * deterministic as f64 + 0.4 * ai_soph_avg
    } else {
        deterministic as f64
    };

    let (initiation_ratio, reply_rate) = thread_metrics(store, &threads)?;

    let economic_segments = determine_segments(
        &classifications,
        &offer_dist,
        has_partner_program,
        &renewal_dates,
        &entities,
    );

    Ok(Some(SenderProfile {
        sender_domain: domain.to_string(),
        company_name: infer_company_name(domain, &messages),
        primary_email: first.from_address.clone(),
        reply_to_email: first.reply_to.clone(),
        industry,
        company_size,
        marketing_sophistication_avg: sophistication_avg,
        marketing_sophistication_trend: trend,
        esp_used: meta.as_ref().and_then(|m| m.esp_identified.clone()),
        product_type,
        product_description,
        pain_points,
        target_audience,
        known_contacts,
        total_messages: messages.len() as i64,
        first_contact: first.date.clone(),
        last_contact: last.date.clone(),
        avg_frequency_days: temporal.and_then(|t| t.avg_frequency_days),
        offer_type_distribution: offer_dist,
        cta_texts_all: unique_ctas,
        social_links,
        physical_address,
        utm_campaign_names: unique_utms,
        has_personalization,
        has_partner_program,
        partner_program_urls: unique_partner_urls,
        renewal_dates,
        monetary_signals,
        authentication_quality,
        unsubscribe_url: meta.and_then(|m| m.list_unsubscribe_url),
        economic_segments,
        thread_initiation_ratio: initiation_ratio,
        user_reply_rate: reply_rate,
    }))
}

/// Deterministic 1..10 sophistication from observable signals.
#[allow(clippy::too_many_arguments)]
pub fn deterministic_sophistication(
    esp: Option<&str>,
    has_personalization: bool,
    has_utm: bool,
    template_complexity: i64,
    spf: Option<&str>,
    dkim: Option<&str>,
    dmarc: Option<&str>,
    has_unsubscribe: bool,
    unique_campaign_count: usize,
) -> i64 {
    let mut score = esp_tier(esp) as i64;
    if has_personalization {
        score += 2;
    }
    if has_utm {
        score += 1;
    }
    if template_complexity >= 40 {
        score += 1;
    }
    if unique_campaign_count >= 3 {
        score += 1;
    }
    if spf == Some("pass") && dmarc == Some("pass") && dkim.is_some() {
        score += 1;
    }
    if has_unsubscribe {
        score += 1;
    }
    score.clamp(1, 10)
}

fn sophistication_trend(scores: &[i64]) -> String {
    if scores.len() < 3 {
        return "stable".to_string();
    }
    let half = scores.len() / 2;
    let first: f64 = scores[..half].iter().sum::<i64>() as f64 / half as f64;
    let second: f64 =
        scores[half..].iter().sum::<i64>() as f64 / (scores.len() - half) as f64;
    if second - first > 1.0 {
        "improving".to_string()
    } else if first - second > 1.0 {
        "declining".to_string()
    } else {
        "stable".to_string()
    }
}

/// thread_initiation_ratio = threads the user opened; user_reply_rate =
/// threads the user participated in at all.
fn thread_metrics(
    store: &Store,
    threads: &[Thread],
) -> Result<(Option<f64>, Option<f64>), StageError> {
    if threads.is_empty() {
        return Ok((None, None));
    }
    let mut initiated = 0usize;
    let mut replied = 0usize;
    for thread in threads {
        let messages = store.messages_in_thread(&thread.thread_id)?;
        if messages.first().is_some_and(|m| m.is_sent) {
            initiated += 1;
        }
        if thread.user_participated {
            replied += 1;
        }
    }
    let total = threads.len() as f64;
    Ok((
        Some(initiated as f64 / total),
        Some(replied as f64 / total),
    ))
}

fn majority_vote<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for value in values {
        if !value.is_empty() {
            *counts.entry(value).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|(value, count)| (*count, std::cmp::Reverse(*value)))
        .map(|(value, _)| value.to_string())
        .unwrap_or_default()
}

fn infer_company_name(domain: &str, messages: &[Message]) -> String {
    let named = majority_vote(
        messages
            .iter()
            .map(|m| m.from_name.as_str())
            .filter(|name| !name.contains('@')),
    );
    if !named.is_empty() {
        return named;
    }
    let stem = domain.split('.').next().unwrap_or(domain);
    let mut chars = stem.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => domain.to_string(),
    }
}

/// Collapse person/role entities into contacts ranked decision_maker >
/// peer > vendor_contact > automated.
fn collapse_contacts(
    entities: &[crate::models::ExtractedEntity],
    messages: &[Message],
) -> Vec<Contact> {
    let mut roles: HashMap<String, String> = HashMap::new();
    for entity in entities {
        if entity.entity_type == EntityType::Role {
            if let Some(title) = &entity.entity_normalized {
                roles
                    .entry(entity.entity_value.clone())
                    .or_insert_with(|| title.clone());
            }
        }
    }

    let mut emails: HashMap<String, String> = HashMap::new();
    for message in messages {
        if !message.from_name.is_empty() {
            emails
                .entry(message.from_name.clone())
                .or_insert_with(|| message.from_address.clone());
        }
    }

    let mut seen = HashSet::new();
    let mut contacts = Vec::new();
    for entity in entities {
        if entity.entity_type != EntityType::Person {
            continue;
        }
        if !seen.insert(entity.entity_value.clone()) {
            continue;
        }
        contacts.push(Contact {
            name: entity.entity_value.clone(),
            role: roles.get(&entity.entity_value).cloned().unwrap_or_default(),
            email: emails
                .get(&entity.entity_value)
                .cloned()
                .unwrap_or_default(),
        });
    }

    contacts.sort_by_key(|contact| contact_rank(contact, entities));
    contacts
}

fn contact_rank(contact: &Contact, entities: &[crate::models::ExtractedEntity]) -> u8 {
    if crate::stages::entities::classify_person_relationship(&contact.role, &contact.email)
        == "decision_maker"
    {
        return 0;
    }
    let classification = entities
        .iter()
        .filter(|e| e.entity_type == EntityType::Person && e.entity_value == contact.name)
        .filter_map(|e| e.context.as_deref())
        .find_map(|context| {
            ["decision_maker", "automated", "vendor_contact", "peer"]
                .into_iter()
                .find(|tag| context.contains(tag))
        });
    match classification {
        Some("decision_maker") => 0,
        Some("peer") | None => 1,
        Some("vendor_contact") => 2,
        Some("automated") => 3,
        Some(_) => 1,
    }
}

fn determine_segments(
    classifications: &[Classification],
    offer_dist: &HashMap<String, i64>,
    has_partner_program: bool,
    renewal_dates: &[String],
    entities: &[crate::models::ExtractedEntity],
) -> Vec<String> {
    let primary_intent = majority_vote(classifications.iter().map(|c| c.sender_intent.as_str()));

    let mut segments = Vec::new();
    if primary_intent == "transactional"
        || offer_dist.contains_key("renewal")
        || !renewal_dates.is_empty()
    {
        segments.push("spend_map".to_string());
    }
    if has_partner_program || offer_dist.contains_key("partnership") {
        segments.push("partner_map".to_string());
    }
    if matches!(
        primary_intent.as_str(),
        "promotional" | "nurture_sequence" | "cold_outreach"
    ) {
        segments.push("prospect_map".to_string());
    }
    if matches!(
        primary_intent.as_str(),
        "newsletter" | "event_invitation" | "community"
    ) {
        segments.push("distribution_map".to_string());
    }
    if primary_intent == "procurement"
        || offer_dist.contains_key("procurement")
        || entities
            .iter()
            .any(|e| e.entity_type == EntityType::ProcurementSignal)
    {
        segments.push("procurement_map".to_string());
    }
    segments
}

fn dedupe(values: Vec<String>, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .take(limit)
        .collect()
}

// ----------------------------------------------------------------------
// Gem detection
// ----------------------------------------------------------------------

/// Warm-signal table: category, patterns, boost. First match per category
/// per thread.
static WARM_SIGNALS: Lazy<Vec<(&'static str, Vec<Regex>, i64)>> = Lazy::new(|| {
    let table: [(&str, &[&str], i64); 6] = [
        ("pricing", &[r"\b(?:pricing|price|cost|quote|budget|investment)\b"], 15),
        (
            "meeting_request",
            &[r"\b(?:schedule|call|meeting|demo|zoom|calendly|book a time)\b"],
            12,
        ),
        (
            "explicit_ask",
            &[r"\b(?:interested in|looking for|evaluating|considering)\b", r"\bwhat(?:'s| is) your\b"],
            10,
        ),
        (
            "follow_up",
            &[r"\b(?:following up|circling back|checking in|just wanted to)\b"],
            5,
        ),
        ("decision_maker", &[r"\b(?:CEO|CTO|VP|Director|Head of|Founder)\b"], 8),
        (
            "budget_indicator",
            &[
                r"\$[\d,]+(?:\.\d{2})?",
                r"\b\d+[k]\s*(?:ARR|MRR|budget)\b",
                r"\bteam of \d+\b",
                r"\bhave (?:a )?budget\b",
            ],
            12,
        ),
    ];
    table
        .iter()
        .map(|(category, patterns, boost)| {
            (
                *category,
                patterns
                    .iter()
                    .map(|p| {
                        let pattern = if *category == "decision_maker" {
                            (*p).to_string()
                        } else {
                            format!("(?i){p}")
                        };
                        Regex::new(&pattern).expect("warm signal pattern")
                    })
                    .collect(),
                *boost,
            )
        })
        .collect()
});

static DISTRIBUTION_CONTENT_SIGNALS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bguest post\b",
        r"\bcall for (?:speakers|papers)\b",
        r"\bsubmit your (?:story|talk|session|abstract)\b",
        r"\bpodcast interview\b",
        r"\bsponsorship opportunit",
        r"\bspeaker application\b",
        r"\bcontributor\b",
        r"\bfeature (?:story|article|piece)\b",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("distribution pattern"))
    .collect()
});

static STOP_WORDS: [&str; 15] = [
    "and", "the", "for", "to", "of", "a", "an", "in", "on", "with", "who", "that", "are", "is",
    "their",
];

fn detect_gems(
    store: &Store,
    options: &ProfileOptions,
    known: &KnownEntities,
    cancel: &CancelToken,
) -> Result<usize, StageError> {
    store.clear_gems()?;

    let excluded = store.excluded_domains()?;
    let bulk_domains = store.bulk_sender_domains()?;
    let industry_counts = store.industry_counts()?;
    let profiles = store.list_profiles()?;

    let mut emitted = 0usize;
    for profile in &profiles {
        cancel.check()?;
        let domain = &profile.sender_domain;
        if excluded.contains(domain) {
            continue;
        }

        let (relationship, _, _) = classify_relationship(store, profile, known)?;
        let suppress = store
            .get_relationship(domain)?
            .map(|r| r.suppress_gems)
            .unwrap_or(false)
            || known
                .category_of(domain)
                .is_some_and(|c| c.suppresses_gems());
        if suppress {
            debug!(domain, "gem detection suppressed");
            continue;
        }

        let mut gems = Vec::new();
        let is_bulk = bulk_domains.contains(domain);

        if eligible(GemType::DormantWarmThread, relationship) && !is_bulk {
            gems.extend(detect_dormant_warm_threads(store, profile, &options.scoring)?);
        }
        if eligible(GemType::UnansweredAsk, relationship) && !is_bulk {
            gems.extend(detect_unanswered_asks(store, profile)?);
        }
        if eligible(GemType::WeakMarketingLead, relationship) && !is_bulk {
            gems.extend(detect_weak_marketing_lead(profile, &options.scoring));
        }
        if eligible(GemType::PartnerProgram, relationship) {
            gems.extend(detect_partner_program(store, profile)?);
        }
        if eligible(GemType::RenewalLeverage, relationship) && !is_bulk {
            gems.extend(detect_renewal_leverage(store, profile)?);
        }
        if eligible(GemType::DistributionChannel, relationship) {
            gems.extend(detect_distribution_channel(store, profile)?);
        }
        if eligible(GemType::CoMarketing, relationship) {
            gems.extend(detect_co_marketing(profile, &options.engagement));
        }
        if eligible(GemType::IndustryIntel, relationship) && !is_bulk {
            gems.extend(detect_industry_intel(profile, &industry_counts));
        }
        if eligible(GemType::ProcurementSignal, relationship) {
            gems.extend(detect_procurement_signal(store, profile)?);
        }

        for gem in gems {
            store.insert_gem(&gem)?;
            emitted += 1;
        }
    }
    Ok(emitted)
}

fn eligible(gem_type: GemType, relationship: RelationshipType) -> bool {
    gem_type.eligible_relationships().contains(&relationship)
}

/// Warm-signal scan over a thread's messages: first match per category,
/// text boost capped, entity cross-references added on top.
fn scan_warm_signals(
    store: &Store,
    thread_id: &str,
) -> Result<(Vec<GemSignal>, i64), StageError> {
    let messages = store.messages_in_thread(thread_id)?;
    let mut combined = String::new();
    for message in &messages {
        let text = match store.get_parsed_content(&message.message_id)? {
            Some(content) if !content.body_clean.is_empty() => content.body_clean,
            _ => crate::mail::message_body(message),
        };
        combined.push_str(&text);
        combined.push('\n');
    }

    let mut signals = Vec::new();
    let mut boost = 0i64;
    for (category, patterns, points) in WARM_SIGNALS.iter() {
        if let Some(m) = patterns.iter().find_map(|p| p.find(&combined)) {
            let evidence: String = m.as_str().chars().take(80).collect();
            signals.push(GemSignal::evidence(format!("warm_{category}"), evidence));
            boost += points;
        }
    }
    boost = boost.min(WARM_BOOST_CAP);

    for entity in store.entities_for_thread(thread_id)? {
        match entity.entity_type {
            EntityType::Money => {
                signals.push(GemSignal::evidence("entity_money", entity.entity_value));
                boost += 10;
            }
            EntityType::Person
                if entity
                    .context
                    .as_deref()
                    .is_some_and(|c| c.contains("decision_maker")) =>
            {
                signals.push(GemSignal::evidence(
                    "entity_decision_maker",
                    entity.entity_value,
                ));
                boost += 8;
            }
            _ => {}
        }
    }

    Ok((signals, boost))
}

/// The six-gate dormant warm thread pipeline. Relationship eligibility is
/// gate one and is applied by the caller.
fn detect_dormant_warm_threads(
    store: &Store,
    profile: &SenderProfile,
    scoring: &ScoringConfig,
) -> Result<Vec<NewGem>, StageError> {
    let config = &scoring.dormant_thread;
    let mut gems = Vec::new();

    for thread in store.threads_for_domain(&profile.sender_domain)? {
        let awaiting_user = thread.awaiting_response_from
            == Some(crate::models::AwaitingResponse::User);
        if !awaiting_user
            || thread.days_dormant < config.min_dormancy_days
            || thread.days_dormant > config.max_dormancy_days
            || !thread.user_participated
            || thread.message_count < 2
        {
            continue;
        }

        let (warm_signals, boost) = scan_warm_signals(store, &thread.thread_id)?;
        if warm_signals.is_empty() {
            continue;
        }
        if !scan_completion_signals(store, &thread.thread_id)?.is_empty() {
            continue;
        }

        let source_message_ids: Vec<String> = store
            .messages_in_thread(&thread.thread_id)?
            .iter()
            .map(|m| m.message_id.clone())
            .collect();

        let mut signals = warm_signals;
        let mut score = 40 + boost;
        if thread.days_dormant < 60 {
            score += 15;
        } else if thread.days_dormant < 120 {
            score += 10;
        }
        if thread.message_count > 2 {
            signals.push(GemSignal::evidence(
                "multi_message_thread",
                format!("{} messages exchanged", thread.message_count),
            ));
            score += 5;
        }

        let estimated_value = if boost >= 15 {
            "high"
        } else if boost == 0 {
            "low"
        } else {
            "medium"
        };
        let urgency = if boost >= 25 || thread.days_dormant < 30 {
            "high"
        } else if thread.days_dormant > 180 {
            "low"
        } else {
            "medium"
        };

        gems.push(NewGem {
            gem_type: GemType::DormantWarmThread,
            sender_domain: profile.sender_domain.clone(),
            thread_id: Some(thread.thread_id.clone()),
            score: score.min(100),
            explanation: GemExplanation {
                gem_type: GemType::DormantWarmThread,
                summary: format!(
                    "Thread '{}' has been dormant for {} days. You owe a reply.",
                    thread.subject, thread.days_dormant
                ),
                signals,
                confidence: 0.8,
                estimated_value: estimated_value.to_string(),
                urgency: urgency.to_string(),
            },
            recommended_actions: vec!["Reply to thread with new value-add".to_string()],
            source_message_ids,
        });
    }
    Ok(gems)
}

fn detect_unanswered_asks(store: &Store, profile: &SenderProfile) -> Result<Vec<NewGem>, StageError> {
    let mut gems = Vec::new();
    for thread in store.threads_for_domain(&profile.sender_domain)? {
        let awaiting_user = thread.awaiting_response_from
            == Some(crate::models::AwaitingResponse::User);
        if !awaiting_user
            || thread.days_dormant > 30
            || thread.message_count < 2
            || !thread.user_participated
        {
            continue;
        }

        let mut score = 60;
        let mut signals = vec![GemSignal::evidence(
            "awaiting_response",
            format!(
                "Last message from {}",
                thread.last_sender.as_deref().unwrap_or("the other party")
            ),
        )];
        let has_decision_maker = store
            .entities_for_thread(&thread.thread_id)?
            .iter()
            .any(|e| {
                e.context
                    .as_deref()
                    .is_some_and(|c| c.contains("decision_maker"))
            });
        if has_decision_maker {
            signals.push(GemSignal::evidence("decision_maker_present", ""));
            score += 8;
        }

        let source_message_ids: Vec<String> = store
            .messages_in_thread(&thread.thread_id)?
            .iter()
            .map(|m| m.message_id.clone())
            .collect();

        gems.push(NewGem {
            gem_type: GemType::UnansweredAsk,
            sender_domain: profile.sender_domain.clone(),
            thread_id: Some(thread.thread_id.clone()),
            score: score.min(100),
            explanation: GemExplanation {
                gem_type: GemType::UnansweredAsk,
                summary: format!(
                    "'{}' is waiting for your reply ({} days).",
                    thread.subject, thread.days_dormant
                ),
                signals,
                confidence: 0.9,
                estimated_value: "medium-high".to_string(),
                urgency: "high".to_string(),
            },
            recommended_actions: vec!["Reply promptly".to_string()],
            source_message_ids,
        });
    }
    Ok(gems)
}

fn detect_weak_marketing_lead(profile: &SenderProfile, scoring: &ScoringConfig) -> Vec<NewGem> {
    let sophistication = profile.marketing_sophistication_avg;
    if !matches!(profile.company_size.as_str(), "small" | "medium")
        || sophistication > 5.0
        || profile.industry.is_empty()
        || !scoring.target_industries.contains(&profile.industry)
    {
        return Vec::new();
    }

    let score = 40 + ((5.0 - sophistication) * 5.0) as i64;
    let estimated_value = if profile.company_size == "medium" {
        "medium-high"
    } else {
        "medium"
    };

    vec![NewGem {
        gem_type: GemType::WeakMarketingLead,
        sender_domain: profile.sender_domain.clone(),
        thread_id: None,
        score: score.clamp(0, 100),
        explanation: GemExplanation {
            gem_type: GemType::WeakMarketingLead,
            summary: format!(
                "{} ({}) has marketing gaps you could address.",
                profile.company_name, profile.sender_domain
            ),
            signals: vec![GemSignal::evidence(
                "low_sophistication",
                format!("Marketing sophistication: {sophistication:.1}/10"),
            )],
            confidence: 0.7,
            estimated_value: estimated_value.to_string(),
            urgency: "low".to_string(),
        },
        recommended_actions: vec![
            "Send audit-style outreach highlighting specific gaps".to_string()
        ],
        source_message_ids: Vec::new(),
    }]
}

fn detect_partner_program(store: &Store, profile: &SenderProfile) -> Result<Vec<NewGem>, StageError> {
    let via_intents = !profile.partner_program_urls.is_empty();
    let via_offers = profile.offer_type_distribution.contains_key("partnership");
    if !profile.has_partner_program && !via_intents && !via_offers {
        return Ok(Vec::new());
    }

    let mut score = 30;
    let mut signals = vec![GemSignal::evidence(
        "partner_program_detected",
        "Partner/affiliate program links found",
    )];
    if via_intents {
        signals.push(GemSignal::evidence(
            "direct_urls",
            format!("{} partner program URL(s)", profile.partner_program_urls.len()),
        ));
    }

    // Commission percentage entities sweeten the deal.
    let has_commission = store
        .entities_for_domain(&profile.sender_domain)?
        .iter()
        .any(|e| {
            e.entity_type == EntityType::Money
                && e.entity_value.to_ascii_lowercase().contains("commission")
        });
    if has_commission {
        signals.push(GemSignal::evidence("commission_terms", "Commission percentage quoted"));
        score += 10;
    }

    Ok(vec![NewGem {
        gem_type: GemType::PartnerProgram,
        sender_domain: profile.sender_domain.clone(),
        thread_id: None,
        score,
        explanation: GemExplanation {
            gem_type: GemType::PartnerProgram,
            summary: format!(
                "{} has a partner/affiliate program you could join.",
                profile.company_name
            ),
            signals,
            confidence: 0.8,
            estimated_value: "medium".to_string(),
            urgency: "low".to_string(),
        },
        recommended_actions: vec![
            "Apply to partner program".to_string(),
            "Review commission structure".to_string(),
        ],
        source_message_ids: Vec::new(),
    }])
}

fn detect_renewal_leverage(store: &Store, profile: &SenderProfile) -> Result<Vec<NewGem>, StageError> {
    let entities = store.entities_for_domain(&profile.sender_domain)?;
    let has_future_renewal = entities.iter().any(|e| {
        e.entity_type == EntityType::Date
            && e.entity_normalized.as_deref() == Some("renewal:future")
    });
    if !has_future_renewal {
        return Ok(Vec::new());
    }
    let transactional =
        store.count_intent_for_domain(&profile.sender_domain, "transactional")? > 0;
    if !transactional {
        return Ok(Vec::new());
    }

    // Urgency scales with proximity of the nearest future renewal date.
    let now = Utc::now();
    let days_to_renewal = profile
        .renewal_dates
        .iter()
        .filter_map(|raw| parse_loose_date(raw))
        .filter(|date| *date > now)
        .map(|date| (date - now).num_days())
        .min();
    let urgency = match days_to_renewal {
        Some(days) if days <= 30 => "high",
        Some(days) if days <= 60 => "medium",
        _ => "low",
    };

    let mut signals = vec![GemSignal::evidence(
        "renewal_dates",
        format!("Renewal dates found: {}", profile.renewal_dates.join(", ")),
    )];
    let estimated_value = if profile.monetary_signals.is_empty() {
        "medium"
    } else {
        signals.push(GemSignal::evidence(
            "monetary_context",
            format!("{} monetary signal(s) on file", profile.monetary_signals.len()),
        ));
        "high"
    };

    Ok(vec![NewGem {
        gem_type: GemType::RenewalLeverage,
        sender_domain: profile.sender_domain.clone(),
        thread_id: None,
        score: 40,
        explanation: GemExplanation {
            gem_type: GemType::RenewalLeverage,
            summary: format!(
                "Upcoming renewal window with {} - negotiation opportunity.",
                profile.company_name
            ),
            signals,
            confidence: 0.75,
            estimated_value: estimated_value.to_string(),
            urgency: urgency.to_string(),
        },
        recommended_actions: vec![
            "Prepare negotiation strategy".to_string(),
            "Research competitive alternatives".to_string(),
        ],
        source_message_ids: Vec::new(),
    }])
}

fn detect_distribution_channel(
    store: &Store,
    profile: &SenderProfile,
) -> Result<Vec<NewGem>, StageError> {
    if !profile
        .economic_segments
        .iter()
        .any(|s| s == "distribution_map")
        || profile.total_messages < 5
    {
        return Ok(Vec::new());
    }

    let mut score = 30;
    let mut signals = vec![GemSignal::evidence(
        "distribution_channel",
        "Sender is a newsletter/event/community",
    )];
    if profile.total_messages > 10 {
        signals.push(GemSignal::evidence(
            "active_publication",
            format!("{} messages received", profile.total_messages),
        ));
        score += 15;
    }

    let bodies = store.inbound_bodies_for_domain(&profile.sender_domain, 10)?;
    for body in &bodies {
        if let Some(m) = DISTRIBUTION_CONTENT_SIGNALS
            .iter()
            .find_map(|p| p.find(body))
        {
            let evidence: String = m.as_str().chars().take(80).collect();
            signals.push(GemSignal::evidence("content_opportunity", evidence));
            score += 15;
            break;
        }
    }

    let estimated_value = if profile.total_messages > 10 { "medium" } else { "low" };
    Ok(vec![NewGem {
        gem_type: GemType::DistributionChannel,
        sender_domain: profile.sender_domain.clone(),
        thread_id: None,
        score: score.min(100),
        explanation: GemExplanation {
            gem_type: GemType::DistributionChannel,
            summary: format!(
                "{} could amplify your reach through their audience.",
                profile.company_name
            ),
            signals,
            confidence: 0.65,
            estimated_value: estimated_value.to_string(),
            urgency: "low".to_string(),
        },
        recommended_actions: vec!["Pitch guest content or sponsorship".to_string()],
        source_message_ids: Vec::new(),
    }])
}

fn detect_co_marketing(profile: &SenderProfile, engagement: &EngagementConfig) -> Vec<NewGem> {
    if profile.industry.is_empty()
        || profile.target_audience.is_empty()
        || profile.company_size == "enterprise"
        || engagement.your_audience.is_empty()
    {
        return Vec::new();
    }

    let user_keywords = keyword_set(&engagement.your_audience);
    let target_keywords = keyword_set(&profile.target_audience);
    let overlap: Vec<&String> = user_keywords.intersection(&target_keywords).collect();
    if overlap.len() < 2 {
        return Vec::new();
    }
    let mut shared: Vec<String> = overlap.iter().map(|s| s.to_string()).collect();
    shared.sort();

    let mut signals = vec![
        GemSignal::evidence(
            "audience_overlap",
            format!("Shared keywords: {}", shared.join(", ")),
        ),
        GemSignal::evidence("target_audience", profile.target_audience.clone()),
    ];

    let mut score = 35 + shared.len() as i64 * 5;
    let has_distribution = profile
        .economic_segments
        .iter()
        .any(|s| s == "distribution_map")
        || profile.total_messages >= 5;
    if has_distribution {
        signals.push(GemSignal::evidence(
            "has_distribution",
            "Has newsletter/event distribution",
        ));
        score += 10;
    }

    vec![NewGem {
        gem_type: GemType::CoMarketing,
        sender_domain: profile.sender_domain.clone(),
        thread_id: None,
        score: score.min(100),
        explanation: GemExplanation {
            gem_type: GemType::CoMarketing,
            summary: format!(
                "{} targets a similar audience - co-marketing opportunity.",
                profile.company_name
            ),
            signals,
            confidence: 0.6,
            estimated_value: "medium".to_string(),
            urgency: "low".to_string(),
        },
        recommended_actions: vec![
            "Propose co-marketing campaign".to_string(),
            "Explore content collaboration".to_string(),
        ],
        source_message_ids: Vec::new(),
    }]
}

fn keyword_set(text: &str) -> HashSet<String> {
    text.to_ascii_lowercase()
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|word| !word.is_empty() && !STOP_WORDS.contains(&word.as_str()))
        .collect()
}

fn detect_industry_intel(
    profile: &SenderProfile,
    industry_counts: &HashMap<String, i64>,
) -> Vec<NewGem> {
    if profile.industry.is_empty() {
        return Vec::new();
    }
    let saturated = industry_counts
        .get(&profile.industry)
        .copied()
        .unwrap_or(0)
        >= INDUSTRY_SATURATION;
    if !saturated {
        return Vec::new();
    }

    vec![NewGem {
        gem_type: GemType::IndustryIntel,
        sender_domain: profile.sender_domain.clone(),
        thread_id: None,
        score: 20,
        explanation: GemExplanation {
            gem_type: GemType::IndustryIntel,
            summary: format!(
                "{} provides market intelligence for the {} industry.",
                profile.company_name, profile.industry
            ),
            signals: vec![GemSignal::evidence(
                "industry_saturation",
                format!("{} profiles in {}", industry_counts[&profile.industry], profile.industry),
            )],
            confidence: 0.5,
            estimated_value: "low".to_string(),
            urgency: "low".to_string(),
        },
        recommended_actions: vec!["Include in industry analysis report".to_string()],
        source_message_ids: Vec::new(),
    }]
}

fn detect_procurement_signal(
    store: &Store,
    profile: &SenderProfile,
) -> Result<Vec<NewGem>, StageError> {
    let entities = store.entities_for_domain(&profile.sender_domain)?;
    let procurement: Vec<_> = entities
        .iter()
        .filter(|e| e.entity_type == EntityType::ProcurementSignal)
        .collect();
    if procurement.is_empty() {
        return Ok(Vec::new());
    }

    let mut score = 50;
    let mut signals: Vec<GemSignal> = procurement
        .iter()
        .take(5)
        .map(|e| GemSignal::evidence("procurement_keyword", e.entity_value.clone()))
        .collect();
    if procurement
        .iter()
        .any(|e| e.entity_normalized.as_deref() == Some("security_review"))
    {
        signals.push(GemSignal::evidence(
            "security_review",
            "Security/compliance review underway",
        ));
        score += 15;
    }

    Ok(vec![NewGem {
        gem_type: GemType::ProcurementSignal,
        sender_domain: profile.sender_domain.clone(),
        thread_id: None,
        score,
        explanation: GemExplanation {
            gem_type: GemType::ProcurementSignal,
            summary: format!("Procurement signals detected from {}.", profile.company_name),
            signals,
            confidence: 0.7,
            estimated_value: "high".to_string(),
            urgency: "high".to_string(),
        },
        recommended_actions: vec![
            "Review procurement context".to_string(),
            "Prepare response if applicable".to_string(),
        ],
        source_message_ids: Vec::new(),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AwaitingResponse, ExtractedEntity, ParsedContent, ParsedMetadata};
    use crate::models::EntitySource;

    fn options() -> ProfileOptions {
        ProfileOptions {
            scoring: ScoringConfig::default(),
            engagement: EngagementConfig::default(),
        }
    }

    fn seed_message(store: &Store, id: &str, thread: &str, domain: &str, body: &str, is_sent: bool, date: &str) {
        store
            .upsert_message(&Message {
                message_id: id.to_string(),
                thread_id: thread.to_string(),
                date: Some(date.to_string()),
                from_address: if is_sent {
                    "me@example.com".to_string()
                } else {
                    format!("alice@{domain}")
                },
                from_name: if is_sent { String::new() } else { "Alice".to_string() },
                subject: "Team rollout".to_string(),
                body_text: Some(body.to_string()),
                is_sent,
                ..Message::default()
            })
            .expect("message");
        store
            .upsert_parsed_metadata(&ParsedMetadata {
                message_id: id.to_string(),
                sender_domain: domain.to_string(),
                sender_subdomain: domain.to_string(),
                ..ParsedMetadata::default()
            })
            .expect("metadata");
        store
            .upsert_parsed_content(&ParsedContent {
                message_id: id.to_string(),
                body_clean: body.to_string(),
                ..ParsedContent::default()
            })
            .expect("content");
    }

    /// Two-message warm thread, dormant 45 days, user participated.
    fn seed_dormant_thread(store: &Store, domain: &str) {
        let old = (Utc::now() - chrono::Duration::days(46)).to_rfc3339();
        let newer = (Utc::now() - chrono::Duration::days(45)).to_rfc3339();
        seed_message(store, "m1", "t1", domain, "Intro from our side", true, &old);
        seed_message(
            store,
            "m2",
            "t1",
            domain,
            "What's your pricing for a team of 30? We're evaluating options and have budget.",
            false,
            &newer,
        );
        let thread = Thread {
            thread_id: "t1".to_string(),
            subject: "Team rollout".to_string(),
            participant_count: 2,
            message_count: 2,
            user_participated: true,
            awaiting_response_from: Some(AwaitingResponse::User),
            days_dormant: 45,
            last_sender: Some(format!("alice@{domain}")),
            ..Thread::default()
        };
        store.upsert_thread(&thread).expect("thread");
    }

    #[test]
    fn deterministic_sophistication_follows_the_table() {
        // Tier-3 ESP + personalization + UTM + complexity + campaigns +
        // full auth + unsubscribe saturates at 10.
        let full = deterministic_sophistication(
            Some("HubSpot"),
            true,
            true,
            60,
            Some("pass"),
            Some("d.com"),
            Some("pass"),
            true,
            4,
        );
        assert_eq!(full, 10);

        // Bare unknown sender floors at 1.
        let bare =
            deterministic_sophistication(None, false, false, 0, None, None, None, false, 0);
        assert_eq!(bare, 1);

        // Tier-2 ESP with unsubscribe only.
        let mid = deterministic_sophistication(
            Some("SendGrid"),
            false,
            false,
            0,
            None,
            None,
            None,
            true,
            0,
        );
        assert_eq!(mid, 3);
    }

    #[test]
    fn blend_uses_deterministic_alone_when_ai_absent() {
        let store = Store::in_memory().expect("store");
        seed_message(&store, "m1", "t1", "acme.com", "hello", false, "2025-06-01T10:00:00Z");
        let profile = build_profile(&store, "acme.com").expect("build").expect("some");
        assert_eq!(profile.marketing_sophistication_avg, 1.0);
    }

    #[test]
    fn profile_aggregates_thread_metrics() {
        let store = Store::in_memory().expect("store");
        // Thread A: user initiated. Thread B: they initiated, no user reply.
        seed_message(&store, "m1", "ta", "acme.com", "intro", true, "2025-06-01T10:00:00Z");
        seed_message(&store, "m2", "ta", "acme.com", "reply", false, "2025-06-02T10:00:00Z");
        seed_message(&store, "m3", "tb", "acme.com", "cold", false, "2025-06-03T10:00:00Z");
        for (tid, participated) in [("ta", true), ("tb", false)] {
            store
                .upsert_thread(&Thread {
                    thread_id: tid.to_string(),
                    user_participated: participated,
                    ..Thread::default()
                })
                .expect("thread");
        }

        let profile = build_profile(&store, "acme.com").expect("build").expect("some");
        assert_eq!(profile.thread_initiation_ratio, Some(0.5));
        assert_eq!(profile.user_reply_rate, Some(0.5));
        assert_eq!(profile.total_messages, 3);
        assert_eq!(profile.company_name, "Alice");
    }

    #[test]
    fn dormant_warm_thread_fires_through_all_six_gates() {
        let store = Store::in_memory().expect("store");
        seed_dormant_thread(&store, "acme.com");
        store
            .upsert_profile(&build_profile(&store, "acme.com").expect("build").expect("some"))
            .expect("profile");
        store
            .set_relationship("acme.com", RelationshipType::WarmContact, None, false, "manual")
            .expect("relationship");

        let emitted = detect_gems(&store, &options(), &KnownEntities::default(), &CancelToken::new())
            .expect("detect");
        assert!(emitted >= 1);

        let gems = store.gems_for_domain("acme.com").expect("gems");
        let dormant: Vec<_> = gems
            .iter()
            .filter(|g| g.gem_type == GemType::DormantWarmThread)
            .collect();
        assert_eq!(dormant.len(), 1);
        let gem = dormant[0];
        assert_eq!(gem.thread_id.as_deref(), Some("t1"));
        assert_eq!(gem.explanation.urgency, "high");
        assert_eq!(gem.explanation.estimated_value, "high");
        let signal_names: Vec<&str> = gem
            .explanation
            .signals
            .iter()
            .map(|s| s.signal.as_str())
            .collect();
        assert!(signal_names.contains(&"warm_pricing"));
        assert!(signal_names.contains(&"warm_explicit_ask"));
        assert!(signal_names.contains(&"warm_budget_indicator"));
        assert_eq!(
            gem.source_message_ids,
            vec!["m1".to_string(), "m2".to_string()]
        );
    }

    #[test]
    fn single_message_threads_never_become_dormant_gems() {
        let store = Store::in_memory().expect("store");
        let old = (Utc::now() - chrono::Duration::days(45)).to_rfc3339();
        seed_message(&store, "m1", "t1", "acme.com", "What's your pricing?", false, &old);
        store
            .upsert_thread(&Thread {
                thread_id: "t1".to_string(),
                message_count: 1,
                user_participated: false,
                awaiting_response_from: Some(AwaitingResponse::User),
                days_dormant: 45,
                ..Thread::default()
            })
            .expect("thread");
        store
            .upsert_profile(&build_profile(&store, "acme.com").expect("b").expect("s"))
            .expect("profile");
        store
            .set_relationship("acme.com", RelationshipType::WarmContact, None, false, "manual")
            .expect("relationship");

        detect_gems(&store, &options(), &KnownEntities::default(), &CancelToken::new())
            .expect("detect");
        assert!(store
            .gems_for_domain("acme.com")
            .expect("gems")
            .iter()
            .all(|g| g.gem_type != GemType::DormantWarmThread));
    }

    #[test]
    fn completion_signals_veto_dormant_gems() {
        let store = Store::in_memory().expect("store");
        seed_dormant_thread(&store, "acme.com");
        let closing = (Utc::now() - chrono::Duration::days(44)).to_rfc3339();
        seed_message(
            &store,
            "m3",
            "t1",
            "acme.com",
            "Thanks for everything - all set.",
            false,
            &closing,
        );
        store
            .get_thread("t1")
            .expect("get")
            .expect("exists");
        store
            .upsert_thread(&Thread {
                thread_id: "t1".to_string(),
                subject: "Team rollout".to_string(),
                message_count: 3,
                user_participated: true,
                awaiting_response_from: Some(AwaitingResponse::User),
                days_dormant: 44,
                ..Thread::default()
            })
            .expect("thread");
        store
            .upsert_profile(&build_profile(&store, "acme.com").expect("b").expect("s"))
            .expect("profile");
        store
            .set_relationship("acme.com", RelationshipType::WarmContact, None, false, "manual")
            .expect("relationship");

        detect_gems(&store, &options(), &KnownEntities::default(), &CancelToken::new())
            .expect("detect");
        assert!(store
            .gems_for_domain("acme.com")
            .expect("gems")
            .iter()
            .all(|g| g.gem_type != GemType::DormantWarmThread));
    }

    #[test]
    fn relationship_gate_blocks_ineligible_types() {
        let store = Store::in_memory().expect("store");
        seed_dormant_thread(&store, "vendor.com");
        store
            .upsert_profile(&build_profile(&store, "vendor.com").expect("b").expect("s"))
            .expect("profile");
        store
            .set_relationship("vendor.com", RelationshipType::MyVendor, None, false, "manual")
            .expect("relationship");

        detect_gems(&store, &options(), &KnownEntities::default(), &CancelToken::new())
            .expect("detect");
        assert!(store
            .gems_for_domain("vendor.com")
            .expect("gems")
            .iter()
            .all(|g| g.gem_type != GemType::DormantWarmThread));
    }

    #[test]
    fn suppressed_and_excluded_domains_emit_nothing() {
        let store = Store::in_memory().expect("store");
        seed_dormant_thread(&store, "acme.com");
        store
            .upsert_profile(&build_profile(&store, "acme.com").expect("b").expect("s"))
            .expect("profile");
        store
            .set_relationship("acme.com", RelationshipType::WarmContact, None, true, "manual")
            .expect("suppressed relationship");
        detect_gems(&store, &options(), &KnownEntities::default(), &CancelToken::new())
            .expect("detect");
        assert!(store.gems_for_domain("acme.com").expect("gems").is_empty());

        // Exclusions behave the same even without a suppress flag.
        let store2 = Store::in_memory().expect("store2");
        seed_dormant_thread(&store2, "acme.com");
        store2
            .upsert_profile(&build_profile(&store2, "acme.com").expect("b").expect("s"))
            .expect("profile");
        store2
            .set_relationship("acme.com", RelationshipType::WarmContact, None, false, "manual")
            .expect("relationship");
        store2
            .add_domain_exclusion("acme.com", Some("test"))
            .expect("exclusion");
        detect_gems(&store2, &options(), &KnownEntities::default(), &CancelToken::new())
            .expect("detect");
        assert!(store2.gems_for_domain("acme.com").expect("gems").is_empty());
    }

    #[test]
    fn known_institutional_domains_are_suppressed_without_rows() {
        let store = Store::in_memory().expect("store");
        seed_dormant_thread(&store, "intuit.com");
        store
            .upsert_profile(&build_profile(&store, "intuit.com").expect("b").expect("s"))
            .expect("profile");
        let known = KnownEntities {
            institutional: vec!["intuit.com".to_string()],
            ..KnownEntities::default()
        };
        detect_gems(&store, &options(), &known, &CancelToken::new()).expect("detect");
        assert!(store.gems_for_domain("intuit.com").expect("gems").is_empty());
    }

    #[test]
    fn weak_marketing_lead_scores_by_sophistication_gap() {
        let profile = SenderProfile {
            sender_domain: "shop.io".to_string(),
            company_name: "Shop".to_string(),
            company_size: "small".to_string(),
            industry: "E-commerce".to_string(),
            marketing_sophistication_avg: 3.0,
            ..SenderProfile::default()
        };
        let gems = detect_weak_marketing_lead(&profile, &ScoringConfig::default());
        assert_eq!(gems.len(), 1);
        assert_eq!(gems[0].score, 50);

        let sophisticated = SenderProfile {
            marketing_sophistication_avg: 7.0,
            ..profile.clone()
        };
        assert!(detect_weak_marketing_lead(&sophisticated, &ScoringConfig::default()).is_empty());

        let wrong_industry = SenderProfile {
            industry: "Nonprofit".to_string(),
            ..profile
        };
        assert!(detect_weak_marketing_lead(&wrong_industry, &ScoringConfig::default()).is_empty());
    }

    #[test]
    fn co_marketing_requires_audience_overlap() {
        let mut engagement = EngagementConfig::default();
        engagement.your_audience = "b2b saas founders and marketers".to_string();

        let profile = SenderProfile {
            sender_domain: "peer.io".to_string(),
            company_name: "Peer".to_string(),
            industry: "SaaS".to_string(),
            target_audience: "saas founders scaling marketing teams".to_string(),
            total_messages: 6,
            ..SenderProfile::default()
        };
        let gems = detect_co_marketing(&profile, &engagement);
        assert_eq!(gems.len(), 1);
        assert!(gems[0]
            .explanation
            .signals
            .iter()
            .any(|s| s.signal == "has_distribution"));

        let disjoint = SenderProfile {
            target_audience: "enterprise procurement officers".to_string(),
            ..profile
        };
        assert!(detect_co_marketing(&disjoint, &engagement).is_empty());

        // No configured audience, no gem.
        let no_audience = EngagementConfig::default();
        let again = SenderProfile {
            target_audience: "saas founders scaling marketing teams".to_string(),
            sender_domain: "peer.io".to_string(),
            industry: "SaaS".to_string(),
            total_messages: 6,
            ..SenderProfile::default()
        };
        assert!(detect_co_marketing(&again, &no_audience).is_empty());
    }

    #[test]
    fn procurement_signal_boosts_security_reviews() {
        let store = Store::in_memory().expect("store");
        seed_message(&store, "m1", "t1", "buyer.com", "soc 2 report please", false, "2025-06-01T10:00:00Z");
        store
            .replace_entities(
                "m1",
                &[ExtractedEntity {
                    message_id: "m1".to_string(),
                    entity_type: EntityType::ProcurementSignal,
                    entity_value: "soc 2".to_string(),
                    entity_normalized: Some("security_review".to_string()),
                    context: Some("security_review".to_string()),
                    confidence: 0.75,
                    source: EntitySource::Regex,
                }],
            )
            .expect("entities");
        let profile = build_profile(&store, "buyer.com").expect("b").expect("s");
        let gems = detect_procurement_signal(&store, &profile).expect("detect");
        assert_eq!(gems.len(), 1);
        assert_eq!(gems[0].score, 65);
    }

    #[test]
    fn vendor_upsell_is_never_emitted() {
        let store = Store::in_memory().expect("store");
        seed_dormant_thread(&store, "acme.com");
        store
            .upsert_profile(&build_profile(&store, "acme.com").expect("b").expect("s"))
            .expect("profile");
        store
            .set_relationship("acme.com", RelationshipType::WarmContact, None, false, "manual")
            .expect("relationship");
        detect_gems(&store, &options(), &KnownEntities::default(), &CancelToken::new())
            .expect("detect");
        assert!(store
            .gems_for_domain("acme.com")
            .expect("gems")
            .iter()
            .all(|g| g.gem_type != GemType::VendorUpsell));
    }
}
