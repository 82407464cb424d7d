//! Segment assignment and relationship-gated opportunity scoring.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::config::ScoringConfig;
use crate::mail::thread_state::parse_date;
use crate::models::{
    AwaitingResponse, EntityType, GemType, RelationshipType, SenderProfile, SenderSegment,
};
use crate::stages::{CancelToken, StageError, StageReport};
use crate::store::Store;

const CHURN_THRESHOLD_DAYS: i64 = 180;

pub fn run(
    store: &Store,
    scoring: &ScoringConfig,
    custom_segments_file: Option<&Path>,
    cancel: &CancelToken,
) -> Result<StageReport, StageError> {
    let mut report = StageReport::default();
    report.processed += assign_segments(store, cancel)?;
    report.processed += evaluate_custom_segments(store, custom_segments_file)?;
    report.processed += score_gems(store, scoring, cancel)?;
    Ok(report)
}

// ----------------------------------------------------------------------
// Segment assignment
// ----------------------------------------------------------------------

pub fn assign_segments(store: &Store, cancel: &CancelToken) -> Result<usize, StageError> {
    store.clear_segments()?;

    let mut assigned = 0usize;
    for profile in store.list_profiles()? {
        cancel.check()?;
        let domain = &profile.sender_domain;

        for segment in &profile.economic_segments {
            let subs = match segment.as_str() {
                "spend_map" => spend_subsegments(&profile),
                "partner_map" => partner_subsegments(&profile),
                "prospect_map" => prospect_subsegments(&profile),
                "distribution_map" => distribution_subsegments(&profile),
                "procurement_map" => procurement_subsegments(store, &profile)?,
                _ => vec![("general".to_string(), 0.5)],
            };
            for (sub_segment, confidence) in subs {
                store.upsert_segment(&SenderSegment {
                    sender_domain: domain.clone(),
                    segment: segment.clone(),
                    sub_segment,
                    confidence,
                })?;
                assigned += 1;
            }
        }

        // Dormant threads earn their own segment independent of the
        // profile's economic segments: one detected dormant gem, or a
        // still-unanswered thread past the dormancy floor.
        let has_dormant = store
            .gem_types_for_domain(domain)?
            .contains(&GemType::DormantWarmThread)
            || store.threads_for_domain(domain)?.iter().any(|thread| {
                thread.awaiting_response_from == Some(AwaitingResponse::User)
                    && thread.days_dormant >= 14
            });
        if has_dormant {
            store.upsert_segment(&SenderSegment {
                sender_domain: domain.clone(),
                segment: "dormant_threads".to_string(),
                sub_segment: "unanswered".to_string(),
                confidence: 0.9,
            })?;
            assigned += 1;
        }
    }
    Ok(assigned)
}

fn days_since(date: Option<&str>) -> Option<i64> {
    date.and_then(parse_date)
        .map(|parsed| (Utc::now() - parsed).num_days())
}

fn spend_subsegments(profile: &SenderProfile) -> Vec<(String, f64)> {
    let churned = days_since(profile.last_contact.as_deref())
        .is_some_and(|days| days > CHURN_THRESHOLD_DAYS);
    if churned {
        vec![("churned_vendor".to_string(), 0.8)]
    } else if !profile.renewal_dates.is_empty() {
        vec![("upcoming_renewal".to_string(), 0.9)]
    } else {
        vec![("active_subscription".to_string(), 0.7)]
    }
}

fn partner_subsegments(profile: &SenderProfile) -> Vec<(String, f64)> {
    if profile.partner_program_urls.is_empty() {
        vec![("general".to_string(), 0.5)]
    } else {
        vec![("referral_program".to_string(), 0.8)]
    }
}

fn prospect_subsegments(profile: &SenderProfile) -> Vec<(String, f64)> {
    let sophistication = profile.marketing_sophistication_avg;
    if sophistication <= 3.0 {
        vec![("hot_lead".to_string(), 0.8)]
    } else if sophistication <= 5.0 {
        vec![("warm_prospect".to_string(), 0.6)]
    } else {
        vec![("intelligence_value".to_string(), 0.4)]
    }
}

fn distribution_subsegments(profile: &SenderProfile) -> Vec<(String, f64)> {
    let offers = &profile.offer_type_distribution;
    let mut subs = Vec::new();
    if offers.contains_key("newsletter") || offers.contains_key("digest") {
        subs.push(("newsletter".to_string(), 0.8));
    }
    if offers.contains_key("event") || offers.contains_key("webinar") {
        subs.push(("event_organizer".to_string(), 0.7));
    }
    if offers.contains_key("community") {
        subs.push(("community".to_string(), 0.6));
    }
    if subs.is_empty() {
        subs.push(("newsletter".to_string(), 0.7));
    }
    subs
}

fn procurement_subsegments(
    store: &Store,
    profile: &SenderProfile,
) -> Result<Vec<(String, f64)>, StageError> {
    let bands: HashSet<String> = store
        .entities_for_domain(&profile.sender_domain)?
        .iter()
        .filter(|e| e.entity_type == EntityType::ProcurementSignal)
        .filter_map(|e| e.entity_normalized.clone())
        .collect();

    let mut subs = Vec::new();
    if bands.contains("security_review") {
        subs.push(("security_compliance".to_string(), 0.8));
    }
    if bands.contains("active_buying") {
        subs.push(("formal_rfp".to_string(), 0.9));
    }
    if bands.contains("contract_activity") || subs.is_empty() {
        subs.push(("evaluation".to_string(), 0.6));
    }
    Ok(subs)
}

// ----------------------------------------------------------------------
// Custom segments
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CustomSegmentsFile {
    #[serde(default)]
    custom_segments: Vec<CustomSegment>,
}

#[derive(Debug, Deserialize)]
struct CustomSegment {
    name: String,
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default)]
    rules: serde_yaml::Mapping,
}

fn default_priority() -> String {
    "warm".to_string()
}

/// Evaluate user-defined segment rules from `segments.yaml`. Each rule is a
/// field match, a `{lt,gt}` bound, a list membership, or a boolean.
pub fn evaluate_custom_segments(
    store: &Store,
    path: Option<&Path>,
) -> Result<usize, StageError> {
    let Some(path) = path else { return Ok(0) };
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Ok(0);
    };
    let parsed: CustomSegmentsFile = match serde_yaml::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            debug!(%error, "custom segments file is malformed; skipping");
            return Ok(0);
        }
    };

    let profiles = store.list_profiles()?;
    let mut assigned = 0usize;
    for segment in &parsed.custom_segments {
        for profile in &profiles {
            if matches_rules(profile, &segment.rules) {
                store.upsert_segment(&SenderSegment {
                    sender_domain: profile.sender_domain.clone(),
                    segment: format!("custom:{}", segment.name),
                    sub_segment: segment.priority.clone(),
                    confidence: 0.8,
                })?;
                assigned += 1;
            }
        }
    }
    Ok(assigned)
}

fn matches_rules(profile: &SenderProfile, rules: &serde_yaml::Mapping) -> bool {
    for (key, expected) in rules {
        let Some(field) = key.as_str() else {
            return false;
        };
        match field {
            "segment_includes" => {
                let Some(wanted) = expected.as_str() else {
                    return false;
                };
                if !profile.economic_segments.iter().any(|s| s == wanted) {
                    return false;
                }
            }
            "renewal_date_within_days" => {
                if profile.renewal_dates.is_empty() {
                    return false;
                }
            }
            _ => {
                let Some(actual) = profile_field(profile, field) else {
                    return false;
                };
                if !value_matches(&actual, expected) {
                    return false;
                }
            }
        }
    }
    true
}

enum FieldValue {
    Text(String),
    Number(f64),
    Flag(bool),
}

fn profile_field(profile: &SenderProfile, field: &str) -> Option<FieldValue> {
    match field {
        "industry" => Some(FieldValue::Text(profile.industry.clone())),
        "company_size" => Some(FieldValue::Text(profile.company_size.clone())),
        "esp_used" => profile.esp_used.clone().map(FieldValue::Text),
        "marketing_sophistication_avg" => {
            Some(FieldValue::Number(profile.marketing_sophistication_avg))
        }
        "total_messages" => Some(FieldValue::Number(profile.total_messages as f64)),
        "has_personalization" => Some(FieldValue::Flag(profile.has_personalization)),
        "has_partner_program" => Some(FieldValue::Flag(profile.has_partner_program)),
        _ => None,
    }
}

fn value_matches(actual: &FieldValue, expected: &serde_yaml::Value) -> bool {
    match expected {
        serde_yaml::Value::Sequence(options) => options
            .iter()
            .filter_map(|v| v.as_str())
            .any(|option| matches!(actual, FieldValue::Text(text) if text == option)),
        serde_yaml::Value::Mapping(bounds) => {
            let FieldValue::Number(number) = actual else {
                return false;
            };
            for (bound, limit) in bounds {
                let Some(limit) = limit.as_f64() else {
                    return false;
                };
                match bound.as_str() {
                    Some("lt") if *number < limit => {}
                    Some("gt") if *number > limit => {}
                    _ => return false,
                }
            }
            true
        }
        serde_yaml::Value::Bool(flag) => {
            matches!(actual, FieldValue::Flag(value) if value == flag)
        }
        other => match (actual, other.as_str()) {
            (FieldValue::Text(text), Some(expected_text)) => text == expected_text,
            _ => false,
        },
    }
}

// ----------------------------------------------------------------------
// Scoring
// ----------------------------------------------------------------------

pub fn score_gems(
    store: &Store,
    scoring: &ScoringConfig,
    cancel: &CancelToken,
) -> Result<usize, StageError> {
    let relationships = store.relationship_map()?;
    let gems = store.list_gems(&crate::store::GemFilter::default())?;

    let mut scored = 0usize;
    for gem in &gems {
        cancel.check()?;
        let Some(profile) = store.get_profile(&gem.sender_domain)? else {
            continue;
        };
        let relationship = relationships.get(&gem.sender_domain);
        let relationship_type = relationship
            .map(|r| r.relationship_type)
            .unwrap_or(RelationshipType::Unknown);
        let suppress = relationship.is_some_and(|r| r.suppress_gems);

        let sender_gem_types = store.gem_types_for_domain(&gem.sender_domain)?;
        let score = opportunity_score(
            &profile,
            &sender_gem_types,
            relationship_type,
            suppress,
            scoring,
        );
        store.update_gem_score(gem.id, score)?;
        scored += 1;
    }
    Ok(scored)
}

/// The scoring formula: base profile subscore (max 40) + inbound signal
/// subscore (max 30) + gem bonus (max 30), then the relationship cap.
pub fn opportunity_score(
    profile: &SenderProfile,
    gem_types: &HashSet<GemType>,
    relationship: RelationshipType,
    suppress_gems: bool,
    scoring: &ScoringConfig,
) -> i64 {
    if suppress_gems {
        return 0;
    }
    let weights = &scoring.weights;
    let mut score = 0.0;

    // Inbound signal subscore.
    if let Some(initiation) = profile.thread_initiation_ratio {
        score += (1.0 - initiation) * weights.inbound_initiation;
    }
    if let Some(reply_rate) = profile.user_reply_rate {
        score += reply_rate.min(1.0) * weights.inbound_engagement;
    }

    // Base profile subscore.
    score += match profile.company_size.as_str() {
        "small" => weights.reachability,
        "medium" => weights.reachability * 0.7,
        _ => weights.reachability * 0.2,
    };
    score += if scoring.target_industries.contains(&profile.industry) {
        weights.relevance
    } else {
        weights.relevance * 0.25
    };
    if let Some(days) = days_since(profile.last_contact.as_deref()) {
        if days <= 30 {
            score += weights.recency;
        } else if days <= 90 {
            score += weights.recency * 0.5;
        }
    }
    if profile.known_contacts.iter().any(|c| !c.role.is_empty()) {
        score += weights.known_contacts;
    } else if !profile.known_contacts.is_empty() {
        score += weights.known_contacts * 0.2;
    }
    if relationship.is_opportunity_side() && !profile.monetary_signals.is_empty() {
        score += weights.monetary_signals;
    }

    // Gem bonus: diversity capped, then explicit per-type bonuses.
    let emitted: Vec<&GemType> = gem_types
        .iter()
        .filter(|ty| **ty != GemType::VendorUpsell)
        .collect();
    score += (emitted.len() as f64 * weights.gem_diversity_per_type)
        .min(weights.gem_diversity_cap);
    if gem_types.contains(&GemType::DormantWarmThread) {
        score += weights.dormant_thread_bonus;
    }
    if gem_types.contains(&GemType::PartnerProgram) {
        score += weights.partner_bonus;
    }
    if gem_types.contains(&GemType::ProcurementSignal) {
        score += weights.procurement_bonus;
    }

    let cap = scoring.relationship_caps.cap(relationship);
    (score as i64).min(cap).clamp(0, 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GemExplanation, GemSignal, NewGem};

    fn profile(domain: &str) -> SenderProfile {
        SenderProfile {
            sender_domain: domain.to_string(),
            company_name: "Acme".to_string(),
            company_size: "small".to_string(),
            industry: "SaaS".to_string(),
            thread_initiation_ratio: Some(0.0),
            user_reply_rate: Some(1.0),
            last_contact: Some(Utc::now().to_rfc3339()),
            known_contacts: vec![crate::models::Contact {
                name: "Jane".to_string(),
                role: "VP Marketing".to_string(),
                email: "jane@acme.com".to_string(),
            }],
            monetary_signals: vec![crate::models::MonetarySignal {
                amount: "$10,000".to_string(),
                context: "USD amount".to_string(),
            }],
            ..SenderProfile::default()
        }
    }

    #[test]
    fn perfect_prospect_hits_the_uncapped_maximum_zone() {
        let gem_types = HashSet::from([
            GemType::DormantWarmThread,
            GemType::PartnerProgram,
            GemType::ProcurementSignal,
        ]);
        let score = opportunity_score(
            &profile("acme.com"),
            &gem_types,
            RelationshipType::InboundProspect,
            false,
            &ScoringConfig::default(),
        );
        // 30 inbound + 40 base + 35 gem bonus, capped by the formula parts.
        assert!(score >= 90, "got {score}");
        assert!(score <= 100);
    }

    #[test]
    fn relationship_caps_bound_the_score() {
        let gem_types = HashSet::from([GemType::RenewalLeverage]);
        let config = ScoringConfig::default();
        let base = profile("stripe.com");

        let vendor = opportunity_score(&base, &gem_types, RelationshipType::MyVendor, false, &config);
        assert!(vendor <= 25);

        let infra = opportunity_score(
            &base,
            &gem_types,
            RelationshipType::MyInfrastructure,
            false,
            &config,
        );
        assert!(infra <= 5);

        let selling =
            opportunity_score(&base, &gem_types, RelationshipType::SellingToMe, false, &config);
        assert!(selling <= 20);
    }

    #[test]
    fn suppress_flag_zeroes_the_score() {
        let score = opportunity_score(
            &profile("acme.com"),
            &HashSet::from([GemType::DormantWarmThread]),
            RelationshipType::WarmContact,
            true,
            &ScoringConfig::default(),
        );
        assert_eq!(score, 0);
    }

    #[test]
    fn monetary_subscore_is_gated_to_opportunity_side() {
        let mut no_gems = HashSet::new();
        no_gems.insert(GemType::RenewalLeverage);
        let config = ScoringConfig::default();
        let base = profile("acme.com");

        let opportunity =
            opportunity_score(&base, &no_gems, RelationshipType::InboundProspect, false, &config);
        let customer_side = {
            // Raise the vendor cap so the monetary difference is observable.
            let mut generous = config.clone();
            generous.relationship_caps.my_vendor = 100;
            opportunity_score(&base, &no_gems, RelationshipType::MyVendor, false, &generous)
        };
        assert_eq!(
            opportunity - customer_side,
            config.weights.monetary_signals as i64
        );
    }

    #[test]
    fn segment_assignment_covers_all_six_maps() {
        let store = Store::in_memory().expect("store");
        let mut p = profile("acme.com");
        p.economic_segments = vec![
            "spend_map".to_string(),
            "partner_map".to_string(),
            "prospect_map".to_string(),
            "distribution_map".to_string(),
            "procurement_map".to_string(),
        ];
        p.renewal_dates = vec!["June 15, 2099".to_string()];
        p.marketing_sophistication_avg = 2.0;
        p.offer_type_distribution =
            std::collections::HashMap::from([("newsletter".to_string(), 3)]);
        store.upsert_profile(&p).expect("profile");

        assign_segments(&store, &CancelToken::new()).expect("assign");
        let segments = store.segments_for_domain("acme.com").expect("segments");
        let pairs: HashSet<(String, String)> = segments
            .iter()
            .map(|s| (s.segment.clone(), s.sub_segment.clone()))
            .collect();
        assert!(pairs.contains(&("spend_map".to_string(), "upcoming_renewal".to_string())));
        assert!(pairs.contains(&("prospect_map".to_string(), "hot_lead".to_string())));
        assert!(pairs.contains(&("distribution_map".to_string(), "newsletter".to_string())));
        assert!(pairs.contains(&("procurement_map".to_string(), "evaluation".to_string())));
    }

    #[test]
    fn churned_vendors_are_flagged_in_spend_map() {
        let mut p = profile("old.com");
        p.last_contact = Some((Utc::now() - chrono::Duration::days(200)).to_rfc3339());
        p.renewal_dates = vec!["June 15, 2099".to_string()];
        let subs = spend_subsegments(&p);
        assert_eq!(subs[0].0, "churned_vendor");
    }

    #[test]
    fn scoring_stage_rewrites_gem_scores() {
        let store = Store::in_memory().expect("store");
        let p = profile("acme.com");
        store.upsert_profile(&p).expect("profile");
        store
            .set_relationship("acme.com", RelationshipType::WarmContact, None, false, "manual")
            .expect("relationship");
        let gem_id = store
            .insert_gem(&NewGem {
                gem_type: GemType::DormantWarmThread,
                sender_domain: "acme.com".to_string(),
                thread_id: Some("t1".to_string()),
                score: 999,
                explanation: GemExplanation {
                    gem_type: GemType::DormantWarmThread,
                    summary: "dormant".to_string(),
                    signals: vec![GemSignal::evidence("warm_pricing", "pricing")],
                    confidence: 0.8,
                    estimated_value: "high".to_string(),
                    urgency: "high".to_string(),
                },
                recommended_actions: Vec::new(),
                source_message_ids: Vec::new(),
            })
            .expect("gem");

        score_gems(&store, &ScoringConfig::default(), &CancelToken::new()).expect("score");
        let gem = store.get_gem(gem_id).expect("get").expect("exists");
        assert!(gem.score <= 90, "warm contact cap, got {}", gem.score);
        assert!(gem.score > 0);
    }

    #[test]
    fn custom_segment_rules_match_profiles() {
        let store = Store::in_memory().expect("store");
        let mut p = profile("acme.com");
        p.marketing_sophistication_avg = 2.5;
        store.upsert_profile(&p).expect("profile");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("segments.yaml");
        std::fs::write(
            &path,
            "custom_segments:\n  - name: easy_wins\n    priority: hot\n    rules:\n      company_size: [small, medium]\n      marketing_sophistication_avg:\n        lt: 4\n",
        )
        .expect("write");

        let assigned = evaluate_custom_segments(&store, Some(&path)).expect("evaluate");
        assert_eq!(assigned, 1);
        let segments = store.segments_for_domain("acme.com").expect("segments");
        assert!(segments
            .iter()
            .any(|s| s.segment == "custom:easy_wins" && s.sub_segment == "hot"));
    }
}
