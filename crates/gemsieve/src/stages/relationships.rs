//! Relationship detection: where a sender sits in the user's commerce graph.
//!
//! Precedence is absolute: a stored `sender_relationships` row wins, then the
//! known-entity lists, then signal-weighted detection, then `unknown`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::known::KnownEntities;
use crate::models::{GemSignal, RelationshipType, SenderProfile};
use crate::stages::StageError;
use crate::store::Store;

const CONTENT_SCAN_LIMIT: usize = 10;
/// Auto-detections at or above this confidence may be applied.
pub const APPLY_THRESHOLD: f64 = 0.6;

static VENDOR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b(?:invoice|receipt|payment|subscription|billing|renewal)\b",
        r"\byour (?:account|plan|subscription|license|trial)\b",
        r"\bservice (?:update|notification|alert)\b",
        r"\b(?:onboarding|getting started|welcome to)\b",
        r"\b(?:support ticket|case #|helpdesk)\b",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("vendor pattern"))
    .collect()
});

static PROSPECT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\binterested in (?:your|learning about)\b",
        r"\bcan you (?:help|tell me|share)\b",
        r"\blooking for (?:a|an|someone|help)\b",
        r"\breferr(?:ed|al) (?:by|from)\b",
        r"\bsaw your (?:work|talk|article|post)\b",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("prospect pattern"))
    .collect()
});

static SELLING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bI (?:wanted to|thought you|noticed your)\b",
        r"\b(?:quick question|touching base|reaching out)\b",
        r"\bbook a (?:demo|call|meeting)\b",
        r"\b(?:free trial|special offer|limited time)\b",
        r"\bwould you be (?:open|interested)\b",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("selling pattern"))
    .collect()
});

static COMPLETION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bfinal (?:deliverable|version|report|invoice)\b",
        r"\bproject (?:complete|finished|wrapped|closed)\b",
        r"\bthanks? for (?:everything|your work|the help)\b",
        r"\bgreat working with you\b",
        r"\bcontract (?:ended|expired|terminated|concluded)\b",
        r"\bengagement (?:complete|concluded)\b",
        r"\bclosing (?:out|this|the) (?:the )?project\b",
        r"\ball set\b[^\n]*\bthanks\b",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("completion pattern"))
    .collect()
});

/// One auto-detection result for a profiled sender.
#[derive(Debug, Clone)]
pub struct RelationshipProposal {
    pub sender_domain: String,
    pub proposed_type: RelationshipType,
    pub confidence: f64,
    pub signals: Vec<GemSignal>,
}

/// Classify every profiled sender; with `apply`, persist detections at or
/// above the confidence threshold without overwriting manual rows.
pub fn detect_all(
    store: &Store,
    known: &KnownEntities,
    apply: bool,
) -> Result<Vec<RelationshipProposal>, StageError> {
    let mut proposals = Vec::new();
    for profile in store.list_profiles()? {
        let (proposed_type, confidence, signals) = classify(store, &profile, known)?;
        let proposal = RelationshipProposal {
            sender_domain: profile.sender_domain.clone(),
            proposed_type,
            confidence,
            signals,
        };

        if apply && proposal.confidence >= APPLY_THRESHOLD {
            let existing = store.get_relationship(&proposal.sender_domain)?;
            let manual = existing.as_ref().is_some_and(|r| r.source == "manual");
            if !manual {
                let note_signals: Vec<&str> = proposal
                    .signals
                    .iter()
                    .take(3)
                    .map(|s| s.signal.as_str())
                    .collect();
                let suppress = matches!(
                    proposal.proposed_type,
                    RelationshipType::MyInfrastructure | RelationshipType::Institutional
                );
                store.set_relationship(
                    &proposal.sender_domain,
                    proposal.proposed_type,
                    Some(&format!("Auto-detected: {}", note_signals.join(", "))),
                    suppress,
                    "auto_detected",
                )?;
            }
        }

        proposals.push(proposal);
    }
    Ok(proposals)
}

/// Classification used by the gem gate: (type, confidence, signals).
pub fn classify(
    store: &Store,
    profile: &SenderProfile,
    known: &KnownEntities,
) -> Result<(RelationshipType, f64, Vec<GemSignal>), StageError> {
    let domain = &profile.sender_domain;

    // 1. A user- or import-created row wins absolutely.
    if let Some(existing) = store.get_relationship(domain)? {
        return Ok((
            existing.relationship_type,
            1.0,
            vec![GemSignal::evidence("existing_classification", domain.clone())],
        ));
    }

    // 2. Known-entity lists, matched on the organizational root.
    if let Some(category) = known.category_of(domain) {
        return Ok((
            category.relationship(),
            0.9,
            vec![GemSignal::evidence("known_entity", domain.clone())],
        ));
    }

    // 3. Signal-weighted detection.
    let (vendor_score, vendor_signals) = scan_vendor_signals(store, profile)?;
    let (prospect_score, prospect_signals) = scan_prospect_signals(store, profile)?;
    let (selling_score, selling_signals) = scan_selling_signals(store, profile)?;

    let mut best = (RelationshipType::MyVendor, vendor_score, vendor_signals);
    if prospect_score > best.1 {
        best = (RelationshipType::InboundProspect, prospect_score, prospect_signals);
    }
    if selling_score > best.1 {
        best = (RelationshipType::SellingToMe, selling_score, selling_signals);
    }

    if best.1 >= 0.3 {
        return Ok(best);
    }

    // Low confidence: community and warm-contact fallbacks before unknown.
    if profile.economic_segments.iter().any(|s| s == "distribution_map") {
        return Ok((
            RelationshipType::Community,
            0.6,
            vec![GemSignal::evidence("distribution_segment", domain.clone())],
        ));
    }
    if let (Some(initiation), Some(reply_rate)) =
        (profile.thread_initiation_ratio, profile.user_reply_rate)
    {
        if initiation > 0.2 && initiation < 0.8 && reply_rate > 0.5 {
            return Ok((
                RelationshipType::WarmContact,
                0.5,
                vec![GemSignal::evidence(
                    "bidirectional_engagement",
                    format!("initiation={initiation:.2}, reply_rate={reply_rate:.2}"),
                )],
            ));
        }
    }

    Ok((RelationshipType::Unknown, 0.2, Vec::new()))
}

fn scan_vendor_signals(
    store: &Store,
    profile: &SenderProfile,
) -> Result<(f64, Vec<GemSignal>), StageError> {
    let mut signals = Vec::new();
    let mut score: f64 = 0.0;

    // The user reaching out first is the vendor tell.
    if let Some(initiation) = profile.thread_initiation_ratio {
        if initiation > 0.7 {
            signals.push(GemSignal::evidence(
                "user_initiates_contact",
                format!("ratio={initiation:.2}"),
            ));
            score += 0.3;
        }
    }

    let bodies = store.inbound_bodies_for_domain(&profile.sender_domain, CONTENT_SCAN_LIMIT)?;
    let mut hits = 0;
    for body in &bodies {
        if let Some(pattern) = VENDOR_PATTERNS.iter().find(|p| p.is_match(body)) {
            hits += 1;
            if signals.len() < 5 {
                signals.push(GemSignal::evidence("vendor_content", pattern.as_str()));
            }
        }
    }
    if hits >= 3 {
        score += 0.4;
    } else if hits >= 1 {
        score += 0.2;
    }

    if profile.economic_segments.iter().any(|s| s == "spend_map") {
        signals.push(GemSignal::evidence("spend_map_segment", ""));
        score += 0.2;
    }

    Ok((score.min(1.0), signals))
}

fn scan_prospect_signals(
    store: &Store,
    profile: &SenderProfile,
) -> Result<(f64, Vec<GemSignal>), StageError> {
    let mut signals = Vec::new();
    let mut score: f64 = 0.0;

    if let Some(initiation) = profile.thread_initiation_ratio {
        if initiation < 0.3 {
            signals.push(GemSignal::evidence(
                "they_initiate_contact",
                format!("ratio={initiation:.2}"),
            ));
            score += 0.2;
        }
    }
    if let Some(reply_rate) = profile.user_reply_rate {
        if reply_rate > 0.5 {
            signals.push(GemSignal::evidence(
                "high_user_engagement",
                format!("reply_rate={reply_rate:.2}"),
            ));
            score += 0.2;
        }
    }

    let bodies = store.inbound_bodies_for_domain(&profile.sender_domain, CONTENT_SCAN_LIMIT)?;
    for body in &bodies {
        if let Some(pattern) = PROSPECT_PATTERNS.iter().find(|p| p.is_match(body)) {
            signals.push(GemSignal::evidence("prospect_language", pattern.as_str()));
            score += 0.3;
            break;
        }
    }

    if matches!(profile.company_size.as_str(), "small" | "") && profile.total_messages <= 5 {
        signals.push(GemSignal::evidence("small_unknown_company", ""));
        score += 0.1;
    }

    Ok((score.min(1.0), signals))
}

fn scan_selling_signals(
    store: &Store,
    profile: &SenderProfile,
) -> Result<(f64, Vec<GemSignal>), StageError> {
    let mut signals = Vec::new();
    let mut score: f64 = 0.0;

    if let Some(reply_rate) = profile.user_reply_rate {
        if reply_rate < 0.1 {
            signals.push(GemSignal::evidence(
                "no_user_participation",
                format!("reply_rate={reply_rate:.2}"),
            ));
            score += 0.3;
        }
        if profile.total_messages >= 5 && reply_rate < 0.2 {
            signals.push(GemSignal::evidence(
                "high_volume_one_way",
                format!("{} messages, no replies", profile.total_messages),
            ));
            score += 0.2;
        }
    }

    let bodies = store.inbound_bodies_for_domain(&profile.sender_domain, CONTENT_SCAN_LIMIT)?;
    for body in &bodies {
        if let Some(pattern) = SELLING_PATTERNS.iter().find(|p| p.is_match(body)) {
            signals.push(GemSignal::evidence("selling_language", pattern.as_str()));
            score += 0.2;
            break;
        }
    }

    let cold = store.count_intent_for_domain(&profile.sender_domain, "cold_outreach")?;
    if cold > 0 {
        signals.push(GemSignal::evidence(
            "cold_outreach_intent",
            format!("{cold} messages"),
        ));
        score += 0.3;
    }

    Ok((score.min(1.0), signals))
}

/// Completion signals in the last 3 messages (fewer means all available) of
/// a thread. Any match vetoes dormant-thread gems.
pub fn scan_completion_signals(store: &Store, thread_id: &str) -> Result<Vec<String>, StageError> {
    let messages = store.messages_in_thread(thread_id)?;
    let tail = messages.iter().rev().take(3);

    let mut found = Vec::new();
    for message in tail {
        let text = match store.get_parsed_content(&message.message_id)? {
            Some(content) if !content.body_clean.is_empty() => content.body_clean,
            _ => crate::mail::message_body(message),
        };
        for pattern in COMPLETION_PATTERNS.iter() {
            if let Some(m) = pattern.find(&text) {
                found.push(m.as_str().to_string());
            }
        }
    }
    Ok(found)
}

/// Matches the completion set against one body; used by detector tests and
/// thread inspection.
pub fn completion_signals_in(text: &str) -> Vec<String> {
    COMPLETION_PATTERNS
        .iter()
        .filter_map(|pattern| pattern.find(text).map(|m| m.as_str().to_string()))
        .collect()
}
