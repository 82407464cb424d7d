//! Content-aware thread state: who owes the next reply.
//!
//! The decision looks at the last message's body, not just its direction.
//! Concluded sign-offs in the closing lines beat everything; otherwise an
//! open question hands the ball to the other side.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::AwaitingResponse;

/// How many closing lines are scanned for concluded sign-offs.
const CLOSING_LINE_WINDOW: usize = 3;

static QUESTION_SIGNALS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\?\s*$",
        r"\bthoughts\b",
        r"\binterested\b",
        r"\blet me know\b",
        r"\bcircle back\b",
        r"\bfollow up\b",
        r"\bwhat do you think\b",
        r"\bcan you\b",
        r"\bcould you\b",
        r"\bwould you\b",
        r"\bdo you have\b",
        r"\bwhen can\b",
        r"\bschedule\s+(?:a\s+)?(?:quick\s+)?call\b",
        r"\bbook\s+(?:a\s+|some\s+)?time\b",
    ]
    .iter()
    .map(|pattern| Regex::new(&format!("(?im){pattern}")).expect("question signal pattern"))
    .collect()
});

static CONCLUDED_SIGNALS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^thanks[.!]?$",
        r"^thank you[.!]?$",
        r"^sounds good[.!]?$",
        r"^great, thanks[.!]?$",
        r"^will do[.!]?$",
        r"^no worries[.!]?$",
        r"^talk soon[.!]?$",
        r"^see you[.!]?$",
        r"\ball set\b",
        r"\bthanks for everything\b",
    ]
    .iter()
    .map(|pattern| Regex::new(&format!("(?i){pattern}")).expect("concluded signal pattern"))
    .collect()
});

/// Classify who owes a reply given the last message body and its direction.
pub fn classify_awaiting(last_body: &str, is_sent_by_user: bool) -> AwaitingResponse {
    let body = last_body.trim();
    if body.is_empty() {
        return if is_sent_by_user {
            AwaitingResponse::Other
        } else {
            AwaitingResponse::User
        };
    }

    let closing: Vec<&str> = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .rev()
        .take(CLOSING_LINE_WINDOW)
        .collect();
    for line in &closing {
        if CONCLUDED_SIGNALS.iter().any(|signal| signal.is_match(line)) {
            return AwaitingResponse::None;
        }
    }

    let has_question = QUESTION_SIGNALS.iter().any(|signal| signal.is_match(body));
    match (is_sent_by_user, has_question) {
        (true, true) => AwaitingResponse::Other,
        (true, false) => AwaitingResponse::None,
        (false, true) => AwaitingResponse::User,
        (false, false) => AwaitingResponse::None,
    }
}

/// Whole days between a stored message date and now (UTC). Unparseable
/// dates count as zero dormancy rather than poisoning the thread.
pub fn days_dormant(last_message_date: Option<&str>, now: DateTime<Utc>) -> i64 {
    let Some(raw) = last_message_date else {
        return 0;
    };
    let Some(parsed) = parse_date(raw) else {
        return 0;
    };
    (now - parsed).num_days().max(0)
}

/// RFC 3339 first (the canonical stored form), RFC 2822 as a fallback for
/// rows ingested before date normalization.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn empty_body_falls_back_to_direction() {
        assert_eq!(classify_awaiting("", true), AwaitingResponse::Other);
        assert_eq!(classify_awaiting("", false), AwaitingResponse::User);
        assert_eq!(classify_awaiting("  \n ", false), AwaitingResponse::User);
    }

    #[test]
    fn concluded_closing_line_wins_over_questions() {
        let body = "Can you send the invoice?\n\nThanks for everything - all set.";
        assert_eq!(classify_awaiting(body, false), AwaitingResponse::None);
        assert_eq!(
            classify_awaiting("Sounds good!", false),
            AwaitingResponse::None
        );
    }

    #[test]
    fn inbound_question_means_user_owes_a_reply() {
        assert_eq!(
            classify_awaiting("What's your pricing for a team of 30?", false),
            AwaitingResponse::User
        );
        assert_eq!(
            classify_awaiting("Let me know if that works.", false),
            AwaitingResponse::User
        );
    }

    #[test]
    fn outbound_question_hands_the_ball_to_the_other_side() {
        assert_eq!(
            classify_awaiting("Could you share the contract draft?", true),
            AwaitingResponse::Other
        );
        assert_eq!(
            classify_awaiting("Here's the report you asked for.", true),
            AwaitingResponse::None
        );
    }

    #[test]
    fn statement_only_inbound_body_needs_no_reply() {
        assert_eq!(
            classify_awaiting("We shipped the new dashboard today.", false),
            AwaitingResponse::None
        );
    }

    #[test]
    fn concluded_scan_only_covers_the_closing_window() {
        // A sign-off buried early in a long body must not conclude the thread.
        let body = "Thanks.\nOne more thing though.\nLine.\nLine.\nCan you review the doc?";
        assert_eq!(classify_awaiting(body, false), AwaitingResponse::User);
    }

    #[test]
    fn dormancy_counts_whole_days() {
        let now = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
        assert_eq!(days_dormant(Some("2025-05-17T12:00:00Z"), now), 45);
        assert_eq!(days_dormant(Some("not a date"), now), 0);
        assert_eq!(days_dormant(None, now), 0);
    }

    #[test]
    fn parse_date_accepts_both_stored_formats() {
        assert!(parse_date("2025-06-01T10:00:00Z").is_some());
        assert!(parse_date("Sun, 1 Jun 2025 10:00:00 +0000").is_some());
        assert!(parse_date("tomorrow").is_none());
    }
}
