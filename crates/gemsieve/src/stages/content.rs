//! Body parsing: HTML to clean text, quote/signature/footer stripping,
//! CTA and offer extraction, link intent classification.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::models::{Message, ParsedContent};
use crate::stages::{CancelToken, StageError, StageReport};
use crate::store::Store;

/// How many trailing lines are scanned bottom-up for marketing footers.
const FOOTER_WINDOW: usize = 12;
const MAX_CTA_LEN: usize = 80;
const MAX_CTAS: usize = 50;

pub fn run(store: &Store, cancel: &CancelToken) -> Result<StageReport, StageError> {
    let mut report = StageReport::default();
    for message in store.messages_without_content()? {
        cancel.check()?;
        let content = parse_message(&message);
        store.upsert_parsed_content(&content)?;
        report.processed += 1;
    }
    Ok(report)
}

static QUOTE_INTRO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^On\s+.+wrote:\s*$").expect("quote intro"));
static SIGNOFF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(Best regards|Kind regards|Regards|Thanks|Thank you|Cheers|Sincerely|Best|Warm regards|All the best|Sent from my iPhone|Sent from my iPad|Get Outlook for),?\s*$",
    )
    .expect("signoff")
});
static FOOTER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bunsubscribe\b",
        r"(?i)view (?:this email )?in (?:your )?browser",
        r"(?i)(?:©|\(c\))\s*\d{4}",
        r"(?i)\ball rights reserved\b",
        r"(?i)\bprivacy policy\b",
        r"(?i)this email was sent (?:by|to)",
        r"(?i)\bpowered by \w+",
        r"(?i)\bupdate (?:your )?(?:email )?preferences\b",
        r"(?i)\bno longer wish to receive\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("footer pattern"))
    .collect()
});
static PERSONALIZATION_TOKENS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"%%[A-Z_]+%%", r"\{\{[^}]+\}\}", r"\*\|[A-Z_]+\|\*"]
        .iter()
        .map(|p| Regex::new(p).expect("personalization pattern"))
        .collect()
});
static PHYSICAL_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\d{1,5}\s+[\w\s]+(?:Street|St|Avenue|Ave|Boulevard|Blvd|Road|Rd|Drive|Dr|Lane|Ln|Way|Court|Ct)[,.\s]+[\w\s]+[,.\s]+[A-Z]{2}\s+\d{5}",
    )
    .expect("address pattern")
});

/// Offer detection table: tag, patterns.
static OFFER_PATTERNS: Lazy<Vec<(&'static str, Vec<Regex>)>> = Lazy::new(|| {
    let table: [(&str, &[&str]); 12] = [
        ("discount", &[r"\d+%\s*off", r"\$\d+\s*off", r"save\s+\$?\d+", r"coupon", r"promo code"]),
        ("free_trial", &[r"free trial", r"try free", r"start free", r"\d+[- ]day trial"]),
        ("webinar", &[r"webinar", r"live demo", r"register now", r"join us live"]),
        (
            "product_launch",
            &[r"just launched", r"introducing", r"now available", r"new release", r"announcing"],
        ),
        ("urgency", &[r"limited time", r"expires", r"last chance", r"ends tonight", r"only \d+ left"]),
        ("social_proof", &[r"trusted by", r"join \d+", r"\d+ customers", r"as seen in", r"rated \d"]),
        ("event", &[r"conference", r"summit", r"meetup", r"workshop"]),
        ("newsletter", &[r"this week in", r"weekly digest", r"roundup", r"top stories"]),
        (
            "renewal",
            &[
                r"renewal", r"subscription renew", r"upcoming charge", r"plan expires",
                r"auto-renew", r"billing cycle", r"annual renewal",
            ],
        ),
        (
            "partnership",
            &[
                r"partner program", r"affiliate", r"referral program", r"reseller",
                r"become a partner", r"earn commission", r"revenue share",
            ],
        ),
        (
            "procurement",
            &[
                r"security review", r"vendor assessment", r"SOC 2", r"compliance",
                r"data processing agreement", r"\bDPA\b", r"\bMSA\b", r"terms of service update",
            ],
        ),
        ("community", &[r"community", r"\bforum\b", r"\bslack group\b", r"\bdiscord\b"]),
    ];
    table
        .iter()
        .map(|(tag, patterns)| {
            (
                *tag,
                patterns
                    .iter()
                    .map(|p| Regex::new(&format!("(?i){p}")).expect("offer pattern"))
                    .collect(),
            )
        })
        .collect()
});

/// Ordered link-intent table; first match wins, unmatched links are dropped.
const LINK_INTENTS: [(&str, &[&str]); 7] = [
    ("pricing_page", &["pricing", "plans", "packages", "/pricing", "cost"]),
    ("demo_booking", &["demo", "book-a-call", "calendly", "schedule"]),
    ("partner_program", &["partner", "affiliate", "referral", "reseller", "/partners"]),
    ("marketplace_listing", &["marketplace", "app-store", "integrations", "/apps"]),
    ("job_posting", &["careers", "jobs", "hiring", "we-re-hiring", "/jobs"]),
    ("case_study", &["case-study", "customer-story", "success-story"]),
    ("free_tool", &["free-tool", "calculator", "generator", "template"]),
];

pub fn parse_message(message: &Message) -> ParsedContent {
    let mut content = ParsedContent {
        message_id: message.message_id.clone(),
        ..ParsedContent::default()
    };

    let full_text = match &message.body_html {
        Some(html) if !html.trim().is_empty() => {
            parse_html(html, &mut content);
            // parse_html leaves the flattened text in body_clean temporarily
            std::mem::take(&mut content.body_clean)
        }
        _ => message.body_text.clone().unwrap_or_default(),
    };

    let (without_quotes, signature) = strip_signature_and_quotes(&full_text);
    let (body_clean, footer) = strip_footer(&without_quotes);
    content.body_clean = body_clean.trim().to_string();
    content.signature_block = signature;
    content.footer_block = footer;

    content.offer_types = detect_offers(&content.body_clean);

    if let Some(address) = PHYSICAL_ADDRESS.find(&content.body_clean) {
        content.has_physical_address = true;
        content.physical_address_text = Some(address.as_str().trim().to_string());
    }

    content
}

fn parse_html(html: &str, content: &mut ParsedContent) {
    let document = Html::parse_document(html);
    let img_sel = Selector::parse("img").expect("img selector");
    let a_sel = Selector::parse("a[href]").expect("anchor selector");
    let button_sel = Selector::parse("button").expect("button selector");
    let table_sel = Selector::parse("table").expect("table selector");
    let styled_sel = Selector::parse("[style]").expect("styled selector");
    let heading_sel = Selector::parse("h1, h2").expect("heading selector");

    // Images and tracking pixels (1x1 or 0-sized spacers).
    let mut tracking_pixels = 0i64;
    let mut image_count = 0i64;
    for img in document.select(&img_sel) {
        image_count += 1;
        let width = img.value().attr("width").unwrap_or("");
        let height = img.value().attr("height").unwrap_or("");
        if matches!(width, "0" | "1") || matches!(height, "0" | "1") {
            tracking_pixels += 1;
        }
    }
    content.image_count = image_count;
    content.tracking_pixel_count = tracking_pixels;

    // Links: counts, domains, UTM parameters, intents, CTAs, social.
    let mut urls = Vec::new();
    let mut cta_texts = Vec::new();
    for anchor in document.select(&a_sel) {
        let href = anchor.value().attr("href").unwrap_or("");
        if href.starts_with("http") {
            urls.push(href.to_string());
        }
        let classes = anchor.value().attr("class").unwrap_or("").to_ascii_lowercase();
        let style = anchor.value().attr("style").unwrap_or("");
        let text = anchor.text().collect::<String>().trim().to_string();
        let is_cta = classes.contains("button")
            || classes.contains("btn")
            || classes.contains("cta")
            || style.contains("background-color")
            || style.contains("background:");
        if is_cta && !text.is_empty() && text.len() < MAX_CTA_LEN {
            cta_texts.push(text);
        }
    }
    for button in document.select(&button_sel) {
        let text = button.text().collect::<String>().trim().to_string();
        if !text.is_empty() && text.len() < MAX_CTA_LEN {
            cta_texts.push(text);
        }
    }
    content.link_count = urls.len() as i64;
    content.cta_texts = dedupe_preserving_order(cta_texts, MAX_CTAS);

    let mut domains = HashSet::new();
    let mut utm_campaigns = Vec::new();
    let mut link_intents: HashMap<String, Vec<String>> = HashMap::new();
    let mut social_links = HashMap::new();
    for raw in &urls {
        let parsed = Url::parse(raw).ok();
        if let Some(url) = &parsed {
            if let Some(host) = url.host_str() {
                domains.insert(host.to_string());
            }
            let mut utm = HashMap::new();
            for (key, value) in url.query_pairs() {
                if matches!(
                    key.as_ref(),
                    "utm_source" | "utm_medium" | "utm_campaign" | "utm_content"
                ) {
                    utm.insert(key.to_string(), value.to_string());
                }
            }
            if !utm.is_empty() {
                utm_campaigns.push(utm);
            }
        }

        let lower = raw.to_ascii_lowercase();
        for (intent, needles) in LINK_INTENTS {
            if needles.iter().any(|needle| lower.contains(needle)) {
                link_intents
                    .entry(intent.to_string())
                    .or_default()
                    .push(raw.clone());
                break;
            }
        }

        for (platform, needle) in [
            ("twitter", "twitter.com/"),
            ("twitter", "x.com/"),
            ("linkedin", "linkedin.com/"),
            ("facebook", "facebook.com/"),
            ("instagram", "instagram.com/"),
            ("youtube", "youtube.com/"),
        ] {
            if lower.contains(needle) && !social_links.contains_key(platform) {
                social_links.insert(platform.to_string(), raw.clone());
            }
        }
    }
    let mut sorted_domains: Vec<String> = domains.into_iter().collect();
    sorted_domains.sort();
    content.unique_link_domains = sorted_domains;
    content.utm_campaigns = utm_campaigns;
    content.link_intents = link_intents;
    content.social_links = social_links;

    // Primary headline: first H1, else first H2.
    content.primary_headline = document
        .select(&heading_sel)
        .map(|h| h.text().collect::<String>().trim().to_string())
        .find(|text| !text.is_empty());

    // Personalization tokens anywhere in the raw markup.
    let mut tokens = HashSet::new();
    for pattern in PERSONALIZATION_TOKENS.iter() {
        for token in pattern.find_iter(html) {
            tokens.insert(token.as_str().to_string());
        }
    }
    if !tokens.is_empty() {
        content.has_personalization = true;
        let mut sorted: Vec<String> = tokens.into_iter().collect();
        sorted.sort();
        content.personalization_tokens = sorted;
    }

    // Template complexity: weighted structural counts, clipped to 0..100.
    let table_count = document.select(&table_sel).count() as i64;
    let styled_count = document.select(&styled_sel).count() as i64;
    let mut score = 0i64;
    score += (table_count * 5).min(25);
    score += (styled_count * 2).min(20);
    if html.contains("@media") {
        score += 15;
    }
    score += (content.image_count * 3).min(15);
    score += (content.link_count * 2).min(15);
    if content.has_personalization {
        score += 10;
    }
    content.template_complexity_score = score.min(100);

    // Flattened text for the downstream strip passes; the caller moves this
    // into body_clean once quotes/signature/footer are removed.
    let text = document
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join("\n");
    content.body_clean = text;
}

/// Remove quoted replies and the trailing signature, preserving the latter.
fn strip_signature_and_quotes(text: &str) -> (String, Option<String>) {
    let lines: Vec<&str> = text.lines().collect();
    let mut clean = Vec::new();
    let mut signature_start = None;

    for (i, line) in lines.iter().enumerate() {
        let stripped = line.trim();
        if QUOTE_INTRO.is_match(stripped) || stripped.contains("gmail_quote") {
            break;
        }
        if stripped.starts_with('>') {
            continue;
        }
        if matches!(stripped, "--" | "-- " | "\u{2014}") || SIGNOFF.is_match(stripped) {
            signature_start = Some(i);
            break;
        }
        clean.push(*line);
    }

    let signature = signature_start.map(|start| lines[start..].join("\n").trim().to_string());
    (clean.join("\n"), signature)
}

/// Scan the final window of lines bottom-up; once a marketing-footer pattern
/// matches, everything from that line onward moves to the footer segment.
fn strip_footer(text: &str) -> (String, Option<String>) {
    let lines: Vec<&str> = text.lines().collect();
    let window_start = lines.len().saturating_sub(FOOTER_WINDOW);

    let mut cut = None;
    for i in (window_start..lines.len()).rev() {
        let line = lines[i].trim();
        if line.is_empty() {
            continue;
        }
        if FOOTER_PATTERNS.iter().any(|pattern| pattern.is_match(line)) {
            cut = Some(i);
        }
    }

    match cut {
        Some(i) => {
            let footer = lines[i..].join("\n").trim().to_string();
            let body = lines[..i].join("\n");
            (body, (!footer.is_empty()).then_some(footer))
        }
        None => (text.to_string(), None),
    }
}

fn detect_offers(text: &str) -> Vec<String> {
    let mut detected = Vec::new();
    for (tag, patterns) in OFFER_PATTERNS.iter() {
        if patterns.iter().any(|pattern| pattern.is_match(text)) {
            detected.push(tag.to_string());
        }
    }
    detected
}

fn dedupe_preserving_order(values: Vec<String>, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html_message(html: &str) -> Message {
        Message {
            message_id: "m1".to_string(),
            thread_id: "t1".to_string(),
            body_html: Some(html.to_string()),
            ..Message::default()
        }
    }

    fn text_message(text: &str) -> Message {
        Message {
            message_id: "m1".to_string(),
            thread_id: "t1".to_string(),
            body_text: Some(text.to_string()),
            ..Message::default()
        }
    }

    #[test]
    fn html_bodies_yield_links_ctas_and_headline() {
        let html = r##"<html><body>
            <h1>Spring launch</h1>
            <p>We just launched the new plan tier.</p>
            <a class="button" href="https://acme.com/pricing?utm_campaign=spring&utm_source=mail">See pricing</a>
            <a href="https://twitter.com/acme">@acme</a>
            <img src="https://t.acme.com/o.gif" width="1" height="1">
            <img src="https://acme.com/hero.png" width="600">
        </body></html>"##;
        let content = parse_message(&html_message(html));

        assert_eq!(content.primary_headline.as_deref(), Some("Spring launch"));
        assert_eq!(content.cta_texts, vec!["See pricing".to_string()]);
        assert_eq!(content.link_count, 2);
        assert_eq!(content.tracking_pixel_count, 1);
        assert_eq!(content.image_count, 2);
        assert!(content.unique_link_domains.contains(&"acme.com".to_string()));
        assert_eq!(content.utm_campaigns.len(), 1);
        assert_eq!(content.utm_campaigns[0]["utm_campaign"], "spring");
        assert_eq!(
            content.link_intents["pricing_page"],
            vec!["https://acme.com/pricing?utm_campaign=spring&utm_source=mail".to_string()]
        );
        assert_eq!(
            content.social_links["twitter"],
            "https://twitter.com/acme".to_string()
        );
        assert!(content.offer_types.contains(&"product_launch".to_string()));
    }

    #[test]
    fn link_intent_first_match_wins_and_unmatched_links_drop() {
        // "partner" appears before the marketplace needle would match.
        let html = r#"<a href="https://acme.com/partner/apps">join</a>
                      <a href="https://acme.com/blog/post">read</a>"#;
        let content = parse_message(&html_message(html));
        assert!(content.link_intents.contains_key("partner_program"));
        assert!(!content.link_intents.contains_key("marketplace_listing"));
        assert_eq!(content.link_intents.len(), 1);
    }

    #[test]
    fn quotes_and_signature_are_stripped() {
        let text = "Happy to help with the rollout.\n\
                    > earlier quoted line\n\
                    On Mon, Jun 2, 2025 at 9:00 AM Alice wrote:\n\
                    old content";
        let content = parse_message(&text_message(text));
        assert_eq!(content.body_clean, "Happy to help with the rollout.");

        let signed = "Quick update below.\n--\nJane Doe\nVP Marketing\n555-0100";
        let content = parse_message(&text_message(signed));
        assert_eq!(content.body_clean, "Quick update below.");
        let signature = content.signature_block.expect("signature");
        assert!(signature.contains("VP Marketing"));
    }

    #[test]
    fn marketing_footer_moves_to_footer_segment() {
        let text = "Big news about our spring release.\n\
                    More details inside.\n\
                    \n\
                    Unsubscribe from these emails\n\
                    © 2025 Acme Inc. All rights reserved.";
        let content = parse_message(&text_message(text));
        assert_eq!(
            content.body_clean,
            "Big news about our spring release.\nMore details inside."
        );
        let footer = content.footer_block.expect("footer");
        assert!(footer.contains("Unsubscribe"));
        assert!(footer.contains("All rights reserved"));
    }

    #[test]
    fn footer_scan_is_bounded_to_the_tail_window() {
        let mut lines = vec!["Unsubscribe mention early in a long body.".to_string()];
        for i in 0..30 {
            lines.push(format!("Body line {i}."));
        }
        let content = parse_message(&text_message(&lines.join("\n")));
        assert!(content.footer_block.is_none());
        assert!(content.body_clean.contains("Unsubscribe mention early"));
    }

    #[test]
    fn personalization_tokens_raise_flag_and_complexity() {
        let html = "<p>Hi *|FNAME|*,</p><p>{{ company }} update</p>";
        let content = parse_message(&html_message(html));
        assert!(content.has_personalization);
        assert!(content
            .personalization_tokens
            .iter()
            .any(|t| t.contains("FNAME")));
    }

    #[test]
    fn template_complexity_is_clamped() {
        let mut html = String::from("<html><body>");
        for i in 0..40 {
            html.push_str(&format!(
                "<table style=\"border:0\"><tr><td><a href=\"https://x.com/{i}\">l</a>\
                 <img src=\"i{i}.png\"></td></tr></table>"
            ));
        }
        html.push_str("<p>Hi *|FNAME|*</p><style>@media screen {}</style></body></html>");
        let content = parse_message(&html_message(&html));
        assert_eq!(content.template_complexity_score, 100);
    }

    #[test]
    fn offer_detection_covers_renewal_and_partnership() {
        let content = parse_message(&text_message(
            "Your annual renewal is coming up. Join our partner program to earn commission.",
        ));
        assert!(content.offer_types.contains(&"renewal".to_string()));
        assert!(content.offer_types.contains(&"partnership".to_string()));
    }

    #[test]
    fn physical_address_is_captured() {
        let content = parse_message(&text_message(
            "Visit us.\n123 Market Street, San Francisco, CA 94105",
        ));
        assert!(content.has_physical_address);
        assert!(content
            .physical_address_text
            .expect("address")
            .starts_with("123 Market Street"));
    }

    #[test]
    fn stage_is_idempotent_over_the_store() {
        let store = Store::in_memory().expect("store");
        store
            .upsert_message(&text_message("Plain body"))
            .expect("seed");
        let cancel = CancelToken::new();
        assert_eq!(run(&store, &cancel).expect("first").processed, 1);
        assert_eq!(run(&store, &cancel).expect("second").processed, 0);
    }
}
