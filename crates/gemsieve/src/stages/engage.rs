//! Engagement draft generation: strategy routing, per-strategy context
//! assembly, and the daily outreach cap.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::ai::prompts::{ENGAGEMENT_SYSTEM, render, strategy_template};
use crate::ai::{CompletionClient, CompletionRequest, extract_json};
use crate::config::EngagementConfig;
use crate::models::{Gem, SenderProfile, Strategy};
use crate::stages::{CancelToken, StageError, StageReport};
use crate::store::{GemFilter, Store};

const STRATEGY_CHANNELS: [(Strategy, &str); 7] = [
    (Strategy::Audit, "email reply or cold email"),
    (Strategy::IndustryReport, "content publication + tag"),
    (Strategy::Revival, "reply to original thread"),
    (Strategy::Partner, "partner program URL or vendor contact"),
    (Strategy::RenewalNegotiation, "email to account manager"),
    (Strategy::Mirror, "email reply with value exchange"),
    (Strategy::DistributionPitch, "pitch email to editor/host"),
];

fn channel_for(strategy: Strategy) -> &'static str {
    STRATEGY_CHANNELS
        .iter()
        .find(|(s, _)| *s == strategy)
        .map(|(_, channel)| *channel)
        .unwrap_or("email")
}

/// What to generate: one explicit gem (bypasses the daily cap and strategy
/// filters) or a strategy sweep.
#[derive(Debug, Clone)]
pub enum EngageSelection {
    Gem(i64),
    Strategy { strategy: Strategy, top_n: Option<usize> },
    All,
}

pub struct EngageOptions {
    pub model: String,
    pub selection: EngageSelection,
}

pub async fn run(
    store: &Store,
    client: &dyn CompletionClient,
    engagement: &EngagementConfig,
    options: &EngageOptions,
    cancel: &CancelToken,
) -> Result<StageReport, StageError> {
    let mut report = StageReport::default();

    let explicit_gem = matches!(options.selection, EngageSelection::Gem(_));
    let gems = select_gems(store, &options.selection, engagement)?;

    for gem in gems {
        cancel.check()?;

        if !explicit_gem {
            let today = store.drafts_generated_today()?;
            if today >= engagement.max_outreach_per_day {
                warn!(today, "daily outreach cap reached; stopping generation");
                break;
            }
        }

        let Some(profile) = store.get_profile(&gem.sender_domain)? else {
            continue;
        };

        let strategy = gem.gem_type.strategy();
        let (template_id, template) = strategy_template(strategy);
        let context = build_strategy_context(strategy, &gem, &profile, engagement);
        let prompt = render(template, &context);

        let request = CompletionRequest {
            system: ENGAGEMENT_SYSTEM.to_string(),
            prompt,
            model: options.model.clone(),
            json_mode: true,
            template: template_id,
            sender_domain: gem.sender_domain.clone(),
        };
        let raw = match client.complete(&request).await {
            Ok(raw) => raw,
            Err(error) => {
                warn!(gem_id = gem.id, %error, "draft generation call failed");
                report.record_item_error(format!("gem {}: {error}", gem.id));
                continue;
            }
        };
        let Some(parsed) = extract_json(&raw) else {
            warn!(gem_id = gem.id, "draft response was not valid JSON");
            report.record_item_error(format!("gem {}: invalid JSON response", gem.id));
            continue;
        };

        let subject_line = string_field(&parsed, &["subject_line", "subject"]);
        let body_text = string_field(&parsed, &["body", "body_text", "message"]);
        store.insert_draft(
            gem.id,
            &gem.sender_domain,
            strategy,
            channel_for(strategy),
            &subject_line,
            &body_text,
        )?;
        report.processed += 1;
    }

    Ok(report)
}

fn string_field(value: &Value, names: &[&str]) -> String {
    names
        .iter()
        .find_map(|name| value.get(name).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

fn select_gems(
    store: &Store,
    selection: &EngageSelection,
    engagement: &EngagementConfig,
) -> Result<Vec<Gem>, StageError> {
    match selection {
        EngageSelection::Gem(id) => Ok(store.get_gem(*id)?.into_iter().collect()),
        EngageSelection::Strategy { strategy, top_n } => {
            let mut gems = store.list_gems(&GemFilter {
                status: Some(crate::models::GemStatus::New),
                ..GemFilter::default()
            })?;
            gems.retain(|gem| gem.gem_type.strategy() == *strategy);
            apply_preferred_filter(&mut gems, engagement);
            if let Some(top_n) = top_n {
                gems.truncate(*top_n);
            }
            Ok(gems)
        }
        EngageSelection::All => {
            let mut gems = store.list_gems(&GemFilter {
                status: Some(crate::models::GemStatus::New),
                ..GemFilter::default()
            })?;
            apply_preferred_filter(&mut gems, engagement);
            Ok(gems)
        }
    }
}

fn apply_preferred_filter(gems: &mut Vec<Gem>, engagement: &EngagementConfig) {
    if engagement.preferred_strategies.is_empty() {
        return;
    }
    gems.retain(|gem| {
        engagement
            .preferred_strategies
            .iter()
            .any(|preferred| preferred == &gem.gem_type.strategy().to_string())
    });
}

/// Context variables for the strategy prompt: a shared base plus
/// strategy-specific additions.
pub fn build_strategy_context(
    strategy: Strategy,
    gem: &Gem,
    profile: &SenderProfile,
    engagement: &EngagementConfig,
) -> HashMap<&'static str, String> {
    let best_contact = profile.known_contacts.first();
    let observation = if !profile.cta_texts_all.is_empty() {
        format!("CTA observed: {}", profile.cta_texts_all[0])
    } else if !profile.offer_type_distribution.is_empty() {
        let mut offers: Vec<&String> = profile.offer_type_distribution.keys().collect();
        offers.sort();
        format!(
            "Top offer types: {}",
            offers
                .into_iter()
                .take(3)
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        )
    } else {
        gem.explanation.summary.clone()
    };

    let mut context: HashMap<&'static str, String> = HashMap::from([
        ("strategy_name", strategy.to_string()),
        ("gem_type", gem.gem_type.to_string()),
        (
            "gem_explanation_json",
            serde_json::to_string_pretty(&gem.explanation).unwrap_or_default(),
        ),
        (
            "company_name",
            if profile.company_name.is_empty() {
                profile.sender_domain.clone()
            } else {
                profile.company_name.clone()
            },
        ),
        (
            "contact_name",
            best_contact.map(|c| c.name.clone()).unwrap_or_default(),
        ),
        (
            "contact_role",
            best_contact.map(|c| c.role.clone()).unwrap_or_default(),
        ),
        (
            "industry",
            or_unknown(&profile.industry),
        ),
        ("company_size", or_unknown(&profile.company_size)),
        (
            "esp_used",
            profile
                .esp_used
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
        ),
        (
            "sophistication",
            format!("{:.1}", profile.marketing_sophistication_avg),
        ),
        ("product_description", or_unknown(&profile.product_description)),
        (
            "pain_points",
            serde_json::to_string(&profile.pain_points).unwrap_or_default(),
        ),
        ("observation", observation),
        (
            "relationship_summary",
            format!("{} messages over time", profile.total_messages),
        ),
        (
            "user_service_description",
            if engagement.your_service.is_empty() {
                "consulting services".to_string()
            } else {
                engagement.your_service.clone()
            },
        ),
        ("user_preferred_tone", engagement.your_tone.clone()),
        ("user_audience", engagement.your_audience.clone()),
    ]);

    match strategy {
        Strategy::Revival => {
            context.insert("thread_subject", revival_thread_subject(gem));
            context.insert("dormancy_days", revival_dormancy_days(gem));
        }
        Strategy::RenewalNegotiation => {
            context.insert(
                "renewal_dates",
                serde_json::to_string(&profile.renewal_dates).unwrap_or_default(),
            );
            context.insert(
                "monetary_signals",
                serde_json::to_string(&profile.monetary_signals).unwrap_or_default(),
            );
        }
        Strategy::Partner => {
            context.insert(
                "partner_urls",
                serde_json::to_string(&profile.partner_program_urls).unwrap_or_default(),
            );
        }
        Strategy::DistributionPitch => {
            context.insert("target_audience", profile.target_audience.clone());
        }
        _ => {}
    }

    context
}

fn or_unknown(value: &str) -> String {
    if value.is_empty() {
        "Unknown".to_string()
    } else {
        value.to_string()
    }
}

fn revival_thread_subject(gem: &Gem) -> String {
    // The dormant-thread summary quotes the subject.
    gem.explanation
        .summary
        .split('\'')
        .nth(1)
        .unwrap_or_default()
        .to_string()
}

fn revival_dormancy_days(gem: &Gem) -> String {
    gem.explanation
        .summary
        .split("dormant for ")
        .nth(1)
        .and_then(|rest| rest.split(' ').next())
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::AiError;
    use crate::models::{GemExplanation, GemSignal, GemType, NewGem, RelationshipType};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CountingClient {
        calls: Mutex<usize>,
        response: String,
    }

    impl CountingClient {
        fn new(response: &str) -> Self {
            Self {
                calls: Mutex::new(0),
                response: response.to_string(),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().expect("calls")
        }
    }

    #[async_trait]
    impl CompletionClient for CountingClient {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, AiError> {
            *self.calls.lock().expect("calls") += 1;
            Ok(self.response.clone())
        }
    }

    const DRAFT_RESPONSE: &str =
        r#"{"subject_line": "Quick thought on your funnel", "body": "Hey - noticed something."}"#;

    fn seed_gems(store: &Store, n: usize, gem_type: GemType) -> Vec<i64> {
        let profile = SenderProfile {
            sender_domain: "acme.com".to_string(),
            company_name: "Acme".to_string(),
            ..SenderProfile::default()
        };
        store.upsert_profile(&profile).expect("profile");
        store
            .set_relationship("acme.com", RelationshipType::WarmContact, None, false, "manual")
            .expect("relationship");
        (0..n)
            .map(|i| {
                store
                    .insert_gem(&NewGem {
                        gem_type,
                        sender_domain: "acme.com".to_string(),
                        thread_id: None,
                        score: 50 + i as i64,
                        explanation: GemExplanation {
                            gem_type,
                            summary: "Thread 'Team rollout' has been dormant for 45 days. You owe a reply.".to_string(),
                            signals: vec![GemSignal::evidence("warm_pricing", "pricing")],
                            confidence: 0.8,
                            estimated_value: "high".to_string(),
                            urgency: "high".to_string(),
                        },
                        recommended_actions: Vec::new(),
                        source_message_ids: Vec::new(),
                    })
                    .expect("gem")
            })
            .collect()
    }

    fn engagement() -> EngagementConfig {
        EngagementConfig {
            your_service: "email marketing consulting".to_string(),
            your_audience: "b2b saas founders".to_string(),
            preferred_strategies: Vec::new(),
            ..EngagementConfig::default()
        }
    }

    #[tokio::test]
    async fn daily_cap_bounds_strategy_sweeps() {
        let store = Store::in_memory().expect("store");
        seed_gems(&store, 10, GemType::WeakMarketingLead);
        let client = CountingClient::new(DRAFT_RESPONSE);
        let mut config = engagement();
        config.max_outreach_per_day = 3;

        let options = EngageOptions {
            model: "mistral-nemo".to_string(),
            selection: EngageSelection::Strategy {
                strategy: Strategy::Audit,
                top_n: Some(10),
            },
        };
        let report = run(&store, &client, &config, &options, &CancelToken::new())
            .await
            .expect("run");
        assert_eq!(report.processed, 3);
        assert_eq!(store.drafts_generated_today().expect("count"), 3);
    }

    #[tokio::test]
    async fn explicit_gem_bypasses_cap_and_filters() {
        let store = Store::in_memory().expect("store");
        let ids = seed_gems(&store, 1, GemType::DormantWarmThread);
        let client = CountingClient::new(DRAFT_RESPONSE);
        let mut config = engagement();
        config.max_outreach_per_day = 0;
        config.preferred_strategies = vec!["audit".to_string()];

        let options = EngageOptions {
            model: "mistral-nemo".to_string(),
            selection: EngageSelection::Gem(ids[0]),
        };
        let report = run(&store, &client, &config, &options, &CancelToken::new())
            .await
            .expect("run");
        assert_eq!(report.processed, 1);

        let drafts = store.list_drafts().expect("drafts");
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].strategy, Strategy::Revival);
        assert_eq!(drafts[0].subject_line, "Quick thought on your funnel");
        assert_eq!(drafts[0].channel, "reply to original thread");
    }

    #[tokio::test]
    async fn preferred_strategies_filter_sweeps() {
        let store = Store::in_memory().expect("store");
        seed_gems(&store, 2, GemType::WeakMarketingLead);
        let client = CountingClient::new(DRAFT_RESPONSE);
        let mut config = engagement();
        config.preferred_strategies = vec!["revival".to_string()];

        let options = EngageOptions {
            model: "mistral-nemo".to_string(),
            selection: EngageSelection::All,
        };
        let report = run(&store, &client, &config, &options, &CancelToken::new())
            .await
            .expect("run");
        // Audit-strategy gems are filtered out by the revival-only preference.
        assert_eq!(report.processed, 0);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_json_records_error_and_continues() {
        let store = Store::in_memory().expect("store");
        seed_gems(&store, 2, GemType::WeakMarketingLead);
        let client = CountingClient::new("sorry, no JSON today");
        let options = EngageOptions {
            model: "mistral-nemo".to_string(),
            selection: EngageSelection::All,
        };
        let report = run(&store, &client, &engagement(), &options, &CancelToken::new())
            .await
            .expect("run");
        assert_eq!(report.processed, 0);
        assert_eq!(report.item_errors, 2);
        assert!(store.list_drafts().expect("drafts").is_empty());
    }

    #[test]
    fn revival_context_recovers_thread_details() {
        let store = Store::in_memory().expect("store");
        let ids = seed_gems(&store, 1, GemType::DormantWarmThread);
        let gem = store.get_gem(ids[0]).expect("get").expect("exists");
        let profile = store.get_profile("acme.com").expect("get").expect("exists");

        let context = build_strategy_context(Strategy::Revival, &gem, &profile, &engagement());
        assert_eq!(context["thread_subject"], "Team rollout");
        assert_eq!(context["dormancy_days"], "45");
        assert_eq!(context["company_name"], "Acme");
        assert!(context["gem_explanation_json"].contains("warm_pricing"));
    }

    #[test]
    fn renewal_context_includes_dates_and_money() {
        let store = Store::in_memory().expect("store");
        let ids = seed_gems(&store, 1, GemType::RenewalLeverage);
        let gem = store.get_gem(ids[0]).expect("get").expect("exists");
        let mut profile = store.get_profile("acme.com").expect("get").expect("exists");
        profile.renewal_dates = vec!["June 15, 2026".to_string()];
        profile.monetary_signals = vec![crate::models::MonetarySignal {
            amount: "$1,200".to_string(),
            context: "USD amount".to_string(),
        }];

        let context =
            build_strategy_context(Strategy::RenewalNegotiation, &gem, &profile, &engagement());
        assert!(context["renewal_dates"].contains("June 15, 2026"));
        assert!(context["monetary_signals"].contains("$1,200"));
    }
}
