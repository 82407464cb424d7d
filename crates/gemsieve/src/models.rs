//! Domain types shared across stages, store, and the admin surface.
//!
//! Enumerations are closed sum types; the store keeps them as TEXT for
//! forward compatibility and validates at the boundary via `FromStr`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Typed commercial opportunity kinds.
///
/// `VendorUpsell` is retired: historical rows parse, the detector never
/// emits it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GemType {
    DormantWarmThread,
    UnansweredAsk,
    WeakMarketingLead,
    PartnerProgram,
    RenewalLeverage,
    DistributionChannel,
    CoMarketing,
    IndustryIntel,
    ProcurementSignal,
    VendorUpsell,
}

/// The sender's role in the user's commerce graph. Gates which gem types may
/// emit and caps the final score.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    MyVendor,
    MyServiceProvider,
    MyInfrastructure,
    Institutional,
    InboundProspect,
    WarmContact,
    PotentialPartner,
    SellingToMe,
    Community,
    Unknown,
}

impl RelationshipType {
    /// Customer-side types carry suppressed-by-default gem detection.
    pub fn is_customer_side(self) -> bool {
        matches!(
            self,
            RelationshipType::MyVendor
                | RelationshipType::MyServiceProvider
                | RelationshipType::MyInfrastructure
                | RelationshipType::Institutional
        )
    }

    /// Opportunity-side types are eligible for monetary-signal scoring.
    pub fn is_opportunity_side(self) -> bool {
        matches!(
            self,
            RelationshipType::InboundProspect
                | RelationshipType::WarmContact
                | RelationshipType::PotentialPartner
                | RelationshipType::Unknown
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SenderIntent {
    Human1to1,
    ColdOutreach,
    NurtureSequence,
    Newsletter,
    Transactional,
    Promotional,
    EventInvitation,
    PartnershipPitch,
    ReEngagement,
    Procurement,
    Recruiting,
    Community,
}

/// Who owes the next reply in a thread, inferred from the last message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AwaitingResponse {
    User,
    Other,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GemStatus {
    New,
    Acted,
    Dismissed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Draft,
    Approved,
    Sent,
    Replied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OverrideScope {
    Message,
    Sender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Organization,
    Money,
    Date,
    Role,
    Phone,
    Url,
    ProcurementSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntitySource {
    Spacy,
    Regex,
    Header,
}

/// Engagement strategies the generator routes gems into.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Audit,
    Revival,
    Partner,
    RenewalNegotiation,
    IndustryReport,
    Mirror,
    DistributionPitch,
}

impl GemType {
    /// Strategy routing table. The default arm is a safety net; every
    /// emittable gem type has an explicit strategy.
    pub fn strategy(self) -> Strategy {
        match self {
            GemType::WeakMarketingLead => Strategy::Audit,
            GemType::ProcurementSignal => Strategy::Audit,
            GemType::IndustryIntel => Strategy::IndustryReport,
            GemType::DormantWarmThread => Strategy::Revival,
            GemType::UnansweredAsk => Strategy::Revival,
            GemType::PartnerProgram => Strategy::Partner,
            GemType::RenewalLeverage => Strategy::RenewalNegotiation,
            GemType::DistributionChannel => Strategy::DistributionPitch,
            GemType::CoMarketing => Strategy::Mirror,
            GemType::VendorUpsell => Strategy::Mirror,
        }
    }

    /// Relationship eligibility matrix: a detector only fires when the
    /// profile's relationship type is listed here.
    pub fn eligible_relationships(self) -> &'static [RelationshipType] {
        use RelationshipType::*;
        match self {
            GemType::DormantWarmThread => &[InboundProspect, WarmContact, PotentialPartner],
            GemType::UnansweredAsk => &[InboundProspect, WarmContact, PotentialPartner],
            GemType::WeakMarketingLead => &[InboundProspect, WarmContact],
            GemType::PartnerProgram => &[MyVendor, WarmContact, PotentialPartner],
            GemType::RenewalLeverage => &[MyVendor, MyServiceProvider, MyInfrastructure],
            GemType::DistributionChannel => &[WarmContact, PotentialPartner, Community],
            GemType::CoMarketing => &[WarmContact, PotentialPartner],
            GemType::IndustryIntel => &[
                SellingToMe,
                InboundProspect,
                WarmContact,
                PotentialPartner,
                Community,
            ],
            GemType::ProcurementSignal => &[InboundProspect, WarmContact],
            GemType::VendorUpsell => &[],
        }
    }
}

/// Canonical message record as stored. Dates are RFC 3339 UTC strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    pub message_id: String,
    pub thread_id: String,
    pub date: Option<String>,
    pub from_address: String,
    pub from_name: String,
    pub reply_to: Option<String>,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub subject: String,
    pub headers_raw: HashMap<String, Vec<String>>,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub labels: Vec<String>,
    pub snippet: String,
    pub size_estimate: i64,
    pub is_sent: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub subject: String,
    pub participant_count: i64,
    pub message_count: i64,
    pub first_message_date: Option<String>,
    pub last_message_date: Option<String>,
    pub last_sender: Option<String>,
    pub user_participated: bool,
    pub user_last_replied: Option<String>,
    pub awaiting_response_from: Option<AwaitingResponse>,
    pub days_dormant: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub message_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub last_history_id: Option<String>,
    pub last_full_sync: Option<String>,
    pub last_incremental_sync: Option<String>,
    pub total_messages_synced: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedMetadata {
    pub message_id: String,
    /// Organizational root (public-suffix aware), used for all joins.
    pub sender_domain: String,
    /// Raw From host before subdomain collapse.
    pub sender_subdomain: String,
    pub envelope_sender: Option<String>,
    pub esp_identified: Option<String>,
    pub esp_confidence: Option<String>,
    pub dkim_domain: Option<String>,
    pub spf_result: Option<String>,
    pub dmarc_result: Option<String>,
    pub sending_ip: Option<String>,
    pub mail_server: Option<String>,
    pub x_mailer: Option<String>,
    pub precedence: Option<String>,
    pub feedback_id: Option<String>,
    pub list_unsubscribe_url: Option<String>,
    pub list_unsubscribe_email: Option<String>,
    pub is_bulk: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderTemporal {
    pub sender_domain: String,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    pub total_messages: i64,
    pub avg_frequency_days: Option<f64>,
    pub most_common_send_hour: Option<i64>,
    pub most_common_send_day: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedContent {
    pub message_id: String,
    pub body_clean: String,
    pub signature_block: Option<String>,
    pub footer_block: Option<String>,
    pub primary_headline: Option<String>,
    pub cta_texts: Vec<String>,
    pub offer_types: Vec<String>,
    pub has_personalization: bool,
    pub personalization_tokens: Vec<String>,
    pub link_count: i64,
    pub tracking_pixel_count: i64,
    pub unique_link_domains: Vec<String>,
    pub link_intents: HashMap<String, Vec<String>>,
    pub utm_campaigns: Vec<HashMap<String, String>>,
    pub has_physical_address: bool,
    pub physical_address_text: Option<String>,
    pub social_links: HashMap<String, String>,
    pub image_count: i64,
    pub template_complexity_score: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub message_id: String,
    pub entity_type: EntityType,
    pub entity_value: String,
    pub entity_normalized: Option<String>,
    pub context: Option<String>,
    pub confidence: f64,
    pub source: EntitySource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Classification {
    pub message_id: String,
    pub industry: String,
    pub company_size_estimate: String,
    pub marketing_sophistication: i64,
    pub sender_intent: String,
    pub product_type: String,
    pub product_description: String,
    pub pain_points: Vec<String>,
    pub target_audience: String,
    pub partner_program_detected: bool,
    pub renewal_signal_detected: bool,
    pub ai_confidence: f64,
    pub model_used: String,
    pub has_override: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationOverride {
    pub id: i64,
    pub message_id: Option<String>,
    pub sender_domain: Option<String>,
    pub field_name: String,
    pub original_value: Option<String>,
    pub corrected_value: String,
    pub override_scope: OverrideScope,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub role: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonetarySignal {
    pub amount: String,
    pub context: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderProfile {
    pub sender_domain: String,
    pub company_name: String,
    pub primary_email: String,
    pub reply_to_email: Option<String>,
    pub industry: String,
    pub company_size: String,
    pub marketing_sophistication_avg: f64,
    pub marketing_sophistication_trend: String,
    pub esp_used: Option<String>,
    pub product_type: String,
    pub product_description: String,
    pub pain_points: Vec<String>,
    pub target_audience: String,
    pub known_contacts: Vec<Contact>,
    pub total_messages: i64,
    pub first_contact: Option<String>,
    pub last_contact: Option<String>,
    pub avg_frequency_days: Option<f64>,
    pub offer_type_distribution: HashMap<String, i64>,
    pub cta_texts_all: Vec<String>,
    pub social_links: HashMap<String, String>,
    pub physical_address: Option<String>,
    pub utm_campaign_names: Vec<String>,
    pub has_personalization: bool,
    pub has_partner_program: bool,
    pub partner_program_urls: Vec<String>,
    pub renewal_dates: Vec<String>,
    pub monetary_signals: Vec<MonetarySignal>,
    pub authentication_quality: String,
    pub unsubscribe_url: Option<String>,
    pub economic_segments: Vec<String>,
    pub thread_initiation_ratio: Option<f64>,
    pub user_reply_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderRelationship {
    pub sender_domain: String,
    pub relationship_type: RelationshipType,
    pub relationship_note: Option<String>,
    pub suppress_gems: bool,
    pub source: String,
    pub created_at: String,
}

/// One evidence item inside a gem explanation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GemSignal {
    pub signal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<serde_json::Value>,
}

impl GemSignal {
    pub fn evidence(signal: impl Into<String>, evidence: impl Into<String>) -> Self {
        Self {
            signal: signal.into(),
            evidence: Some(evidence.into()),
            value: None,
            threshold: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GemExplanation {
    pub gem_type: GemType,
    pub summary: String,
    pub signals: Vec<GemSignal>,
    pub confidence: f64,
    pub estimated_value: String,
    pub urgency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gem {
    pub id: i64,
    pub gem_type: GemType,
    pub sender_domain: String,
    pub thread_id: Option<String>,
    pub score: i64,
    pub explanation: GemExplanation,
    pub recommended_actions: Vec<String>,
    pub source_message_ids: Vec<String>,
    pub status: GemStatus,
    pub created_at: String,
}

/// Detector output before the row id and timestamp exist.
#[derive(Debug, Clone)]
pub struct NewGem {
    pub gem_type: GemType,
    pub sender_domain: String,
    pub thread_id: Option<String>,
    pub score: i64,
    pub explanation: GemExplanation,
    pub recommended_actions: Vec<String>,
    pub source_message_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderSegment {
    pub sender_domain: String,
    pub segment: String,
    pub sub_segment: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementDraft {
    pub id: i64,
    pub gem_id: i64,
    pub sender_domain: String,
    pub strategy: Strategy,
    pub channel: String,
    pub subject_line: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub status: DraftStatus,
    pub generated_at: String,
    pub sent_at: Option<String>,
    pub response_received: bool,
    pub response_sentiment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: i64,
    pub stage: String,
    pub status: RunStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub items_processed: Option<i64>,
    pub error_message: Option<String>,
    pub config_snapshot: Option<String>,
    pub triggered_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiAuditEntry {
    pub id: i64,
    pub pipeline_run_id: i64,
    pub stage: String,
    pub sender_domain: String,
    pub prompt_template: String,
    pub prompt_rendered: String,
    pub system_prompt: String,
    pub model_used: String,
    pub response_raw: String,
    pub response_parsed: Option<String>,
    pub duration_ms: i64,
    pub created_at: String,
}
