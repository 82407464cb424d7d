//! Configuration loading and layering.
//!
//! Sources, lowest to highest precedence: built-in defaults, the user config
//! directory (`~/.config/gemsieve/config.yaml`), `./config.yaml`, the file
//! named by `$GEMSIEVE_CONFIG`, then `GEMSIEVE__*` environment variables
//! (double-underscore path separator), then the handful of ad-hoc overrides
//! the CLI has always honoured (`DATABASE_URL`, `ollama_host`,
//! `ollama_api_key`, `model_name`).

use std::{collections::HashMap, env, path::PathBuf};

use config::{Config as RawConfig, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const LOCAL_CONFIG_PATH: &str = "config.yaml";
const CONFIG_OVERRIDE_ENV: &str = "GEMSIEVE_CONFIG";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("unknown AI provider `{0}` (expected ollama, openai, or anthropic)")]
    UnknownProvider(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gmail: GmailConfig,
    pub storage: StorageConfig,
    pub ai: AiConfig,
    pub entity_extraction: EntityConfig,
    pub scoring: ScoringConfig,
    pub engagement: EngagementConfig,
    pub server: ServerConfig,
    pub esp_fingerprints_file: Option<PathBuf>,
    pub known_entities_file: Option<PathBuf>,
    pub custom_segments_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailConfig {
    pub credentials_file: PathBuf,
    pub token_file: PathBuf,
    pub default_query: String,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            credentials_file: PathBuf::from("credentials.json"),
            token_file: PathBuf::from("token.json"),
            default_query: "newer_than:1y".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("gemsieve.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// One of `ollama`, `openai`, `anthropic`.
    pub provider: String,
    pub model: String,
    pub ollama_base_url: String,
    pub ollama_api_key: String,
    pub batch_size: usize,
    pub max_body_chars: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "mistral-nemo".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_api_key: String::new(),
            batch_size: 10,
            max_body_chars: 2000,
        }
    }
}

impl AiConfig {
    /// `provider:model` tag consumed by the provider factory.
    pub fn model_spec(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    pub spacy_model: String,
    pub extract_monetary: bool,
    pub extract_dates: bool,
    pub extract_procurement: bool,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            spacy_model: "en_core_web_sm".to_string(),
            extract_monetary: true,
            extract_dates: true,
            extract_procurement: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub inbound_initiation: f64,
    pub inbound_engagement: f64,
    pub reachability: f64,
    pub relevance: f64,
    pub recency: f64,
    pub known_contacts: f64,
    pub monetary_signals: f64,
    pub gem_diversity_per_type: f64,
    pub gem_diversity_cap: f64,
    pub dormant_thread_bonus: f64,
    pub partner_bonus: f64,
    pub procurement_bonus: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            inbound_initiation: 15.0,
            inbound_engagement: 15.0,
            reachability: 10.0,
            relevance: 8.0,
            recency: 8.0,
            known_contacts: 7.0,
            monetary_signals: 7.0,
            gem_diversity_per_type: 5.0,
            gem_diversity_cap: 15.0,
            dormant_thread_bonus: 10.0,
            partner_bonus: 3.0,
            procurement_bonus: 7.0,
        }
    }
}

/// Per-relationship maximum opportunity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationshipScoreCaps {
    pub inbound_prospect: i64,
    pub warm_contact: i64,
    pub potential_partner: i64,
    pub community: i64,
    pub unknown: i64,
    pub selling_to_me: i64,
    pub my_vendor: i64,
    pub my_service_provider: i64,
    pub my_infrastructure: i64,
    pub institutional: i64,
}

impl Default for RelationshipScoreCaps {
    fn default() -> Self {
        Self {
            inbound_prospect: 100,
            warm_contact: 90,
            potential_partner: 80,
            community: 50,
            unknown: 60,
            selling_to_me: 20,
            my_vendor: 25,
            my_service_provider: 15,
            my_infrastructure: 5,
            institutional: 5,
        }
    }
}

impl RelationshipScoreCaps {
    pub fn cap(&self, relationship: crate::models::RelationshipType) -> i64 {
        use crate::models::RelationshipType::*;
        match relationship {
            InboundProspect => self.inbound_prospect,
            WarmContact => self.warm_contact,
            PotentialPartner => self.potential_partner,
            Community => self.community,
            Unknown => self.unknown,
            SellingToMe => self.selling_to_me,
            MyVendor => self.my_vendor,
            MyServiceProvider => self.my_service_provider,
            MyInfrastructure => self.my_infrastructure,
            Institutional => self.institutional,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DormantThreadConfig {
    pub min_dormancy_days: i64,
    pub max_dormancy_days: i64,
    pub require_human_sender: bool,
}

impl Default for DormantThreadConfig {
    fn default() -> Self {
        Self {
            min_dormancy_days: 14,
            max_dormancy_days: 365,
            require_human_sender: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub target_industries: Vec<String>,
    pub weights: ScoringWeights,
    pub dormant_thread: DormantThreadConfig,
    pub relationship_caps: RelationshipScoreCaps,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            target_industries: vec![
                "SaaS".to_string(),
                "Agency".to_string(),
                "E-commerce".to_string(),
                "Marketing".to_string(),
                "Developer Tools".to_string(),
            ],
            weights: ScoringWeights::default(),
            dormant_thread: DormantThreadConfig::default(),
            relationship_caps: RelationshipScoreCaps::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngagementConfig {
    pub your_name: String,
    pub your_service: String,
    pub your_tone: String,
    pub your_audience: String,
    pub preferred_strategies: Vec<String>,
    pub max_outreach_per_day: i64,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            your_name: String::new(),
            your_service: String::new(),
            your_tone: "direct, technical, peer-to-peer".to_string(),
            your_audience: String::new(),
            preferred_strategies: vec![
                "audit".to_string(),
                "mirror".to_string(),
                "revival".to_string(),
                "partner".to_string(),
            ],
            max_outreach_per_day: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8321,
        }
    }
}

pub fn load() -> Result<Config, AppConfigError> {
    load_from(None)
}

/// Load configuration, optionally forcing an explicit file path (CLI flag).
pub fn load_from(explicit: Option<PathBuf>) -> Result<Config, AppConfigError> {
    let mut builder = RawConfig::builder();

    if let Ok(dirs) = project_dirs() {
        let user_path = dirs.config_dir().join("config.yaml");
        builder = builder.add_source(
            File::from(user_path)
                .format(FileFormat::Yaml)
                .required(false),
        );
    }

    builder = builder.add_source(
        File::new(LOCAL_CONFIG_PATH, FileFormat::Yaml).required(false),
    );

    let override_path = explicit.or_else(config_override_path);
    if let Some(path) = override_path {
        builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("GEMSIEVE").separator("__"));

    let mut cfg: Config = builder.build()?.try_deserialize()?;
    apply_env_overrides(&mut cfg, &env_snapshot());
    validate(&cfg)?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "gemsieve", "gemsieve").ok_or(AppConfigError::MissingProjectDirs)
}

fn config_override_path() -> Option<PathBuf> {
    let raw = env::var_os(CONFIG_OVERRIDE_ENV)?;
    if raw.is_empty() {
        return None;
    }
    Some(PathBuf::from(raw))
}

fn env_snapshot() -> HashMap<String, String> {
    ["DATABASE_URL", "ollama_host", "ollama_api_key", "model_name"]
        .into_iter()
        .filter_map(|name| env::var(name).ok().map(|value| (name.to_string(), value)))
        .collect()
}

/// Ad-hoc single-variable overrides kept for compatibility with the
/// original deployment scripts. Applied after all structured sources.
fn apply_env_overrides(cfg: &mut Config, vars: &HashMap<String, String>) {
    if let Some(url) = vars.get("DATABASE_URL") {
        let trimmed = url.strip_prefix("sqlite://").unwrap_or(url);
        if !trimmed.is_empty() {
            cfg.storage.sqlite_path = PathBuf::from(trimmed);
        }
    }
    if let Some(host) = vars.get("ollama_host") {
        cfg.ai.ollama_base_url = host.clone();
    }
    if let Some(key) = vars.get("ollama_api_key") {
        cfg.ai.ollama_api_key = key.clone();
    }
    if let Some(model) = vars.get("model_name") {
        cfg.ai.model = model.clone();
    }
}

fn validate(cfg: &Config) -> Result<(), AppConfigError> {
    match cfg.ai.provider.as_str() {
        "ollama" | "openai" | "anthropic" => Ok(()),
        other => Err(AppConfigError::UnknownProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_spec_values() {
        let cfg = Config::default();
        assert_eq!(cfg.ai.provider, "ollama");
        assert_eq!(cfg.ai.max_body_chars, 2000);
        assert_eq!(cfg.scoring.dormant_thread.min_dormancy_days, 14);
        assert_eq!(cfg.scoring.relationship_caps.inbound_prospect, 100);
        assert_eq!(cfg.scoring.relationship_caps.institutional, 5);
        assert_eq!(cfg.engagement.max_outreach_per_day, 20);
    }

    #[test]
    fn yaml_round_trip_is_lossless() {
        let cfg = Config::default();
        let dumped = serde_yaml::to_string(&cfg).expect("dump");
        let reloaded: Config = serde_yaml::from_str(&dumped).expect("reload");
        assert_eq!(cfg, reloaded);
    }

    #[test]
    fn env_overrides_rewrite_ai_and_storage_fields() {
        let mut cfg = Config::default();
        let vars = HashMap::from([
            ("DATABASE_URL".to_string(), "sqlite:///tmp/alt.db".to_string()),
            ("ollama_host".to_string(), "http://gpu-box:11434".to_string()),
            ("model_name".to_string(), "llama3".to_string()),
        ]);
        apply_env_overrides(&mut cfg, &vars);
        assert_eq!(cfg.storage.sqlite_path, PathBuf::from("/tmp/alt.db"));
        assert_eq!(cfg.ai.ollama_base_url, "http://gpu-box:11434");
        assert_eq!(cfg.ai.model, "llama3");
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let mut cfg = Config::default();
        cfg.ai.provider = "bard".to_string();
        assert!(matches!(
            validate(&cfg),
            Err(AppConfigError::UnknownProvider(_))
        ));
    }
}
