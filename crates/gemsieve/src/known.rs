//! Known-entity lists: infrastructure, institutional, marketing platforms,
//! and user-suppressed domains, loaded once from YAML.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::domains::organizational_root;
use crate::models::RelationshipType;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KnownEntities {
    pub infrastructure: Vec<String>,
    pub institutional: Vec<String>,
    pub marketing_platforms: Vec<String>,
    pub user_suppressed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownCategory {
    Infrastructure,
    Institutional,
    MarketingPlatforms,
    UserSuppressed,
}

impl KnownCategory {
    pub fn relationship(self) -> RelationshipType {
        match self {
            KnownCategory::Infrastructure | KnownCategory::MarketingPlatforms => {
                RelationshipType::MyInfrastructure
            }
            KnownCategory::Institutional => RelationshipType::Institutional,
            KnownCategory::UserSuppressed => RelationshipType::Unknown,
        }
    }

    /// Suppression lists never surface gems.
    pub fn suppresses_gems(self) -> bool {
        matches!(
            self,
            KnownCategory::Infrastructure
                | KnownCategory::Institutional
                | KnownCategory::MarketingPlatforms
                | KnownCategory::UserSuppressed
        )
    }
}

impl KnownEntities {
    /// Missing or unreadable files yield the empty list set; known-entity
    /// matching is best-effort by design.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_yaml::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Category of a domain, matching on the organizational root so
    /// `notification.intuit.com` hits an `intuit.com` entry.
    pub fn category_of(&self, domain: &str) -> Option<KnownCategory> {
        if domain.is_empty() {
            return None;
        }
        let root = organizational_root(domain);
        let lists: [(&Vec<String>, KnownCategory); 4] = [
            (&self.infrastructure, KnownCategory::Infrastructure),
            (&self.institutional, KnownCategory::Institutional),
            (&self.marketing_platforms, KnownCategory::MarketingPlatforms),
            (&self.user_suppressed, KnownCategory::UserSuppressed),
        ];
        for (list, category) in lists {
            if list.iter().any(|entry| entry == &root || entry == domain) {
                return Some(category);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.infrastructure.is_empty()
            && self.institutional.is_empty()
            && self.marketing_platforms.is_empty()
            && self.user_suppressed.is_empty()
    }
}

/// Relationship import file: `relationship_type: [domains]` sections.
pub fn parse_relationship_import(
    raw: &str,
) -> Result<HashMap<String, Vec<String>>, serde_yaml::Error> {
    serde_yaml::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomains_match_root_entries() {
        let known = KnownEntities {
            institutional: vec!["intuit.com".to_string()],
            ..KnownEntities::default()
        };
        assert_eq!(
            known.category_of("notification.intuit.com"),
            Some(KnownCategory::Institutional)
        );
        assert_eq!(known.category_of("intuit.com"), Some(KnownCategory::Institutional));
        assert_eq!(known.category_of("acme.com"), None);
    }

    #[test]
    fn categories_map_to_relationships() {
        assert_eq!(
            KnownCategory::Infrastructure.relationship(),
            RelationshipType::MyInfrastructure
        );
        assert_eq!(
            KnownCategory::MarketingPlatforms.relationship(),
            RelationshipType::MyInfrastructure
        );
        assert_eq!(
            KnownCategory::Institutional.relationship(),
            RelationshipType::Institutional
        );
    }

    #[test]
    fn missing_file_loads_empty_lists() {
        let known = KnownEntities::load(Some(Path::new("/nonexistent/known.yaml")));
        assert!(known.is_empty());
    }

    #[test]
    fn yaml_lists_parse() {
        let yaml = "infrastructure:\n  - aws.amazon.com\ninstitutional:\n  - intuit.com\n";
        let known: KnownEntities = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(known.institutional, vec!["intuit.com"]);
    }
}
