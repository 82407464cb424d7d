//! Named-entity tagger contract.
//!
//! The backing model (a spaCy sidecar in the reference deployment) lives
//! outside this crate; the entity stage consumes any implementation and
//! degrades to regex-only extraction when no tagger is configured.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NerError {
    #[error("ner backend request failed: {0}")]
    Transport(String),
    #[error("ner backend returned malformed spans: {0}")]
    Malformed(String),
}

/// A labeled span over the input text. Offsets are byte positions into the
/// exact string passed to `tag`.
#[derive(Debug, Clone)]
pub struct TaggedSpan {
    pub start: usize,
    pub end: usize,
    pub label: String,
    pub confidence: f64,
}

#[async_trait]
pub trait NerTagger: Send + Sync {
    async fn tag(&self, text: &str) -> Result<Vec<TaggedSpan>, NerError>;
}
