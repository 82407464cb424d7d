//! Cross-cutting application constants.

/// Default model spec used when neither config nor CLI names one.
pub const DEFAULT_MODEL_SPEC: &str = "ollama:mistral-nemo";

/// Stage registry, in dependency order. `run --all-stages` executes every
/// stage except `engage`.
pub const STAGE_ORDER: [&str; 7] = [
    "metadata", "content", "entities", "classify", "profile", "segment", "engage",
];

/// Network call timeout applied to mail, model, and NER transports.
pub const TRANSPORT_TIMEOUT_SECS: u64 = 60;

/// Transport errors are retried with exponential backoff up to this many
/// attempts before the row is skipped.
pub const TRANSPORT_MAX_ATTEMPTS: usize = 3;
