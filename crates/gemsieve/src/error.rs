//! Application-level error type shared across the binary and services.

use std::path::PathBuf;

use thiserror::Error;

use crate::ai::AiError;
use crate::config::AppConfigError;
use crate::export::ExportError;
use crate::mail::MailError;
use crate::pipeline::PipelineError;
use crate::server::ServerError;
use crate::stages::StageError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Mail(#[from] MailError),
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid relationship type `{0}`")]
    InvalidRelationshipType(String),
    #[error("invalid gem type `{0}`")]
    InvalidGemType(String),
    #[error("invalid strategy `{0}`")]
    InvalidStrategy(String),
    #[error("gem {0} not found")]
    GemNotFound(i64),
    #[error("no previous sync state; run `gemsieve ingest` without --sync first")]
    MissingSyncState,
    #[error("crew mode is not supported in this build")]
    CrewUnsupported,
}
