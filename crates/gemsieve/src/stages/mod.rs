//! The analytic stages.
//!
//! Stages never call each other; the store is the integration bus. Each
//! stage reads upstream rows, left-anti-joins its own output table to find
//! unprocessed work, and upserts results, so every stage is idempotent and
//! independently re-runnable.

pub mod classify;
pub mod content;
pub mod engage;
pub mod entities;
pub mod metadata;
pub mod profile;
pub mod relationships;
pub mod segment;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::ai::AiError;
use crate::mail::SyncError;
use crate::ner::NerError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error(transparent)]
    Ner(#[from] NerError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag, checked at the top of per-item loops and
/// between network calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), StageError> {
        if self.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Outcome of one stage invocation. Item-level failures don't abort the
/// stage; they are aggregated here and surfaced on the run record.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub processed: usize,
    pub item_errors: usize,
    pub last_error: Option<String>,
}

impl StageReport {
    pub fn record_item_error(&mut self, error: impl std::fmt::Display) {
        self.item_errors += 1;
        self.last_error = Some(error.to_string());
    }

    /// Aggregated error text for the run record, or None when clean.
    pub fn error_summary(&self) -> Option<String> {
        if self.item_errors == 0 {
            return None;
        }
        let last = self.last_error.as_deref().unwrap_or("unknown");
        Some(format!("{} item(s) failed; last: {last}", self.item_errors))
    }
}
