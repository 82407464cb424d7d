//! Mail-provider contract and the ingestion/sync engine.
//!
//! The provider adapter owns OAuth and wire formats; the crate only sees
//! canonical message records and a resumable history cursor.

pub mod snapshot;
mod sync;
pub mod thread_state;

use async_trait::async_trait;
use thiserror::Error;

pub use sync::{SyncEngine, SyncError, SyncOutcome, message_body};

use crate::models::{Attachment, Message};

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail provider request failed: {0}")]
    Transport(String),
    #[error("mail provider authentication failed: {0}")]
    Auth(String),
    #[error("message {0} not found")]
    MessageNotFound(String),
}

/// A message id surfaced by a query before the full record is fetched.
#[derive(Debug, Clone)]
pub struct MessageStub {
    pub id: String,
}

/// Full message record plus attachment metadata (bodies never cross).
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub message: Message,
    pub attachments: Vec<Attachment>,
}

/// Changes since a history cursor. `expired` means the provider no longer
/// holds history that far back and a full scan is required.
#[derive(Debug, Clone)]
pub struct HistoryDelta {
    pub added_message_ids: Vec<String>,
    pub new_cursor: String,
    pub expired: bool,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Query-based paged enumeration.
    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<(Vec<MessageStub>, Option<String>), MailError>;

    async fn fetch_message(&self, id: &str) -> Result<FetchedMessage, MailError>;

    async fn history_delta(&self, cursor: &str) -> Result<HistoryDelta, MailError>;

    async fn current_history_cursor(&self) -> Result<String, MailError>;
}
