//! Mailbox snapshot adapter: a `MailProvider` over a local JSONL export.
//!
//! The production Gmail adapter (OAuth, wire formats) lives in a companion
//! deployment; this adapter serves local runs and tests from a file of
//! canonical message records, one JSON object per line:
//! `{"message": {...}, "attachments": [...]}`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::mail::{FetchedMessage, HistoryDelta, MailError, MailProvider, MessageStub};
use crate::models::{Attachment, Message};

#[derive(Debug, Deserialize)]
struct SnapshotRecord {
    message: Message,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

pub struct SnapshotMailProvider {
    records: Vec<FetchedMessage>,
}

impl SnapshotMailProvider {
    pub fn open(path: &Path) -> Result<Self, MailError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MailError::Transport(format!("failed to read snapshot {}: {e}", path.display()))
        })?;
        let mut records = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: SnapshotRecord = serde_json::from_str(line).map_err(|e| {
                MailError::Transport(format!(
                    "snapshot {} line {}: {e}",
                    path.display(),
                    line_no + 1
                ))
            })?;
            records.push(FetchedMessage {
                message: record.message,
                attachments: record.attachments,
            });
        }
        Ok(Self { records })
    }

    /// Snapshot path from the environment, when configured.
    pub fn configured_path() -> Option<PathBuf> {
        std::env::var_os("GEMSIEVE_MAILBOX_SNAPSHOT").map(PathBuf::from)
    }
}

#[async_trait]
impl MailProvider for SnapshotMailProvider {
    async fn list_messages(
        &self,
        query: &str,
        _page_token: Option<&str>,
    ) -> Result<(Vec<MessageStub>, Option<String>), MailError> {
        // Snapshots are pre-filtered exports; the query is advisory.
        let _ = query;
        Ok((
            self.records
                .iter()
                .map(|r| MessageStub {
                    id: r.message.message_id.clone(),
                })
                .collect(),
            None,
        ))
    }

    async fn fetch_message(&self, id: &str) -> Result<FetchedMessage, MailError> {
        self.records
            .iter()
            .find(|r| r.message.message_id == id)
            .cloned()
            .ok_or_else(|| MailError::MessageNotFound(id.to_string()))
    }

    /// The cursor is the record count at the time it was issued; anything
    /// beyond it is new.
    async fn history_delta(&self, cursor: &str) -> Result<HistoryDelta, MailError> {
        let Ok(offset) = cursor.parse::<usize>() else {
            return Ok(HistoryDelta {
                added_message_ids: Vec::new(),
                new_cursor: self.records.len().to_string(),
                expired: true,
            });
        };
        if offset > self.records.len() {
            return Ok(HistoryDelta {
                added_message_ids: Vec::new(),
                new_cursor: self.records.len().to_string(),
                expired: true,
            });
        }
        Ok(HistoryDelta {
            added_message_ids: self.records[offset..]
                .iter()
                .map(|r| r.message.message_id.clone())
                .collect(),
            new_cursor: self.records.len().to_string(),
            expired: false,
        })
    }

    async fn current_history_cursor(&self) -> Result<String, MailError> {
        Ok(self.records.len().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_snapshot(dir: &tempfile::TempDir, lines: &[&str]) -> PathBuf {
        let path = dir.path().join("mailbox.jsonl");
        std::fs::write(&path, lines.join("\n")).expect("write snapshot");
        path
    }

    #[tokio::test]
    async fn reads_canonical_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_snapshot(
            &dir,
            &[r#"{"message": {"message_id": "m1", "thread_id": "t1", "from_address": "a@b.com", "from_name": "A", "to_addresses": [], "cc_addresses": [], "subject": "Hi", "headers_raw": {}, "labels": [], "snippet": "", "size_estimate": 0, "is_sent": false}, "attachments": []}"#],
        );
        let provider = SnapshotMailProvider::open(&path).expect("open");
        let (stubs, next) = provider.list_messages("q", None).await.expect("list");
        assert_eq!(stubs.len(), 1);
        assert!(next.is_none());
        let fetched = provider.fetch_message("m1").await.expect("fetch");
        assert_eq!(fetched.message.subject, "Hi");
        assert_eq!(provider.current_history_cursor().await.expect("cursor"), "1");
    }

    #[tokio::test]
    async fn malformed_cursor_reads_as_expired() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_snapshot(&dir, &[]);
        let provider = SnapshotMailProvider::open(&path).expect("open");
        let delta = provider.history_delta("not-a-number").await.expect("delta");
        assert!(delta.expired);
    }

    #[test]
    fn malformed_lines_fail_loudly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_snapshot(&dir, &["{not json"]);
        assert!(SnapshotMailProvider::open(&path).is_err());
    }
}
