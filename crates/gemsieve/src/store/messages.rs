//! Ingestion-side repositories: messages, attachments, threads, sync state.

use rusqlite::{OptionalExtension, Row, params};

use crate::models::{Attachment, AwaitingResponse, Message, SyncState, Thread};
use crate::store::{Store, StoreError, from_json_or_default, now_rfc3339, parse_enum, to_json};

impl Store {
    pub fn upsert_message(&self, message: &Message) -> Result<(), StoreError> {
        // Thread row must exist first to satisfy the foreign key; the real
        // aggregate values are recomputed after the batch.
        self.conn().execute(
            "INSERT OR IGNORE INTO threads (thread_id) VALUES (?1)",
            params![message.thread_id],
        )?;
        self.conn().execute(
            "INSERT INTO messages (
                 message_id, thread_id, date, from_address, from_name, reply_to,
                 to_addresses, cc_addresses, subject, headers_raw, body_html,
                 body_text, labels, snippet, size_estimate, is_sent
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(message_id) DO UPDATE SET
                 thread_id = excluded.thread_id,
                 date = excluded.date,
                 from_address = excluded.from_address,
                 from_name = excluded.from_name,
                 reply_to = excluded.reply_to,
                 to_addresses = excluded.to_addresses,
                 cc_addresses = excluded.cc_addresses,
                 subject = excluded.subject,
                 headers_raw = excluded.headers_raw,
                 body_html = excluded.body_html,
                 body_text = excluded.body_text,
                 labels = excluded.labels,
                 snippet = excluded.snippet,
                 size_estimate = excluded.size_estimate,
                 is_sent = excluded.is_sent",
            params![
                message.message_id,
                message.thread_id,
                message.date,
                message.from_address,
                message.from_name,
                message.reply_to,
                to_json(&message.to_addresses)?,
                to_json(&message.cc_addresses)?,
                message.subject,
                to_json(&message.headers_raw)?,
                message.body_html,
                message.body_text,
                to_json(&message.labels)?,
                message.snippet,
                message.size_estimate,
                message.is_sent,
            ],
        )?;
        Ok(())
    }

    pub fn message_exists(&self, message_id: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM messages WHERE message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        self.conn()
            .query_row(
                &format!("{MESSAGE_SELECT} WHERE message_id = ?1"),
                params![message_id],
                map_message,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Attachment metadata only; bodies never land in the store.
    pub fn insert_attachment(&self, attachment: &Attachment) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO attachments (message_id, filename, mime_type, size_bytes)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                attachment.message_id,
                attachment.filename,
                attachment.mime_type,
                attachment.size_bytes,
            ],
        )?;
        Ok(())
    }

    pub fn delete_attachments_for(&self, message_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM attachments WHERE message_id = ?1",
            params![message_id],
        )?;
        Ok(())
    }

    pub fn list_thread_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT DISTINCT thread_id FROM messages")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Messages of a thread in chronological order.
    pub fn messages_in_thread(&self, thread_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{MESSAGE_SELECT} WHERE thread_id = ?1 ORDER BY date"))?;
        let rows = stmt.query_map(params![thread_id], map_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn upsert_thread(&self, thread: &Thread) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO threads (
                 thread_id, subject, participant_count, message_count,
                 first_message_date, last_message_date, last_sender,
                 user_participated, user_last_replied, awaiting_response_from,
                 days_dormant
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(thread_id) DO UPDATE SET
                 subject = excluded.subject,
                 participant_count = excluded.participant_count,
                 message_count = excluded.message_count,
                 first_message_date = excluded.first_message_date,
                 last_message_date = excluded.last_message_date,
                 last_sender = excluded.last_sender,
                 user_participated = excluded.user_participated,
                 user_last_replied = excluded.user_last_replied,
                 awaiting_response_from = excluded.awaiting_response_from,
                 days_dormant = excluded.days_dormant",
            params![
                thread.thread_id,
                thread.subject,
                thread.participant_count,
                thread.message_count,
                thread.first_message_date,
                thread.last_message_date,
                thread.last_sender,
                thread.user_participated,
                thread.user_last_replied,
                thread.awaiting_response_from.map(|a| a.to_string()),
                thread.days_dormant,
            ],
        )?;
        Ok(())
    }

    pub fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
        self.conn()
            .query_row(
                "SELECT thread_id, subject, participant_count, message_count,
                        first_message_date, last_message_date, last_sender,
                        user_participated, user_last_replied,
                        awaiting_response_from, days_dormant
                 FROM threads WHERE thread_id = ?1",
                params![thread_id],
                map_thread,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn sync_state(&self) -> Result<SyncState, StoreError> {
        let state = self
            .conn()
            .query_row(
                "SELECT last_history_id, last_full_sync, last_incremental_sync,
                        total_messages_synced
                 FROM sync_state WHERE id = 1",
                [],
                |row| {
                    Ok(SyncState {
                        last_history_id: row.get(0)?,
                        last_full_sync: row.get(1)?,
                        last_incremental_sync: row.get(2)?,
                        total_messages_synced: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    pub fn record_full_sync(&self, history_id: &str, stored: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO sync_state (id, last_history_id, last_full_sync, total_messages_synced)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 last_history_id = excluded.last_history_id,
                 last_full_sync = excluded.last_full_sync,
                 total_messages_synced = sync_state.total_messages_synced + ?3",
            params![history_id, now_rfc3339(), stored],
        )?;
        Ok(())
    }

    pub fn record_incremental_sync(&self, history_id: &str, stored: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO sync_state (id, last_history_id, last_incremental_sync, total_messages_synced)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 last_history_id = excluded.last_history_id,
                 last_incremental_sync = excluded.last_incremental_sync,
                 total_messages_synced = sync_state.total_messages_synced + ?3",
            params![history_id, now_rfc3339(), stored],
        )?;
        Ok(())
    }
}

const MESSAGE_SELECT: &str = "SELECT message_id, thread_id, date, from_address, from_name, \
     reply_to, to_addresses, cc_addresses, subject, headers_raw, body_html, \
     body_text, labels, snippet, size_estimate, is_sent FROM messages";

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        message_id: row.get(0)?,
        thread_id: row.get(1)?,
        date: row.get(2)?,
        from_address: row.get(3)?,
        from_name: row.get(4)?,
        reply_to: row.get(5)?,
        to_addresses: from_json_or_default(row.get(6)?),
        cc_addresses: from_json_or_default(row.get(7)?),
        subject: row.get(8)?,
        headers_raw: from_json_or_default(row.get(9)?),
        body_html: row.get(10)?,
        body_text: row.get(11)?,
        labels: from_json_or_default(row.get(12)?),
        snippet: row.get(13)?,
        size_estimate: row.get(14)?,
        is_sent: row.get(15)?,
    })
}

fn map_thread(row: &Row<'_>) -> rusqlite::Result<Thread> {
    let awaiting: Option<String> = row.get(9)?;
    let awaiting = match awaiting {
        Some(value) => Some(
            parse_enum::<AwaitingResponse>("awaiting_response_from", value)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
        ),
        None => None,
    };
    Ok(Thread {
        thread_id: row.get(0)?,
        subject: row.get(1)?,
        participant_count: row.get(2)?,
        message_count: row.get(3)?,
        first_message_date: row.get(4)?,
        last_message_date: row.get(5)?,
        last_sender: row.get(6)?,
        user_participated: row.get(7)?,
        user_last_replied: row.get(8)?,
        awaiting_response_from: awaiting,
        days_dormant: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_message(id: &str, thread: &str) -> Message {
        Message {
            message_id: id.to_string(),
            thread_id: thread.to_string(),
            date: Some("2025-06-01T10:00:00Z".to_string()),
            from_address: "alice@acme.com".to_string(),
            from_name: "Alice".to_string(),
            to_addresses: vec!["me@example.com".to_string()],
            subject: "Pricing question".to_string(),
            headers_raw: HashMap::from([(
                "precedence".to_string(),
                vec!["bulk".to_string()],
            )]),
            body_text: Some("What's your pricing?".to_string()),
            ..Message::default()
        }
    }

    #[test]
    fn upsert_message_is_idempotent() {
        let store = Store::in_memory().expect("store");
        let msg = sample_message("m1", "t1");
        store.upsert_message(&msg).expect("first upsert");
        store.upsert_message(&msg).expect("second upsert");
        assert_eq!(store.table_stats().expect("stats")["messages"], 1);

        let loaded = store.get_message("m1").expect("get").expect("exists");
        assert_eq!(loaded.from_address, "alice@acme.com");
        assert_eq!(loaded.headers_raw["precedence"], vec!["bulk"]);
    }

    #[test]
    fn thread_round_trip_preserves_awaiting_state() {
        let store = Store::in_memory().expect("store");
        store
            .upsert_message(&sample_message("m1", "t1"))
            .expect("seed message");
        let thread = Thread {
            thread_id: "t1".to_string(),
            subject: "Pricing question".to_string(),
            participant_count: 2,
            message_count: 2,
            user_participated: true,
            awaiting_response_from: Some(AwaitingResponse::User),
            days_dormant: 45,
            ..Thread::default()
        };
        store.upsert_thread(&thread).expect("upsert thread");
        let loaded = store.get_thread("t1").expect("get").expect("exists");
        assert_eq!(loaded.awaiting_response_from, Some(AwaitingResponse::User));
        assert_eq!(loaded.days_dormant, 45);
    }

    #[test]
    fn sync_state_accumulates_totals() {
        let store = Store::in_memory().expect("store");
        assert_eq!(store.sync_state().expect("empty").total_messages_synced, 0);
        store.record_full_sync("h100", 5).expect("full");
        store.record_incremental_sync("h101", 2).expect("incr");
        let state = store.sync_state().expect("state");
        assert_eq!(state.last_history_id.as_deref(), Some("h101"));
        assert_eq!(state.total_messages_synced, 7);
        assert!(state.last_full_sync.is_some());
        assert!(state.last_incremental_sync.is_some());
    }
}
