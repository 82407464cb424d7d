//! SQLite store: connection lifecycle, schema, and table repositories.
//!
//! One `Store` wraps one connection. Stage jobs each open their own store;
//! WAL mode plus a bounded busy timeout covers the single-writer /
//! many-reader contract. All writes are upserts keyed on the natural id so
//! re-running a stage is idempotent.

mod analysis;
mod messages;
mod profiles;
mod runs;

pub use analysis::ClassifyInput;
pub use profiles::GemFilter;
pub use runs::NewAuditEntry;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

const SCHEMA: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove database file {path}: {source}")]
    RemoveFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected `{column}` value `{value}`")]
    InvalidEnum { column: &'static str, value: String },
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Delete the database file and return a fresh store.
    pub fn reset(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path).map_err(|source| StoreError::RemoveFile {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Self::open(path)
    }

    /// Additive schema migrations: add columns and late tables that predate
    /// the current baseline. Returns a description of each action taken.
    pub fn migrate(&self) -> Result<Vec<String>, StoreError> {
        let expected: [(&str, &str, &str); 7] = [
            ("parsed_metadata", "x_mailer", "TEXT"),
            ("parsed_metadata", "mail_server", "TEXT"),
            ("parsed_metadata", "precedence", "TEXT"),
            ("parsed_metadata", "feedback_id", "TEXT"),
            ("parsed_metadata", "sender_subdomain", "TEXT NOT NULL DEFAULT ''"),
            ("sender_profiles", "thread_initiation_ratio", "REAL"),
            ("sender_profiles", "user_reply_rate", "REAL"),
        ];

        let mut applied = Vec::new();
        for (table, column, ty) in expected {
            if !self.table_exists(table)? {
                continue;
            }
            if !self.column_exists(table, column)? {
                self.conn
                    .execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {ty}"))?;
                applied.push(format!("added {table}.{column}"));
            }
        }

        // Tables introduced after early deployments; CREATE IF NOT EXISTS in
        // the baseline covers fresh databases, this covers pre-baseline ones.
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS domain_exclusions (
                 domain TEXT PRIMARY KEY,
                 reason TEXT,
                 created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
             );
             CREATE TABLE IF NOT EXISTS sender_relationships (
                 sender_domain TEXT PRIMARY KEY,
                 relationship_type TEXT NOT NULL,
                 relationship_note TEXT,
                 suppress_gems INTEGER NOT NULL DEFAULT 0,
                 source TEXT NOT NULL DEFAULT 'manual',
                 created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
             );",
        )?;

        Ok(applied)
    }

    fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn column_exists(&self, table: &str, column: &str) -> Result<bool, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({table})"))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        for name in names {
            if name? == column {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Row counts per table, for `db --stats` and the dashboard.
    pub fn table_stats(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let tables = [
            "sync_state",
            "threads",
            "messages",
            "attachments",
            "parsed_metadata",
            "sender_temporal",
            "parsed_content",
            "extracted_entities",
            "ai_classification",
            "classification_overrides",
            "domain_exclusions",
            "sender_relationships",
            "sender_profiles",
            "gems",
            "sender_segments",
            "engagement_drafts",
            "pipeline_runs",
            "ai_audit_log",
        ];
        let mut stats = BTreeMap::new();
        for table in tables {
            let count: i64 =
                self.conn
                    .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                        row.get(0)
                    })?;
            stats.insert(table.to_string(), count);
        }
        Ok(stats)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

/// Tolerant JSON column read: malformed historical payloads decode to the
/// type's default instead of failing the whole row.
pub(crate) fn from_json_or_default<T: DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

pub(crate) fn parse_enum<T: std::str::FromStr>(
    column: &'static str,
    value: String,
) -> Result<T, StoreError> {
    value
        .parse::<T>()
        .map_err(|_| StoreError::InvalidEnum { column, value })
}
