//! Gemsieve: a re-entrant multi-stage analysis pipeline that mines a
//! mailbox for typed, scored commercial opportunities.
//!
//! The store is the integration bus: stages read upstream tables, find
//! unprocessed rows via left-anti-joins, and upsert their own output, so
//! every stage is idempotent and independently re-runnable.

pub mod ai;
pub mod cli;
pub mod config;
pub mod constants;
pub mod domains;
pub mod error;
pub mod esp;
pub mod export;
pub mod known;
pub mod mail;
pub mod models;
pub mod ner;
pub mod pipeline;
pub mod server;
pub mod stages;
pub mod store;

pub use error::AppError;
