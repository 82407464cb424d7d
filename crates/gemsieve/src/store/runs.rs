//! Pipeline run records and the AI call audit log.

use rusqlite::{OptionalExtension, Row, params};

use crate::models::{AiAuditEntry, PipelineRun, RunStatus};
use crate::store::{Store, StoreError, now_rfc3339, parse_enum};

/// One AI call captured by the audit interceptor.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub pipeline_run_id: i64,
    pub stage: String,
    pub sender_domain: String,
    pub prompt_template: String,
    pub prompt_rendered: String,
    pub system_prompt: String,
    pub model_used: String,
    pub response_raw: String,
    pub response_parsed: Option<String>,
    pub duration_ms: i64,
}

impl Store {
    pub fn create_run(
        &self,
        stage: &str,
        triggered_by: &str,
        config_snapshot: Option<&str>,
    ) -> Result<i64, StoreError> {
        self.conn().execute(
            "INSERT INTO pipeline_runs (stage, status, triggered_by, config_snapshot)
             VALUES (?1, 'pending', ?2, ?3)",
            params![stage, triggered_by, config_snapshot],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn mark_run_running(&self, id: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE pipeline_runs SET status = 'running', started_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn mark_run_completed(&self, id: i64, items: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE pipeline_runs SET status = 'completed', completed_at = ?1,
                 items_processed = ?2
             WHERE id = ?3",
            params![now_rfc3339(), items, id],
        )?;
        Ok(())
    }

    pub fn mark_run_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE pipeline_runs SET status = 'failed', completed_at = ?1,
                 error_message = ?2
             WHERE id = ?3",
            params![now_rfc3339(), error, id],
        )?;
        Ok(())
    }

    pub fn get_run(&self, id: i64) -> Result<Option<PipelineRun>, StoreError> {
        let raw = self
            .conn()
            .query_row(
                &format!("{RUN_SELECT} WHERE id = ?1"),
                params![id],
                map_run_raw,
            )
            .optional()?;
        raw.map(finish_run).transpose()
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<PipelineRun>, StoreError> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{RUN_SELECT} ORDER BY id DESC LIMIT ?1"))?;
        let rows = stmt.query_map(params![limit as i64], map_run_raw)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_run(row?)?);
        }
        Ok(out)
    }

    /// Run counts per (stage, status), for the pipeline-activity view.
    pub fn run_activity(&self) -> Result<Vec<(String, String, i64)>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT stage, status, COUNT(*) FROM pipeline_runs GROUP BY stage, status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn insert_audit_entry(&self, entry: &NewAuditEntry) -> Result<i64, StoreError> {
        self.conn().execute(
            "INSERT INTO ai_audit_log (
                 pipeline_run_id, stage, sender_domain, prompt_template,
                 prompt_rendered, system_prompt, model_used, response_raw,
                 response_parsed, duration_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.pipeline_run_id,
                entry.stage,
                entry.sender_domain,
                entry.prompt_template,
                entry.prompt_rendered,
                entry.system_prompt,
                entry.model_used,
                entry.response_raw,
                entry.response_parsed,
                entry.duration_ms,
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn list_audit_entries(
        &self,
        stage: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AiAuditEntry>, StoreError> {
        match stage {
            Some(stage) => {
                let mut stmt = self.conn().prepare(&format!(
                    "{AUDIT_SELECT} WHERE stage = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows =
                    stmt.query_map(params![stage, limit as i64, offset as i64], map_audit)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
            }
            None => {
                let mut stmt = self.conn().prepare(&format!(
                    "{AUDIT_SELECT} ORDER BY id DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt.query_map(params![limit as i64, offset as i64], map_audit)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
            }
        }
    }

    pub fn get_audit_entry(&self, id: i64) -> Result<Option<AiAuditEntry>, StoreError> {
        self.conn()
            .query_row(
                &format!("{AUDIT_SELECT} WHERE id = ?1"),
                params![id],
                map_audit,
            )
            .optional()
            .map_err(StoreError::from)
    }
}

const RUN_SELECT: &str = "SELECT id, stage, status, created_at, started_at, completed_at, \
     items_processed, error_message, config_snapshot, triggered_by \
     FROM pipeline_runs";

const AUDIT_SELECT: &str = "SELECT id, pipeline_run_id, stage, sender_domain, prompt_template, \
     prompt_rendered, system_prompt, model_used, response_raw, \
     response_parsed, duration_ms, created_at FROM ai_audit_log";

struct RunRaw {
    id: i64,
    stage: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    items_processed: Option<i64>,
    error_message: Option<String>,
    config_snapshot: Option<String>,
    triggered_by: String,
}

fn map_run_raw(row: &Row<'_>) -> rusqlite::Result<RunRaw> {
    Ok(RunRaw {
        id: row.get(0)?,
        stage: row.get(1)?,
        status: row.get(2)?,
        created_at: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        items_processed: row.get(6)?,
        error_message: row.get(7)?,
        config_snapshot: row.get(8)?,
        triggered_by: row.get(9)?,
    })
}

fn finish_run(raw: RunRaw) -> Result<PipelineRun, StoreError> {
    Ok(PipelineRun {
        id: raw.id,
        stage: raw.stage,
        status: parse_enum::<RunStatus>("status", raw.status)?,
        created_at: raw.created_at,
        started_at: raw.started_at,
        completed_at: raw.completed_at,
        items_processed: raw.items_processed,
        error_message: raw.error_message,
        config_snapshot: raw.config_snapshot,
        triggered_by: raw.triggered_by,
    })
}

fn map_audit(row: &Row<'_>) -> rusqlite::Result<AiAuditEntry> {
    Ok(AiAuditEntry {
        id: row.get(0)?,
        pipeline_run_id: row.get(1)?,
        stage: row.get(2)?,
        sender_domain: row.get(3)?,
        prompt_template: row.get(4)?,
        prompt_rendered: row.get(5)?,
        system_prompt: row.get(6)?,
        model_used: row.get(7)?,
        response_raw: row.get(8)?,
        response_parsed: row.get(9)?,
        duration_ms: row.get(10)?,
        created_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_lifecycle_records_each_transition() {
        let store = Store::in_memory().expect("store");
        let id = store.create_run("classify", "cli", None).expect("create");
        let run = store.get_run(id).expect("get").expect("exists");
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.started_at.is_none());

        store.mark_run_running(id).expect("running");
        store.mark_run_completed(id, 42).expect("completed");
        let run = store.get_run(id).expect("get").expect("exists");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.items_processed, Some(42));
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn failed_run_keeps_error_message() {
        let store = Store::in_memory().expect("store");
        let id = store.create_run("engage", "web", None).expect("create");
        store.mark_run_running(id).expect("running");
        store.mark_run_failed(id, "cancelled").expect("failed");
        let run = store.get_run(id).expect("get").expect("exists");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("cancelled"));
    }

    #[test]
    fn audit_entries_page_and_filter_by_stage() {
        let store = Store::in_memory().expect("store");
        let run_id = store.create_run("classify", "web", None).expect("run");
        for i in 0..3 {
            store
                .insert_audit_entry(&NewAuditEntry {
                    pipeline_run_id: run_id,
                    stage: if i == 0 { "engage" } else { "classify" }.to_string(),
                    sender_domain: "acme.com".to_string(),
                    prompt_template: "CLASSIFICATION_PROMPT".to_string(),
                    prompt_rendered: format!("prompt {i}"),
                    system_prompt: "json only".to_string(),
                    model_used: "ollama:mistral-nemo".to_string(),
                    response_raw: "{}".to_string(),
                    response_parsed: Some("{}".to_string()),
                    duration_ms: 120,
                })
                .expect("insert");
        }
        let classify = store
            .list_audit_entries(Some("classify"), 10, 0)
            .expect("list");
        assert_eq!(classify.len(), 2);
        let paged = store.list_audit_entries(None, 2, 2).expect("paged");
        assert_eq!(paged.len(), 1);
    }
}
