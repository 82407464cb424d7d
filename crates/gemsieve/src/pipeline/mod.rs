//! Pipeline orchestration: stage registry, run records, a bounded worker
//! pool, live event broadcasting, and the AI audit interceptor.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, broadcast};
use tracing::{error, info};

use crate::ai::{AiError, AuditingClient, CompletionClient, provider_for};
use crate::config::Config;
use crate::constants::STAGE_ORDER;
use crate::esp::{self, EspRule};
use crate::known::KnownEntities;
use crate::models::Strategy;
use crate::ner::NerTagger;
use crate::stages::engage::{EngageOptions, EngageSelection};
use crate::stages::{self, CancelToken, StageError, StageReport};
use crate::store::{Store, StoreError};

const WORKER_POOL_SIZE: usize = 2;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown stage `{0}`")]
    UnknownStage(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("stage worker panicked: {0}")]
    Join(String),
}

/// Live event stream consumed by the admin UI. The Display form is the wire
/// format pushed over SSE.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Started { run_id: i64, stage: String },
    Done { run_id: i64, stage: String, items: i64 },
    Failed { run_id: i64, stage: String, error: String },
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::Started { run_id, stage } => {
                write!(f, "[STARTED] {run_id} {stage}")
            }
            PipelineEvent::Done { run_id, stage, items } => {
                write!(f, "[DONE] {run_id} {stage} {items}")
            }
            PipelineEvent::Failed { run_id, stage, error } => {
                write!(f, "[FAILED] {run_id} {stage} {error}")
            }
        }
    }
}

/// Per-invocation knobs carried from the CLI or the admin API.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub retrain: bool,
    pub model_spec: Option<String>,
    pub gem_id: Option<i64>,
    pub strategy: Option<Strategy>,
    pub top_n: Option<usize>,
    pub generate_all: bool,
}

/// Immutable service context assembled once at startup and shared by every
/// stage job. No process-wide singletons.
pub struct Services {
    pub config: Config,
    pub esp_rules: Vec<EspRule>,
    pub known: KnownEntities,
    pub ner: Option<Arc<dyn NerTagger>>,
}

impl Services {
    pub fn from_config(config: Config) -> Self {
        let esp_rules = esp::load_rules(config.esp_fingerprints_file.as_deref());
        let known = KnownEntities::load(config.known_entities_file.as_deref());
        Self {
            config,
            esp_rules,
            known,
            ner: None,
        }
    }
}

pub struct Orchestrator {
    services: Arc<Services>,
    triggered_by: &'static str,
    workers: Arc<Semaphore>,
    stage_locks: HashMap<&'static str, Arc<Mutex<()>>>,
    events: broadcast::Sender<PipelineEvent>,
    cancel: CancelToken,
}

impl Orchestrator {
    /// `triggered_by` tags every run record; audit interception is active
    /// for the `web` path.
    pub fn new(services: Arc<Services>, triggered_by: &'static str) -> Self {
        let stage_locks = STAGE_ORDER
            .iter()
            .map(|stage| (*stage, Arc::new(Mutex::new(()))))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            services,
            triggered_by,
            workers: Arc::new(Semaphore::new(WORKER_POOL_SIZE)),
            stage_locks,
            events,
            cancel: CancelToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn open_store(&self) -> Result<Store, StoreError> {
        Store::open(&self.services.config.storage.sqlite_path)
    }

    /// Submit a stage to the worker pool. The run row is written `pending`
    /// before this returns, so the id is durable even if the worker lags.
    pub fn submit(self: Arc<Self>, stage: &str, options: RunOptions) -> Result<i64, PipelineError> {
        let stage = self.canonical_stage(stage)?;
        let store = self.open_store()?;
        let snapshot = serde_json::json!({
            "model": options
                .model_spec
                .clone()
                .unwrap_or_else(|| self.services.config.ai.model_spec()),
            "retrain": options.retrain,
        })
        .to_string();
        let run_id = store.create_run(stage, self.triggered_by, Some(&snapshot))?;
        drop(store);

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(err) = this.execute(run_id, stage, options).await {
                error!(run_id, stage, error = %err, "stage job failed");
            }
        });
        Ok(run_id)
    }

    /// Run one stage to completion (CLI path). Returns the run id and report.
    pub async fn run_stage(
        &self,
        stage: &str,
        options: RunOptions,
    ) -> Result<(i64, StageReport), PipelineError> {
        let stage = self.canonical_stage(stage)?;
        let store = self.open_store()?;
        let run_id = store.create_run(stage, self.triggered_by, None)?;
        drop(store);
        let report = self.execute(run_id, stage, options).await?;
        Ok((run_id, report))
    }

    /// Sequentially invoke every stage except `engage`.
    pub async fn run_all(&self, options: RunOptions) -> Result<Vec<i64>, PipelineError> {
        let mut run_ids = Vec::new();
        for stage in STAGE_ORDER.iter().filter(|s| **s != "engage") {
            let (run_id, _) = self.run_stage(stage, options.clone()).await?;
            run_ids.push(run_id);
        }
        Ok(run_ids)
    }

    fn canonical_stage(&self, stage: &str) -> Result<&'static str, PipelineError> {
        STAGE_ORDER
            .iter()
            .find(|s| **s == stage)
            .copied()
            .ok_or_else(|| PipelineError::UnknownStage(stage.to_string()))
    }

    async fn execute(
        &self,
        run_id: i64,
        stage: &'static str,
        options: RunOptions,
    ) -> Result<StageReport, PipelineError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))?;
        // One instance of a stage at a time.
        let lock = self.stage_locks[stage].clone();
        let _stage_guard = lock.lock().await;

        let store = self.open_store()?;
        store.mark_run_running(run_id)?;
        let _ = self.events.send(PipelineEvent::Started {
            run_id,
            stage: stage.to_string(),
        });
        info!(run_id, stage, "stage started");

        let result = self.dispatch(run_id, stage, &store, &options).await;
        match result {
            Ok(report) => {
                match report.error_summary() {
                    Some(summary) => {
                        // Item-level failures: completed with an aggregated
                        // error note; missing rows retry next run.
                        store.mark_run_completed(run_id, report.processed as i64)?;
                        store.conn().execute(
                            "UPDATE pipeline_runs SET error_message = ?1 WHERE id = ?2",
                            rusqlite::params![summary, run_id],
                        ).map_err(StoreError::from)?;
                    }
                    None => store.mark_run_completed(run_id, report.processed as i64)?,
                }
                let _ = self.events.send(PipelineEvent::Done {
                    run_id,
                    stage: stage.to_string(),
                    items: report.processed as i64,
                });
                info!(run_id, stage, items = report.processed, "stage completed");
                Ok(report)
            }
            Err(err) => {
                let reason = match &err {
                    StageError::Cancelled => "cancelled".to_string(),
                    other => other.to_string(),
                };
                store.mark_run_failed(run_id, &reason)?;
                let _ = self.events.send(PipelineEvent::Failed {
                    run_id,
                    stage: stage.to_string(),
                    error: reason.clone(),
                });
                error!(run_id, stage, error = %reason, "stage failed");
                Err(err.into())
            }
        }
    }

    async fn dispatch(
        &self,
        run_id: i64,
        stage: &'static str,
        store: &Store,
        options: &RunOptions,
    ) -> Result<StageReport, StageError> {
        let config = &self.services.config;
        match stage {
            "metadata" => stages::metadata::run(store, &self.services.esp_rules, &self.cancel),
            "content" => stages::content::run(store, &self.cancel),
            "entities" => {
                stages::entities::run(
                    store,
                    &config.entity_extraction,
                    self.services.ner.as_deref(),
                    &self.cancel,
                )
                .await
            }
            "classify" => {
                let model_spec = options
                    .model_spec
                    .clone()
                    .unwrap_or_else(|| config.ai.model_spec());
                let (client, model) = self.build_client(run_id, stage, &model_spec)?;
                let classify_options = stages::classify::ClassifyOptions {
                    model_spec,
                    model,
                    max_body_chars: config.ai.max_body_chars,
                    retrain: options.retrain,
                };
                stages::classify::run(store, client.as_ref(), &classify_options, &self.cancel)
                    .await
            }
            "profile" => {
                let profile_options = stages::profile::ProfileOptions {
                    scoring: config.scoring.clone(),
                    engagement: config.engagement.clone(),
                };
                stages::profile::run(store, &profile_options, &self.services.known, &self.cancel)
            }
            "segment" => stages::segment::run(
                store,
                &config.scoring,
                config.custom_segments_file.as_deref(),
                &self.cancel,
            ),
            "engage" => {
                let model_spec = options
                    .model_spec
                    .clone()
                    .unwrap_or_else(|| config.ai.model_spec());
                let (client, model) = self.build_client(run_id, stage, &model_spec)?;
                let selection = match (options.gem_id, options.strategy) {
                    (Some(id), _) => EngageSelection::Gem(id),
                    (None, Some(strategy)) if !options.generate_all => EngageSelection::Strategy {
                        strategy,
                        top_n: options.top_n,
                    },
                    _ => EngageSelection::All,
                };
                let engage_options = EngageOptions { model, selection };
                stages::engage::run(
                    store,
                    client.as_ref(),
                    &config.engagement,
                    &engage_options,
                    &self.cancel,
                )
                .await
            }
            other => unreachable!("stage registry admitted unknown stage {other}"),
        }
    }

    /// Provider client for a run; web-triggered runs get the audit
    /// interceptor wrapped around the same contract.
    fn build_client(
        &self,
        run_id: i64,
        stage: &'static str,
        model_spec: &str,
    ) -> Result<(Arc<dyn CompletionClient>, String), StageError> {
        let (client, model) = provider_for(model_spec, &self.services.config.ai)?;
        if self.triggered_by == "web" {
            let audit_store = self.open_store().map_err(StageError::Store)?;
            let wrapped = AuditingClient::new(client, audit_store, run_id, stage);
            Ok((Arc::new(wrapped), model))
        } else {
            Ok((client, model))
        }
    }
}
