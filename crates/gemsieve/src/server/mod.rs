//! Admin HTTP portal: read-oriented browse endpoints, pipeline control,
//! live event streaming, and the AI audit log.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

use crate::constants::STAGE_ORDER;
use crate::models::GemStatus;
use crate::pipeline::{Orchestrator, PipelineError, RunOptions, Services};
use crate::store::{GemFilter, Store, StoreError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone)]
pub struct AppState {
    services: Arc<Services>,
    orchestrator: Arc<Orchestrator>,
}

impl AppState {
    fn store(&self) -> Result<Store, ApiError> {
        Store::open(&self.services.config.storage.sqlite_path).map_err(ApiError::from)
    }
}

/// Request-level error mapped onto HTTP status codes.
#[derive(Debug, Error)]
enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("unknown stage `{0}`")]
    UnknownStage(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::UnknownStage(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn serve(services: Arc<Services>) -> Result<(), ServerError> {
    let address = format!(
        "{}:{}",
        services.config.server.host, services.config.server.port
    );
    let listen_addr: SocketAddr =
        address
            .parse()
            .map_err(|source| ServerError::InvalidListenAddr {
                address: address.clone(),
                source,
            })?;

    let orchestrator = Arc::new(Orchestrator::new(services.clone(), "web"));
    let state = AppState {
        services,
        orchestrator,
    };
    let app = build_router(state);

    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: address.clone(),
            source,
        })?;
    info!(%listen_addr, "gemsieve admin portal listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|source| ServerError::Serve { source })
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/messages", get(list_messages))
        .route("/api/messages/{id}", get(get_message))
        .route("/api/threads", get(list_threads))
        .route("/api/threads/{id}", get(get_thread))
        .route("/api/profiles", get(list_profiles))
        .route("/api/profiles/{domain}", get(get_profile))
        .route("/api/gems", get(list_gems))
        .route("/api/gems/{id}", get(get_gem))
        .route("/api/gems/{id}/generate", post(generate_for_gem))
        .route("/api/segments", get(list_segments))
        .route("/api/drafts", get(list_drafts))
        .route("/api/overrides", get(list_overrides))
        .route("/api/relationships", get(list_relationships))
        .route("/api/pipeline/run/{stage}", post(run_pipeline_stage))
        .route("/api/pipeline/status/{run_id}", get(pipeline_status))
        .route("/api/pipeline/runs", get(pipeline_runs))
        .route("/api/pipeline/stream", get(pipeline_stream))
        .route("/api/stats", get(stats))
        .route("/api/stats/gems-by-type", get(gems_by_type))
        .route("/api/stats/gems-top/{n}", get(top_gems))
        .route("/api/stats/by-industry", get(stats_by_industry))
        .route("/api/stats/by-esp", get(stats_by_esp))
        .route("/api/stats/pipeline-activity", get(pipeline_activity))
        .route("/api/stages", get(list_stages))
        .route("/api/ai-audit", get(list_ai_audit))
        .route("/api/ai-audit/{id}", get(get_ai_audit))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct BrowseParams {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

impl BrowseParams {
    fn window<T>(&self, mut rows: Vec<T>) -> Vec<T> {
        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(100);
        if offset >= rows.len() {
            return Vec::new();
        }
        rows.drain(..offset);
        rows.truncate(limit);
        rows
    }
}

async fn list_messages(
    State(state): State<AppState>,
    Query(params): Query<BrowseParams>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let mut rows = Vec::new();
    for thread_id in store.list_thread_ids()? {
        for message in store.messages_in_thread(&thread_id)? {
            if let Some(q) = &params.q {
                let q = q.to_ascii_lowercase();
                if !message.subject.to_ascii_lowercase().contains(&q)
                    && !message.from_address.to_ascii_lowercase().contains(&q)
                {
                    continue;
                }
            }
            rows.push(message);
        }
    }
    rows.sort_by(|a, b| b.date.cmp(&a.date));
    Ok(Json(params.window(rows)).into_response())
}

async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let message = store.get_message(&id)?.ok_or(ApiError::NotFound("message"))?;
    let metadata = store.get_parsed_metadata(&id)?;
    let content = store.get_parsed_content(&id)?;
    let entities = store.entities_for_message(&id)?;
    let classification = store.get_classification(&id)?;
    Ok(Json(json!({
        "message": message,
        "metadata": metadata,
        "content": content,
        "entities": entities,
        "classification": classification,
    }))
    .into_response())
}

async fn list_threads(
    State(state): State<AppState>,
    Query(params): Query<BrowseParams>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let mut rows = Vec::new();
    for thread_id in store.list_thread_ids()? {
        if let Some(thread) = store.get_thread(&thread_id)? {
            if let Some(q) = &params.q {
                if !thread
                    .subject
                    .to_ascii_lowercase()
                    .contains(&q.to_ascii_lowercase())
                {
                    continue;
                }
            }
            rows.push(thread);
        }
    }
    rows.sort_by(|a, b| b.last_message_date.cmp(&a.last_message_date));
    Ok(Json(params.window(rows)).into_response())
}

async fn get_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let thread = store.get_thread(&id)?.ok_or(ApiError::NotFound("thread"))?;
    let messages = store.messages_in_thread(&id)?;
    Ok(Json(json!({ "thread": thread, "messages": messages })).into_response())
}

async fn list_profiles(
    State(state): State<AppState>,
    Query(params): Query<BrowseParams>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let mut rows = store.list_profiles()?;
    if let Some(q) = &params.q {
        let q = q.to_ascii_lowercase();
        rows.retain(|p| {
            p.sender_domain.contains(&q) || p.company_name.to_ascii_lowercase().contains(&q)
        });
    }
    Ok(Json(params.window(rows)).into_response())
}

async fn get_profile(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let profile = store
        .get_profile(&domain)?
        .ok_or(ApiError::NotFound("profile"))?;
    let gems = store.gems_for_domain(&domain)?;
    let segments = store.segments_for_domain(&domain)?;
    let relationship = store.get_relationship(&domain)?;
    Ok(Json(json!({
        "profile": profile,
        "gems": gems,
        "segments": segments,
        "relationship": relationship,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct GemParams {
    #[serde(default)]
    gem_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    segment: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_gems(
    State(state): State<AppState>,
    Query(params): Query<GemParams>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let filter = GemFilter {
        gem_type: params.gem_type.as_deref().and_then(|t| t.parse().ok()),
        status: params.status.as_deref().and_then(|s| s.parse().ok()),
        segment: params.segment.clone(),
        limit: params.limit,
    };
    Ok(Json(store.list_gems(&filter)?).into_response())
}

async fn get_gem(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let gem = store.get_gem(id)?.ok_or(ApiError::NotFound("gem"))?;
    Ok(Json(gem).into_response())
}

async fn generate_for_gem(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    store.get_gem(id)?.ok_or(ApiError::NotFound("gem"))?;
    let options = RunOptions {
        gem_id: Some(id),
        ..RunOptions::default()
    };
    let run_id = state.orchestrator.clone().submit("engage", options)?;
    Ok(Json(json!({ "status": "submitted", "run_id": run_id })).into_response())
}

async fn list_segments(State(state): State<AppState>) -> Result<Response, ApiError> {
    let store = state.store()?;
    Ok(Json(store.list_segments(None)?).into_response())
}

async fn list_drafts(State(state): State<AppState>) -> Result<Response, ApiError> {
    let store = state.store()?;
    Ok(Json(store.list_drafts()?).into_response())
}

async fn list_overrides(State(state): State<AppState>) -> Result<Response, ApiError> {
    let store = state.store()?;
    Ok(Json(store.list_overrides()?).into_response())
}

async fn list_relationships(State(state): State<AppState>) -> Result<Response, ApiError> {
    let store = state.store()?;
    Ok(Json(store.list_relationships(None)?).into_response())
}

#[derive(Debug, Deserialize)]
struct RunParams {
    #[serde(default)]
    retrain: bool,
    #[serde(default)]
    crew: bool,
}

async fn run_pipeline_stage(
    State(state): State<AppState>,
    Path(stage): Path<String>,
    Query(params): Query<RunParams>,
) -> Result<Response, ApiError> {
    if params.crew {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "crew mode is not supported" })),
        )
            .into_response());
    }

    let options = RunOptions {
        retrain: params.retrain,
        ..RunOptions::default()
    };

    if stage == "all" {
        let mut run_ids = Vec::new();
        for name in STAGE_ORDER.iter().filter(|s| **s != "engage") {
            run_ids.push(state.orchestrator.clone().submit(name, options.clone())?);
        }
        return Ok(Json(json!({ "status": "submitted", "run_ids": run_ids })).into_response());
    }

    if !STAGE_ORDER.contains(&stage.as_str()) {
        return Err(ApiError::UnknownStage(stage));
    }
    let run_id = state.orchestrator.clone().submit(&stage, options)?;
    Ok(Json(json!({ "status": "submitted", "run_id": run_id, "stage": stage })).into_response())
}

async fn pipeline_status(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let run = store.get_run(run_id)?.ok_or(ApiError::NotFound("run"))?;
    Ok(Json(run).into_response())
}

#[derive(Debug, Deserialize)]
struct RunsParams {
    #[serde(default)]
    limit: Option<usize>,
}

async fn pipeline_runs(
    State(state): State<AppState>,
    Query(params): Query<RunsParams>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    Ok(Json(store.list_runs(params.limit.unwrap_or(20))?).into_response())
}

async fn pipeline_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut receiver = state.orchestrator.subscribe();
    let stream = async_stream::stream! {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    yield Ok(Event::default().data(event.to_string()));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn stats(State(state): State<AppState>) -> Result<Response, ApiError> {
    let store = state.store()?;
    Ok(Json(store.table_stats()?).into_response())
}

async fn gems_by_type(State(state): State<AppState>) -> Result<Response, ApiError> {
    let store = state.store()?;
    Ok(Json(store.count_gems_by_type()?).into_response())
}

async fn top_gems(
    State(state): State<AppState>,
    Path(n): Path<usize>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let gems = store.list_gems(&GemFilter {
        status: Some(GemStatus::New),
        limit: Some(n),
        ..GemFilter::default()
    })?;
    Ok(Json(gems).into_response())
}

async fn stats_by_industry(State(state): State<AppState>) -> Result<Response, ApiError> {
    let store = state.store()?;
    Ok(Json(store.industry_counts()?).into_response())
}

async fn stats_by_esp(State(state): State<AppState>) -> Result<Response, ApiError> {
    let store = state.store()?;
    Ok(Json(store.esp_counts()?).into_response())
}

async fn pipeline_activity(State(state): State<AppState>) -> Result<Response, ApiError> {
    let store = state.store()?;
    let rows: Vec<_> = store
        .run_activity()?
        .into_iter()
        .map(|(stage, status, count)| json!({ "stage": stage, "status": status, "count": count }))
        .collect();
    Ok(Json(rows).into_response())
}

async fn list_stages() -> Response {
    let stages: Vec<_> = STAGE_ORDER
        .iter()
        .map(|stage| json!({ "name": stage }))
        .collect();
    Json(stages).into_response()
}

#[derive(Debug, Deserialize)]
struct AuditParams {
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

async fn list_ai_audit(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let entries = store.list_audit_entries(
        params.stage.as_deref(),
        params.limit.unwrap_or(50),
        params.offset.unwrap_or(0),
    )?;
    Ok(Json(entries).into_response())
}

async fn get_ai_audit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let entry = store
        .get_audit_entry(id)?
        .ok_or(ApiError::NotFound("audit entry"))?;
    Ok(Json(entry).into_response())
}

/// Test-only constructor so integration specs can drive the router without
/// binding a socket.
pub fn app_state_for(services: Arc<Services>) -> AppState {
    let orchestrator = Arc::new(Orchestrator::new(services.clone(), "web"));
    AppState {
        services,
        orchestrator,
    }
}
