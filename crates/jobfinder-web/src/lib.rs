//! JSON API over the sync pipeline.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::QueryRejection, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use jobfinder_adapters::SourceKind;
use jobfinder_core::{CoreError, Criteria, CriteriaInput, Match, MatchStatus, Posting};
use jobfinder_storage::{MatchFilter, StoreError};
use jobfinder_sync::{AppRuntime, SyncPipeline};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobfinder-web";

const JOBS_LIMIT: usize = 200;
const RUNS_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Store(StoreError),
    Internal(anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self::Store(StoreError::Core(err))
    }
}

/// Malformed query strings answer like any other validation failure.
impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Store(StoreError::Core(CoreError::Validation(rejection.body_text())))
    }
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Store(StoreError::NotFound { .. }) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Store(StoreError::RunAlreadyInProgress { .. }) => {
                (StatusCode::CONFLICT, "run_already_in_progress")
            }
            Self::Store(StoreError::RunAlreadyFinished(_)) => {
                (StatusCode::CONFLICT, "run_already_finished")
            }
            Self::Store(StoreError::Core(CoreError::InvalidTransition { .. })) => {
                (StatusCode::CONFLICT, "invalid_transition")
            }
            Self::Store(StoreError::Core(CoreError::Validation(_)))
            | Self::Store(StoreError::Core(CoreError::UnknownStatus(_))) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "validation")
            }
            Self::Store(StoreError::Serialization(_)) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let message = match &self {
            Self::Store(err) => err.to_string(),
            Self::Internal(err) => format!("{err:#}"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %message, "request failed");
        }
        (
            status,
            Json(serde_json::json!({ "error": kind, "message": message })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// One row of the dashboard job list: a match joined with its posting.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub match_id: Uuid,
    pub criteria_id: Uuid,
    pub title: String,
    pub company: String,
    pub source: String,
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub match_score: u8,
    pub status: MatchStatus,
    pub url: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub is_remote: bool,
}

impl JobView {
    fn project(record: &Match, posting: &Posting) -> Self {
        Self {
            id: posting.canonical_id,
            match_id: record.id,
            criteria_id: record.criteria_id,
            title: posting.title.clone(),
            company: posting.company.clone(),
            source: posting.source.clone(),
            salary_min: posting.salary_min,
            salary_max: posting.salary_max,
            match_score: record.match_score,
            status: record.status,
            url: posting.url.clone(),
            posted_at: posting.posted_at,
            is_remote: posting.is_remote,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SourceView {
    source_id: String,
    display_name: String,
    enabled: bool,
    kind: SourceKind,
    open_run_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
struct JobsQuery {
    status: Option<String>,
    min_score: Option<u8>,
    criteria_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct TriggerQuery {
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    endpoint: String,
    #[serde(default)]
    subscription_payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct UnsubscribeQuery {
    endpoint: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/{match_id}/status", patch(update_status_handler))
        .route(
            "/api/criteria",
            get(list_criteria_handler).post(create_criteria_handler),
        )
        .route(
            "/api/criteria/{id}",
            get(get_criteria_handler)
                .put(replace_criteria_handler)
                .delete(delete_criteria_handler),
        )
        .route("/api/scrapes", get(list_runs_handler))
        .route("/api/scrapes/sources", get(list_sources_handler))
        .route("/api/scrapes/trigger", post(trigger_handler))
        .route(
            "/api/notifications/subscribe",
            post(subscribe_handler).delete(unsubscribe_handler),
        )
        .with_state(Arc::new(state))
}

/// Build the runtime from the environment, start the scheduler when enabled
/// and serve until ctrl-c.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = AppRuntime::from_env().await?;
    let mut scheduler = runtime.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %runtime.config().sync_cron, "scheduler started");
    }

    let port = runtime.config().web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(runtime.pipeline())))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await?;
    }
    runtime.shutdown(Duration::from_secs(5)).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "listening for ctrl-c failed");
    }
    info!("shutting down");
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_jobs_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<JobsQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<JobView>>> {
    let Query(query) = query?;
    if let Some(min) = query.min_score.filter(|m| *m > 100) {
        return Err(CoreError::Validation(format!("min_score {min} is above 100")).into());
    }
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::parse::<MatchStatus>)
        .transpose()?;
    let stores = state.pipeline.stores();
    let records = stores
        .matches
        .list(&MatchFilter {
            status,
            min_score: query.min_score,
            criteria_id: query.criteria_id,
            limit: Some(JOBS_LIMIT),
        })
        .await;

    let mut jobs = Vec::with_capacity(records.len());
    for record in &records {
        if let Some(posting) = stores.postings.get(record.canonical_id).await {
            jobs.push(JobView::project(record, &posting));
        }
    }
    Ok(Json(jobs))
}

async fn update_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(match_id): AxumPath<Uuid>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> ApiResult<Json<JobView>> {
    let Query(query) = query?;
    let to = query.status.parse::<MatchStatus>()?;
    let record = state.pipeline.transition_match(match_id, to).await?;
    let posting = state
        .pipeline
        .stores()
        .postings
        .get(record.canonical_id)
        .await
        .ok_or_else(|| StoreError::not_found("posting", record.canonical_id))?;
    Ok(Json(JobView::project(&record, &posting)))
}

async fn list_criteria_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Criteria>> {
    Json(state.pipeline.stores().criteria.list().await)
}

async fn get_criteria_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> ApiResult<Json<Criteria>> {
    state
        .pipeline
        .stores()
        .criteria
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| StoreError::not_found("criteria", id).into())
}

async fn create_criteria_handler(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CriteriaInput>,
) -> ApiResult<(StatusCode, Json<Criteria>)> {
    let criteria = state.pipeline.create_criteria(input).await?;
    Ok((StatusCode::CREATED, Json(criteria)))
}

async fn replace_criteria_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(input): Json<CriteriaInput>,
) -> ApiResult<Json<Criteria>> {
    Ok(Json(state.pipeline.replace_criteria(id, input).await?))
}

async fn delete_criteria_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> ApiResult<StatusCode> {
    state.pipeline.delete_criteria(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_runs_handler(State(state): State<Arc<AppState>>) -> Json<Vec<jobfinder_core::ScrapeRun>> {
    Json(state.pipeline.stores().runs.list(RUNS_LIMIT).await)
}

async fn list_sources_handler(State(state): State<Arc<AppState>>) -> Json<Vec<SourceView>> {
    let runs = &state.pipeline.stores().runs;
    let mut views = Vec::new();
    for source in state.pipeline.sources() {
        let open_run_id = runs.open_run(&source.source_id).await;
        views.push(SourceView {
            source_id: source.source_id,
            display_name: source.display_name,
            enabled: source.enabled,
            kind: source.kind,
            open_run_id,
        });
    }
    Json(views)
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<TriggerQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let source = query.source.as_deref().filter(|s| !s.trim().is_empty());
    let ack = state.pipeline.trigger(source).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubscribeRequest>,
) -> ApiResult<impl IntoResponse> {
    let sub = state
        .pipeline
        .subscribe(&request.endpoint, request.subscription_payload)
        .await?;
    Ok((StatusCode::CREATED, Json(sub)))
}

async fn unsubscribe_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<UnsubscribeQuery>, QueryRejection>,
) -> ApiResult<StatusCode> {
    let Query(query) = query?;
    state.pipeline.unsubscribe(&query.endpoint).await?;
    Ok(StatusCode::NO_CONTENT)
}
