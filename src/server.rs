//! The single-writer daemon.
//!
//! Owns the workspace (lock, canonical log, index, job store) for its whole
//! lifetime and exposes it over loopback HTTP. Requests are accepted
//! concurrently, but everything that mutates the workspace runs inside one
//! `tokio::sync::Mutex<Workspace>`, so batches, rebuilds and job runs never
//! interleave. Reads (search, show, listings) go straight to the index pool
//! and only ever see committed records.
//!
//! Mutating handlers run their critical section on a spawned task. A client
//! that disconnects or times out drops only the response, never a batch
//! halfway between its canonical append and its index commit.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Readiness, version, workspace, pid |
//! | `POST` | `/v1/events:batch` | Ingest a batch of raw records |
//! | `GET`  | `/v1/events/{id}` | One event record |
//! | `GET`  | `/v1/search` | Full-text search with filters |
//! | `POST` | `/v1/index:rebuild` | Rebuild or catch up the index |
//! | `POST` | `/v1/jobs` | Create or replace a job |
//! | `GET`  | `/v1/jobs` | List jobs |
//! | `GET`  | `/v1/jobs/{name}` | One job |
//! | `DELETE` | `/v1/jobs/{name}` | Delete a job, keeping its runs |
//! | `POST` | `/v1/jobs/{name}/run` | Run a job |
//! | `GET`  | `/v1/jobs/{name}/runs` | Run history for a job |
//! | `GET`  | `/v1/artifacts` | `artifact.created` events, newest first |
//! | `POST` | `/v1/artifacts:pack` | Run `artifact_pack` once for a tag |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "lock_unavailable", "message": "..." } }
//! ```
//!
//! Codes are the [`OpsError::code`] values plus `bad_request` for bodies
//! that do not parse and `internal` for a write task that panicked.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::artifact::{self, ArtifactEntry};
use crate::config::Config;
use crate::error::{ErrorDetail, OpsError};
use crate::get;
use crate::index::{IndexStore, RebuildReport};
use crate::ingest;
use crate::jobs::{self, ArtifactPackConfig, Job, JobRegistry, JobRun, JobStore, NewJob};
use crate::models::{EventRecord, IngestBatch, IngestResult, SCHEMA_VERSION};
use crate::search::{self, SearchHit, SearchQuery};
use crate::workspace::Workspace;

/// Shared state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    /// The write critical section.
    workspace: Arc<Mutex<Workspace>>,
    registry: Arc<JobRegistry>,
    /// Read handles that bypass the mutex.
    index: IndexStore,
    jobs: JobStore,
    root: PathBuf,
    log_path: PathBuf,
}

/// A daemon that holds the workspace lock and has bound its listener, but is
/// not serving yet.
pub struct Daemon {
    listener: TcpListener,
    addr: SocketAddr,
    state: AppState,
}

impl Daemon {
    /// Takes the workspace lock without waiting, then binds.
    ///
    /// Fails with [`OpsError::LockUnavailable`] if another daemon or a
    /// fallback writer holds the workspace.
    pub async fn start(config: &Config) -> crate::error::Result<Self> {
        Self::start_with_registry(config, JobRegistry::with_builtins()).await
    }

    pub async fn start_with_registry(
        config: &Config,
        registry: JobRegistry,
    ) -> crate::error::Result<Self> {
        let workspace = Workspace::open(config, Duration::ZERO).await?;
        let listener = TcpListener::bind(&config.daemon.bind).await?;
        let addr = listener.local_addr()?;

        let state = AppState {
            config: Arc::new(config.clone()),
            index: workspace.index().clone(),
            jobs: workspace.jobs().clone(),
            root: workspace.paths().root.clone(),
            log_path: workspace.paths().log.clone(),
            workspace: Arc::new(Mutex::new(workspace)),
            registry: Arc::new(registry),
        };

        Ok(Self {
            listener,
            addr,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves until `shutdown` resolves, then closes the databases and
    /// releases the workspace lock.
    pub async fn serve<F>(self, shutdown: F) -> crate::error::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let workspace = self.state.workspace.clone();
        let app = router(self.state);
        info!(addr = %self.addr, "daemon listening");
        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        // Connections are gone, but detached writes may still hold a handle.
        let mut workspace = workspace;
        loop {
            match Arc::try_unwrap(workspace) {
                Ok(last) => {
                    last.into_inner().close().await;
                    break;
                }
                Err(shared) => {
                    drop(shared.lock().await);
                    tokio::task::yield_now().await;
                    workspace = shared;
                }
            }
        }
        info!("daemon stopped");
        Ok(())
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/events:batch", post(handle_ingest))
        .route("/v1/events/{id}", get(handle_get_event))
        .route("/v1/search", get(handle_search))
        .route("/v1/index:rebuild", post(handle_rebuild))
        .route("/v1/jobs", post(handle_add_job).get(handle_list_jobs))
        .route(
            "/v1/jobs/{name}",
            get(handle_get_job).delete(handle_delete_job),
        )
        .route("/v1/jobs/{name}/run", post(handle_run_job))
        .route("/v1/jobs/{name}/runs", get(handle_list_runs))
        .route("/v1/artifacts", get(handle_artifacts))
        .route("/v1/artifacts:pack", post(handle_pack))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the daemon and serves until Ctrl-C.
///
/// This is the entry point used by `ops serve`.
pub async fn run_daemon(config: &Config) -> anyhow::Result<()> {
    let daemon = Daemon::start(config).await?;
    eprintln!("ops daemon listening on http://{}", daemon.local_addr());
    daemon
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

struct AppError {
    status: StatusCode,
    detail: ErrorDetail,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.detail })).into_response()
    }
}

impl From<OpsError> for AppError {
    fn from(err: OpsError) -> Self {
        let status = match &err {
            OpsError::InvalidRecord(_) | OpsError::InvalidArgument(_) | OpsError::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            OpsError::NotFound(_) => StatusCode::NOT_FOUND,
            OpsError::DedupeConflict { .. } => StatusCode::CONFLICT,
            OpsError::LockUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            detail: err.to_detail(),
        }
    }
}

fn bad_request(rejection: JsonRejection) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        detail: ErrorDetail::new("bad_request", rejection.body_text()),
    }
}

/// Runs a write to completion on its own task, whether or not the request
/// that started it is still waiting.
async fn detached<T, F>(write: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, AppError>> + Send + 'static,
{
    tokio::spawn(write).await.map_err(|e| {
        error!(error = %e, "write task did not complete");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: ErrorDetail::new("internal", e.to_string()),
        }
    })?
}

#[derive(Serialize, Deserialize)]
pub struct Items<T> {
    pub items: Vec<T>,
}

// ============ GET /health ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub version: String,
    pub schema_version: String,
    pub workspace: String,
    pub pid: u32,
    pub index_position: u64,
    pub canonical_len: u64,
}

async fn handle_health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let canonical_len = tokio::fs::metadata(&state.log_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    Ok(Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: SCHEMA_VERSION.to_string(),
        workspace: state.root.display().to_string(),
        pid: std::process::id(),
        index_position: state.index.position().await?,
        canonical_len,
    }))
}

// ============ POST /v1/events:batch ============

async fn handle_ingest(
    State(state): State<AppState>,
    body: std::result::Result<Json<IngestBatch>, JsonRejection>,
) -> Result<Json<IngestResult>, AppError> {
    let Json(batch) = body.map_err(bad_request)?;
    let workspace = state.workspace.clone();
    detached(async move {
        let mut ws = workspace.lock_owned().await;
        Ok::<_, AppError>(Json(ingest::ingest_json(&mut ws, batch.events).await))
    })
    .await
}

// ============ GET /v1/events/{id} ============

async fn handle_get_event(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<EventRecord>, AppError> {
    Ok(Json(get::get_event(&state.index, &state.log_path, id).await?))
}

// ============ GET /v1/search ============

/// Query-string form of [`SearchQuery`]; `type`, `not_type` and `tag` take
/// comma-separated lists.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default, rename = "type")]
    pub types: Option<String>,
    #[serde(default)]
    pub not_type: Option<String>,
    #[serde(default, rename = "tag")]
    pub tags: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl From<SearchParams> for SearchQuery {
    fn from(params: SearchParams) -> Self {
        let split = |value: Option<String>| -> Vec<String> {
            value
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        };
        SearchQuery {
            q: params.q,
            types: split(params.types),
            exclude_types: split(params.not_type),
            tags: split(params.tags),
            source_name: params.source,
            after: params.after,
            before: params.before,
            limit: params.limit,
        }
    }
}

impl From<&SearchQuery> for SearchParams {
    fn from(query: &SearchQuery) -> Self {
        let join = |values: &[String]| (!values.is_empty()).then(|| values.join(","));
        SearchParams {
            q: query.q.clone(),
            types: join(&query.types),
            not_type: join(&query.exclude_types),
            tags: join(&query.tags),
            source: query.source_name.clone(),
            after: query.after.clone(),
            before: query.before.clone(),
            limit: query.limit,
        }
    }
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Items<SearchHit>>, AppError> {
    let items = search::search(
        &state.index,
        &params.into(),
        state.config.index.snippet_tokens,
        state.config.index.default_limit,
    )
    .await?;
    Ok(Json(Items { items }))
}

// ============ POST /v1/index:rebuild ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildRequest {
    #[serde(default = "default_wipe")]
    pub wipe: bool,
}

fn default_wipe() -> bool {
    true
}

async fn handle_rebuild(
    State(state): State<AppState>,
    body: std::result::Result<Json<RebuildRequest>, JsonRejection>,
) -> Result<Json<RebuildReport>, AppError> {
    let Json(request) = body.map_err(bad_request)?;
    let workspace = state.workspace.clone();
    detached(async move {
        let mut ws = workspace.lock_owned().await;
        let report = ws.rebuild(request.wipe).await?;
        Ok::<_, AppError>(Json(report))
    })
    .await
}

// ============ Jobs ============

async fn handle_add_job(
    State(state): State<AppState>,
    body: std::result::Result<Json<NewJob>, JsonRejection>,
) -> Result<Json<Job>, AppError> {
    let Json(new) = body.map_err(bad_request)?;
    let (workspace, registry) = (state.workspace.clone(), state.registry.clone());
    detached(async move {
        let ws = workspace.lock_owned().await;
        let job = jobs::add_job(&ws, &registry, new).await?;
        Ok::<_, AppError>(Json(job))
    })
    .await
}

async fn handle_get_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Job>, AppError> {
    let job = state
        .jobs
        .get_job(&name)
        .await?
        .ok_or_else(|| OpsError::NotFound(format!("job '{}'", name)))?;
    Ok(Json(job))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deleted {
    pub ok: bool,
}

async fn handle_delete_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Deleted>, AppError> {
    let workspace = state.workspace.clone();
    detached(async move {
        let ws = workspace.lock_owned().await;
        jobs::delete_job(&ws, &name).await?;
        Ok::<_, AppError>(Json(Deleted { ok: true }))
    })
    .await
}

async fn handle_list_jobs(State(state): State<AppState>) -> Result<Json<Items<Job>>, AppError> {
    Ok(Json(Items {
        items: state.jobs.list_jobs().await?,
    }))
}

async fn handle_run_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<JobRun>, AppError> {
    let (workspace, registry) = (state.workspace.clone(), state.registry.clone());
    detached(async move {
        let mut ws = workspace.lock_owned().await;
        let run = jobs::run_job(&mut ws, &registry, &name).await?;
        Ok::<_, AppError>(Json(run))
    })
    .await
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    #[serde(default)]
    limit: Option<i64>,
}

async fn handle_list_runs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Items<JobRun>>, AppError> {
    Ok(Json(Items {
        items: state.jobs.list_runs(&name, params.limit.unwrap_or(20)).await?,
    }))
}

// ============ GET /v1/artifacts ============

async fn handle_artifacts(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Items<ArtifactEntry>>, AppError> {
    let limit = params.limit.unwrap_or(state.config.index.default_limit);
    Ok(Json(Items {
        items: artifact::list_artifacts(&state.index, limit).await?,
    }))
}

// ============ POST /v1/artifacts:pack ============

async fn handle_pack(
    State(state): State<AppState>,
    body: std::result::Result<Json<ArtifactPackConfig>, JsonRejection>,
) -> Result<Json<JobRun>, AppError> {
    let Json(request) = body.map_err(bad_request)?;
    let config = serde_json::to_value(request).map_err(OpsError::from)?;
    let (workspace, registry) = (state.workspace.clone(), state.registry.clone());
    detached(async move {
        let mut ws = workspace.lock_owned().await;
        let run = jobs::run_adhoc(&mut ws, &registry, "artifact_pack", &config).await?;
        Ok::<_, AppError>(Json(run))
    })
    .await
}
