//! In-process equivalents of the daemon operations.
//!
//! Writes open a [`Workspace`], which takes the same lock file the daemon
//! holds (waiting at most `client.lock_timeout_ms`), run one operation
//! through the same pipeline code the daemon uses, and release the lock.
//! While a daemon is running every write here fails with
//! [`OpsError::LockUnavailable`].
//!
//! Reads open the index and state databases read-only and need no lock.

use serde_json::Value;

use crate::artifact::{self, ArtifactEntry};
use crate::canonical;
use crate::config::Config;
use crate::error::{OpsError, Result};
use crate::get;
use crate::index::{IndexStore, RebuildReport};
use crate::ingest;
use crate::jobs::{self, ArtifactPackConfig, Job, JobRegistry, JobRun, JobStore, NewJob};
use crate::models::{EventRecord, IngestResult};
use crate::search::{self, SearchHit, SearchQuery};
use crate::workspace::{Workspace, WorkspacePaths};

async fn open(config: &Config) -> Result<Workspace> {
    Workspace::open(config, config.lock_timeout()).await
}

pub async fn ingest(config: &Config, events: Vec<Value>) -> Result<IngestResult> {
    let mut ws = open(config).await?;
    let result = ingest::ingest_json(&mut ws, events).await;
    ws.close().await;
    Ok(result)
}

pub async fn rebuild(config: &Config, wipe: bool) -> Result<RebuildReport> {
    let mut ws = open(config).await?;
    let report = ws.rebuild(wipe).await;
    ws.close().await;
    report
}

pub async fn add_job(config: &Config, registry: &JobRegistry, job: NewJob) -> Result<Job> {
    let ws = open(config).await?;
    let job = jobs::add_job(&ws, registry, job).await;
    ws.close().await;
    job
}

pub async fn run_job(config: &Config, registry: &JobRegistry, name: &str) -> Result<JobRun> {
    let mut ws = open(config).await?;
    let run = jobs::run_job(&mut ws, registry, name).await;
    ws.close().await;
    run
}

pub async fn delete_job(config: &Config, name: &str) -> Result<()> {
    let ws = open(config).await?;
    let deleted = jobs::delete_job(&ws, name).await;
    ws.close().await;
    deleted
}

pub async fn pack(
    config: &Config,
    registry: &JobRegistry,
    request: &ArtifactPackConfig,
) -> Result<JobRun> {
    let pack_config = serde_json::to_value(request)?;
    let mut ws = open(config).await?;
    let run = jobs::run_adhoc(&mut ws, registry, "artifact_pack", &pack_config).await;
    ws.close().await;
    run
}

// ============ Reads ============

fn paths(config: &Config) -> WorkspacePaths {
    WorkspacePaths::new(&config.workspace.root)
}

pub async fn search(config: &Config, query: &SearchQuery) -> Result<Vec<SearchHit>> {
    let paths = paths(config);
    if !paths.index_db.exists() {
        return Ok(Vec::new());
    }
    let index = IndexStore::open_reader(&paths.index_db).await?;
    let hits = search::search(
        &index,
        query,
        config.index.snippet_tokens,
        config.index.default_limit,
    )
    .await;
    index.close().await;
    hits
}

pub async fn show(config: &Config, id: i64) -> Result<EventRecord> {
    let paths = paths(config);
    if !paths.index_db.exists() {
        return canonical::find_in(&paths.log, id)?
            .ok_or_else(|| OpsError::NotFound(format!("event {}", id)));
    }
    let index = IndexStore::open_reader(&paths.index_db).await?;
    let record = get::get_event(&index, &paths.log, id).await;
    index.close().await;
    record
}

pub async fn artifacts(config: &Config, limit: i64) -> Result<Vec<ArtifactEntry>> {
    let paths = paths(config);
    if !paths.index_db.exists() {
        return Ok(Vec::new());
    }
    let index = IndexStore::open_reader(&paths.index_db).await?;
    let entries = artifact::list_artifacts(&index, limit).await;
    index.close().await;
    entries
}

pub async fn list_jobs(config: &Config) -> Result<Vec<Job>> {
    let paths = paths(config);
    if !paths.state_db.exists() {
        return Ok(Vec::new());
    }
    let store = JobStore::open_reader(&paths.state_db).await?;
    let jobs = store.list_jobs().await;
    store.close().await;
    jobs
}

pub async fn list_runs(config: &Config, name: &str, limit: i64) -> Result<Vec<JobRun>> {
    let paths = paths(config);
    if !paths.state_db.exists() {
        return Ok(Vec::new());
    }
    let store = JobStore::open_reader(&paths.state_db).await?;
    let runs = store.list_runs(name, limit).await;
    store.close().await;
    runs
}

pub async fn get_job(config: &Config, name: &str) -> Result<Job> {
    let paths = paths(config);
    let missing = || OpsError::NotFound(format!("job '{}'", name));
    if !paths.state_db.exists() {
        return Err(missing());
    }
    let store = JobStore::open_reader(&paths.state_db).await?;
    let job = store.get_job(name).await;
    store.close().await;
    job?.ok_or_else(missing)
}
