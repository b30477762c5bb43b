//! Job executor.
//!
//! A job is a named instance of a registered kind plus a JSON config. Running
//! a job records a [`JobRun`] in the state store, dispatches to the kind's
//! [`JobHandler`] with the workspace held for writing, and records the
//! terminal status. Handlers that produce files write them with
//! [`artifact::write_atomic`] and then append one `artifact.created` event
//! through the ordinary ingest pipeline, so a failed run never leaves an
//! event pointing at a missing or partial file.
//!
//! Built-in kinds: `index_rebuild`, `daily_digest` and `artifact_pack`. A kind
//! can also run once without a stored job through [`run_adhoc`]; the run is
//! then recorded under the kind's name.

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact::{self, ArtifactFile};
use crate::db;
use crate::error::{ErrorDetail, OpsError, Result};
use crate::ingest;
use crate::migrate;
use crate::models::{Digest, EventRecord, EventRef, RawRecord, RecordOutcome, ARTIFACT_CREATED};
use crate::search::{SearchHit, SearchQuery, MAX_LIMIT};
use crate::workspace::Workspace;

// ═══════════════════════════════════════════════════════════════════════
// Jobs and runs
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub kind: String,
    pub config: Value,
    pub enabled: bool,
    pub created_at: String,
}

/// Request body for creating or replacing a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "succeeded" => RunStatus::Succeeded,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub job_name: String,
    pub kind: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub artifacts: Vec<ArtifactFile>,
    pub event_ids: Vec<i64>,
    pub output: Option<Value>,
    pub error: Option<ErrorDetail>,
}

/// What a handler hands back on success.
#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub output: Value,
    pub artifacts: Vec<ArtifactFile>,
    pub event_ids: Vec<i64>,
}

// ═══════════════════════════════════════════════════════════════════════
// State store
// ═══════════════════════════════════════════════════════════════════════

/// Job definitions and run history. Not derived from the canonical log and
/// never touched by index rebuilds.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await.map_err(OpsError::State)?;
        migrate::run_state_migrations(&pool)
            .await
            .map_err(OpsError::State)?;
        Ok(Self { pool })
    }

    pub async fn open_reader(path: &Path) -> Result<Self> {
        let pool = db::connect_read_only(path).await.map_err(OpsError::State)?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn upsert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (name, kind, config_json, enabled, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                kind = excluded.kind,
                config_json = excluded.config_json,
                enabled = excluded.enabled
            "#,
        )
        .bind(&job.name)
        .bind(&job.kind)
        .bind(job.config.to_string())
        .bind(job.enabled)
        .bind(&job.created_at)
        .execute(&self.pool)
        .await
        .map_err(OpsError::State)?;
        Ok(())
    }

    pub async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT name, kind, config_json, enabled, created_at FROM jobs WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(OpsError::State)?;

        row.map(|row| job_from_row(&row)).transpose()
    }

    /// Removes a job definition. Its run history stays. Returns `false` when
    /// no job had that name.
    pub async fn delete_job(&self, name: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM jobs WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(OpsError::State)?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT name, kind, config_json, enabled, created_at FROM jobs ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(OpsError::State)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn insert_run(&self, run: &JobRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_runs (id, job_name, kind, started_at, status) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.job_name)
        .bind(&run.kind)
        .bind(&run.started_at)
        .bind(run.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(OpsError::State)?;
        Ok(())
    }

    async fn finish_run(&self, run: &JobRun) -> Result<()> {
        let error = run.error.as_ref().map(serde_json::to_string).transpose()?;
        let output = run.output.as_ref().map(|v| v.to_string());
        sqlx::query(
            r#"
            UPDATE job_runs SET
                finished_at = ?, status = ?, artifacts_json = ?, event_ids_json = ?,
                output_json = ?, error = ?
            WHERE id = ?
            "#,
        )
        .bind(&run.finished_at)
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.artifacts)?)
        .bind(serde_json::to_string(&run.event_ids)?)
        .bind(output)
        .bind(error)
        .bind(&run.id)
        .execute(&self.pool)
        .await
        .map_err(OpsError::State)?;
        Ok(())
    }

    /// Most recent first.
    pub async fn list_runs(&self, job_name: &str, limit: i64) -> Result<Vec<JobRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_name, kind, started_at, finished_at, status,
                   artifacts_json, event_ids_json, output_json, error
            FROM job_runs WHERE job_name = ?
            ORDER BY started_at DESC, rowid DESC LIMIT ?
            "#,
        )
        .bind(job_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(OpsError::State)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let output: Option<String> = row.get("output_json");
            let error: Option<String> = row.get("error");
            runs.push(JobRun {
                id: row.get("id"),
                job_name: row.get("job_name"),
                kind: row.get("kind"),
                started_at: row.get("started_at"),
                finished_at: row.get("finished_at"),
                status: RunStatus::parse(row.get("status")),
                artifacts: serde_json::from_str(row.get("artifacts_json"))?,
                event_ids: serde_json::from_str(row.get("event_ids_json"))?,
                output: output.map(|o| serde_json::from_str(&o)).transpose()?,
                error: error.map(|e| serde_json::from_str(&e)).transpose()?,
            });
        }
        Ok(runs)
    }
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    Ok(Job {
        name: row.get("name"),
        kind: row.get("kind"),
        config: serde_json::from_str(row.get("config_json"))?,
        enabled: row.get("enabled"),
        created_at: row.get("created_at"),
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Handler trait and registry
// ═══════════════════════════════════════════════════════════════════════

/// Context passed to a handler for one run.
pub struct JobContext {
    pub job: Job,
    pub run_id: String,
}

/// A job kind.
///
/// Adding a kind means implementing this trait and registering the handler
/// with [`JobRegistry::register`].
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> &str;

    /// Checks a config and fills in defaults. The returned value is what gets
    /// stored with the job.
    fn validate(&self, config: &Value) -> Result<Value>;

    /// Runs with the workspace held for writing.
    async fn run(&self, ws: &mut Workspace, ctx: &JobContext) -> Result<JobOutput>;
}

pub struct JobRegistry {
    handlers: Vec<Box<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Registry with `index_rebuild`, `daily_digest` and `artifact_pack`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(IndexRebuildJob));
        registry.register(Box::new(DailyDigestJob));
        registry.register(Box::new(ArtifactPackJob));
        registry
    }

    /// Later registrations for the same kind replace earlier ones.
    pub fn register(&mut self, handler: Box<dyn JobHandler>) {
        self.handlers.retain(|h| h.kind() != handler.kind());
        self.handlers.push(handler);
    }

    pub fn find(&self, kind: &str) -> Option<&dyn JobHandler> {
        self.handlers
            .iter()
            .find(|h| h.kind() == kind)
            .map(|h| h.as_ref())
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.kind()).collect()
    }

    fn require(&self, kind: &str) -> Result<&dyn JobHandler> {
        self.find(kind).ok_or_else(|| {
            OpsError::InvalidArgument(format!(
                "unknown job kind '{}', available: {}",
                kind,
                self.kinds().join(", ")
            ))
        })
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Operations
// ═══════════════════════════════════════════════════════════════════════

fn now(ws: &Workspace) -> String {
    Utc::now().with_timezone(&ws.timezone()).to_rfc3339()
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(OpsError::InvalidArgument(format!(
            "job name must be 1-64 chars of [A-Za-z0-9_.-], got '{}'",
            name
        )))
    }
}

/// Creates or replaces a job after validating its config with the kind's
/// handler.
pub async fn add_job(ws: &Workspace, registry: &JobRegistry, new: NewJob) -> Result<Job> {
    validate_name(&new.name)?;
    let config = registry.require(&new.kind)?.validate(&new.config)?;

    let created_at = match ws.jobs().get_job(&new.name).await? {
        Some(existing) => existing.created_at,
        None => now(ws),
    };
    let job = Job {
        name: new.name,
        kind: new.kind,
        config,
        enabled: new.enabled,
        created_at,
    };
    ws.jobs().upsert_job(&job).await?;
    info!(job = %job.name, kind = %job.kind, "job saved");
    Ok(job)
}

pub async fn delete_job(ws: &Workspace, name: &str) -> Result<()> {
    if !ws.jobs().delete_job(name).await? {
        return Err(OpsError::NotFound(format!("job '{}'", name)));
    }
    info!(job = %name, "job deleted");
    Ok(())
}

/// Runs a job to completion and returns the recorded run.
///
/// Handler failures do not make this return `Err`: they are recorded on the
/// run as status `failed` with the error detail. `Err` means the run could
/// not be started or recorded at all.
pub async fn run_job(ws: &mut Workspace, registry: &JobRegistry, name: &str) -> Result<JobRun> {
    let job = ws
        .jobs()
        .get_job(name)
        .await?
        .ok_or_else(|| OpsError::NotFound(format!("job '{}'", name)))?;
    if !job.enabled {
        return Err(OpsError::InvalidArgument(format!("job '{}' is disabled", name)));
    }
    let handler = registry.require(&job.kind)?;
    execute(ws, handler, job).await
}

/// Runs a kind once with the given config, without storing a job. The run
/// is recorded with the kind as its job name.
pub async fn run_adhoc(
    ws: &mut Workspace,
    registry: &JobRegistry,
    kind: &str,
    config: &Value,
) -> Result<JobRun> {
    let handler = registry.require(kind)?;
    let job = Job {
        name: kind.to_string(),
        kind: kind.to_string(),
        config: handler.validate(config)?,
        enabled: true,
        created_at: now(ws),
    };
    execute(ws, handler, job).await
}

async fn execute(ws: &mut Workspace, handler: &dyn JobHandler, job: Job) -> Result<JobRun> {
    let mut run = JobRun {
        id: Uuid::new_v4().to_string(),
        job_name: job.name.clone(),
        kind: job.kind.clone(),
        started_at: now(ws),
        finished_at: None,
        status: RunStatus::Running,
        artifacts: Vec::new(),
        event_ids: Vec::new(),
        output: None,
        error: None,
    };
    ws.jobs().insert_run(&run).await?;
    info!(job = %run.job_name, kind = %run.kind, run_id = %run.id, "job started");

    let ctx = JobContext {
        job,
        run_id: run.id.clone(),
    };
    match handler.run(ws, &ctx).await {
        Ok(out) => {
            run.status = RunStatus::Succeeded;
            run.output = Some(out.output);
            run.artifacts = out.artifacts;
            run.event_ids = out.event_ids;
        }
        Err(e) => {
            warn!(job = %run.job_name, run_id = %run.id, error = %e, "job failed");
            run.status = RunStatus::Failed;
            run.error = Some(e.to_detail());
        }
    }
    run.finished_at = Some(now(ws));
    ws.jobs().finish_run(&run).await?;

    info!(
        job = %run.job_name,
        run_id = %run.id,
        status = run.status.as_str(),
        "job finished"
    );
    Ok(run)
}

/// Path of an artifact relative to the workspace root, with `/` separators.
fn relative_path(ws: &Workspace, path: &Path) -> String {
    path.strip_prefix(&ws.paths().root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Appends the `artifact.created` event for one file, which must already be
/// written in full.
async fn record_artifact(
    ws: &mut Workspace,
    ctx: &JobContext,
    file: &ArtifactFile,
    tags: Vec<String>,
    text: String,
    extra: Value,
) -> Result<i64> {
    let mut record = RawRecord::new(ARTIFACT_CREATED, "job");
    record.source_locator = Some(ctx.job.name.clone());
    record.refs = vec![EventRef {
        kind: "file".to_string(),
        uri: format!("file:{}", file.path.display()),
        span: None,
        digest: Some(Digest::sha256(file.sha256.clone())),
    }];
    record.tags = tags;
    record.text = text;
    let mut content = json!({
        "path": relative_path(ws, &file.path),
        "job": ctx.job.name,
        "run_id": ctx.run_id,
        "kind": ctx.job.kind,
        "sha256": file.sha256,
        "bytes": file.bytes,
    });
    if let (Some(content), Value::Object(extra)) = (content.as_object_mut(), extra) {
        content.extend(extra);
    }
    record.content = content;

    let result = ingest::ingest_batch(ws, vec![record]).await;
    match result.results.into_iter().next() {
        Some(RecordOutcome::New { id, .. }) => Ok(id),
        Some(RecordOutcome::Skipped { existing_id, .. }) => Ok(existing_id),
        // Appended; only the index is behind.
        Some(RecordOutcome::Failed {
            id: Some(id),
            error,
            ..
        }) => {
            warn!(id, code = %error.code, "artifact event appended but not indexed");
            Ok(id)
        }
        Some(RecordOutcome::Failed { error, .. }) => Err(OpsError::JobExecution(format!(
            "artifact written but its event was not recorded: {}",
            error.message
        ))),
        None => Err(OpsError::JobExecution(
            "artifact event was not recorded".into(),
        )),
    }
}

/// `out_dir` values must stay inside `<workspace>/artifacts`.
fn check_out_dir(out_dir: &str) -> Result<()> {
    let ok = !out_dir.is_empty()
        && Path::new(out_dir)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(OpsError::InvalidArgument(format!(
            "out_dir must be a relative path inside the artifacts directory, got '{}'",
            out_dir
        )))
    }
}

fn check_limit(limit: i64) -> Result<()> {
    if (1..=MAX_LIMIT).contains(&limit) {
        Ok(())
    } else {
        Err(OpsError::InvalidArgument(format!(
            "limit must be in [1, {}]",
            MAX_LIMIT
        )))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// index_rebuild
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRebuildConfig {
    #[serde(default = "default_wipe")]
    pub wipe: bool,
}

fn default_wipe() -> bool {
    true
}

fn parse_config<T: serde::de::DeserializeOwned>(kind: &str, config: &Value) -> Result<T> {
    let config = match config {
        Value::Null => json!({}),
        other => other.clone(),
    };
    serde_json::from_value(config)
        .map_err(|e| OpsError::InvalidArgument(format!("invalid {} config: {}", kind, e)))
}

pub struct IndexRebuildJob;

#[async_trait]
impl JobHandler for IndexRebuildJob {
    fn kind(&self) -> &str {
        "index_rebuild"
    }

    fn validate(&self, config: &Value) -> Result<Value> {
        let config: IndexRebuildConfig = parse_config(self.kind(), config)?;
        Ok(serde_json::to_value(config)?)
    }

    async fn run(&self, ws: &mut Workspace, ctx: &JobContext) -> Result<JobOutput> {
        let config: IndexRebuildConfig = parse_config(self.kind(), &ctx.job.config)?;
        let report = ws.rebuild(config.wipe).await?;
        Ok(JobOutput {
            output: serde_json::to_value(report)?,
            ..Default::default()
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// daily_digest
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyDigestConfig {
    /// `YYYY-MM-DD`; today in the workspace timezone when absent.
    #[serde(default)]
    pub day: Option<String>,
    /// Relative to `<workspace>/artifacts`.
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_digest_limit")]
    pub limit: i64,
}

fn default_out_dir() -> String {
    "digests".to_string()
}

fn default_digest_limit() -> i64 {
    500
}

impl DailyDigestConfig {
    fn check(&self) -> Result<()> {
        if let Some(day) = &self.day {
            parse_day(day)?;
        }
        check_out_dir(&self.out_dir)?;
        check_limit(self.limit)
    }
}

fn parse_day(day: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|_| OpsError::InvalidArgument(format!("day must be YYYY-MM-DD, got '{}'", day)))
}

pub struct DailyDigestJob;

#[async_trait]
impl JobHandler for DailyDigestJob {
    fn kind(&self) -> &str {
        "daily_digest"
    }

    fn validate(&self, config: &Value) -> Result<Value> {
        let config: DailyDigestConfig = parse_config(self.kind(), config)?;
        config.check()?;
        Ok(serde_json::to_value(config)?)
    }

    async fn run(&self, ws: &mut Workspace, ctx: &JobContext) -> Result<JobOutput> {
        let config: DailyDigestConfig = parse_config(self.kind(), &ctx.job.config)?;
        config.check()?;

        let tz = ws.timezone();
        let day = match &config.day {
            Some(day) => parse_day(day)?,
            None => Utc::now().with_timezone(&tz).date_naive(),
        };
        let window = |h, m, s, ms| {
            day.and_hms_milli_opt(h, m, s, ms)
                .and_then(|naive| tz.from_local_datetime(&naive).single())
                .map(|ts| ts.to_rfc3339())
                .ok_or_else(|| OpsError::JobExecution(format!("no local time for {}", day)))
        };

        // Earlier artifact events are filtered in SQL so they never take a
        // slot under the limit.
        let query = SearchQuery {
            q: None,
            types: config.types.clone(),
            exclude_types: vec![ARTIFACT_CREATED.to_string()],
            tags: config.tags.clone(),
            source_name: None,
            after: Some(window(0, 0, 0, 0)?),
            before: Some(window(23, 59, 59, 999)?),
            limit: Some(config.limit),
        };
        let hits: Vec<SearchHit> = ws.search(&query).await?;

        let markdown = render_digest(&day.to_string(), &tz.to_string(), &hits);
        let out_dir = ws.paths().artifacts.join(&config.out_dir);
        // One file per run; reruns for the same day never replace a file an
        // earlier event points at.
        let file_name = format!("{}-{}-{}.md", self.kind(), day, ctx.run_id);
        let file = artifact::write_atomic(&out_dir, &file_name, markdown.as_bytes())?;
        let relative = relative_path(ws, &file.path);

        let event_id = record_artifact(
            ws,
            ctx,
            &file,
            vec!["artifact".to_string(), self.kind().to_string()],
            format!("{} {} written to {}", self.kind(), day, relative),
            Value::Null,
        )
        .await?;

        Ok(JobOutput {
            output: json!({
                "day": day.to_string(),
                "events": hits.len(),
                "path": relative,
            }),
            artifacts: vec![file],
            event_ids: vec![event_id],
        })
    }
}

fn render_digest(day: &str, tz: &str, hits: &[SearchHit]) -> String {
    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    let mut by_tag: BTreeMap<&str, usize> = BTreeMap::new();
    for hit in hits {
        *by_type.entry(hit.event_type.as_str()).or_default() += 1;
        for tag in &hit.tags {
            *by_tag.entry(tag.as_str()).or_default() += 1;
        }
    }
    let mut top_tags: Vec<(&str, usize)> = by_tag.into_iter().collect();
    top_tags.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    top_tags.truncate(10);

    let mut out = format!("# Daily Digest {}\n\n", day);
    out.push_str(&format!("- timezone: {}\n- events: {}\n\n", tz, hits.len()));

    out.push_str("## Counts by type\n\n");
    if by_type.is_empty() {
        out.push_str("_none_\n");
    }
    for (event_type, count) in &by_type {
        out.push_str(&format!("- {}: {}\n", event_type, count));
    }

    out.push_str("\n## Top tags\n\n");
    if top_tags.is_empty() {
        out.push_str("_none_\n");
    }
    for (tag, count) in &top_tags {
        out.push_str(&format!("- {}: {}\n", tag, count));
    }

    out.push_str("\n## Sample snippets\n\n");
    if hits.is_empty() {
        out.push_str("_none_\n");
    }
    for hit in hits.iter().take(10) {
        out.push_str(&format!(
            "- #{} `{}` {}: {}\n",
            hit.id,
            hit.event_type,
            hit.ts,
            hit.snippet.replace('\n', " ")
        ));
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
// artifact_pack
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactPackConfig {
    pub tag: String,
    /// Relative to `<workspace>/artifacts`. Each run writes its own
    /// `pack-<run_id>` directory under it.
    #[serde(default = "default_pack_dir")]
    pub out_dir: String,
    #[serde(default = "default_digest_limit")]
    pub limit: i64,
}

fn default_pack_dir() -> String {
    "packs".to_string()
}

impl ArtifactPackConfig {
    fn check(&self) -> Result<()> {
        if self.tag.trim().is_empty() {
            return Err(OpsError::InvalidArgument(
                "artifact_pack needs a non-empty tag".into(),
            ));
        }
        check_out_dir(&self.out_dir)?;
        check_limit(self.limit)
    }
}

/// Bundles every event carrying one tag into `pack.json` plus a `README.md`
/// index, and copies the files that tagged `artifact.created` events point
/// at into `assets/`. Every file is written before any event, then each gets
/// its own `artifact.created` event.
pub struct ArtifactPackJob;

#[async_trait]
impl JobHandler for ArtifactPackJob {
    fn kind(&self) -> &str {
        "artifact_pack"
    }

    fn validate(&self, config: &Value) -> Result<Value> {
        let config: ArtifactPackConfig = parse_config(self.kind(), config)?;
        config.check()?;
        Ok(serde_json::to_value(config)?)
    }

    async fn run(&self, ws: &mut Workspace, ctx: &JobContext) -> Result<JobOutput> {
        let config: ArtifactPackConfig = parse_config(self.kind(), &ctx.job.config)?;
        config.check()?;

        let query = SearchQuery {
            tags: vec![config.tag.clone()],
            limit: Some(config.limit),
            ..Default::default()
        };
        let mut items = Vec::new();
        for hit in ws.search(&query).await? {
            items.push(ws.show(hit.id).await?);
        }

        let dir = ws
            .paths()
            .artifacts
            .join(&config.out_dir)
            .join(format!("pack-{}", ctx.run_id));
        let assets = copy_assets(&dir.join("assets"), &items)?;
        let asset_paths: Vec<String> = assets.iter().map(|a| relative_path(ws, &a.path)).collect();

        let pack = json!({
            "tag": config.tag,
            "items": items,
            "assets": asset_paths,
        });
        let pack_file = artifact::write_atomic(
            &dir,
            "pack.json",
            serde_json::to_string_pretty(&pack)?.as_bytes(),
        )?;
        let readme = artifact::write_atomic(
            &dir,
            "README.md",
            render_pack_readme(&config.tag, &items).as_bytes(),
        )?;

        let mut artifacts = vec![pack_file, readme];
        artifacts.extend(assets);
        let mut event_ids = Vec::with_capacity(artifacts.len());
        for file in &artifacts {
            let text = format!(
                "artifact pack for tag {} wrote {}",
                config.tag,
                relative_path(ws, &file.path)
            );
            let id = record_artifact(
                ws,
                ctx,
                file,
                vec![config.tag.clone(), "artifact-pack".to_string()],
                text,
                json!({ "tag": config.tag }),
            )
            .await?;
            event_ids.push(id);
        }

        Ok(JobOutput {
            output: json!({
                "tag": config.tag,
                "items": items.len(),
                "assets": asset_paths.len(),
                "dir": relative_path(ws, &dir),
            }),
            artifacts,
            event_ids,
        })
    }
}

/// Copies the files referenced by `artifact.created` events. Missing files
/// are skipped.
fn copy_assets(dir: &Path, items: &[EventRecord]) -> Result<Vec<ArtifactFile>> {
    let mut seen = BTreeSet::new();
    let mut copied = Vec::new();
    for item in items.iter().filter(|r| r.event_type == ARTIFACT_CREATED) {
        for reference in &item.refs {
            let Some(source) = reference.uri.strip_prefix("file:").map(Path::new) else {
                continue;
            };
            let bytes = match std::fs::read(source) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %source.display(), error = %e, "pack asset unreadable, skipped");
                    continue;
                }
            };
            let Some(name) = source.file_name() else {
                continue;
            };
            let hash = crate::dedupe::sha256_hex(&bytes);
            let name = format!("{}_{}", &hash[..12], name.to_string_lossy());
            if seen.insert(name.clone()) {
                copied.push(artifact::write_atomic(dir, &name, &bytes)?);
            }
        }
    }
    Ok(copied)
}

fn render_pack_readme(tag: &str, items: &[EventRecord]) -> String {
    let mut out = format!("# Artifact Pack {}\n\nTotal items: {}\n\n", tag, items.len());
    for item in items.iter().take(20) {
        out.push_str(&format!(
            "- {} {} {}\n",
            item.id,
            item.event_type,
            item.ts.to_rfc3339()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dedupe::sha256_hex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(root: &Path) -> Config {
        toml::from_str(&format!(
            "[workspace]\nroot = \"{}\"\ntimezone = \"+09:00\"\n",
            root.display()
        ))
        .unwrap()
    }

    async fn workspace(tmp: &TempDir) -> Workspace {
        Workspace::open(&config(tmp.path()), Duration::ZERO).await.unwrap()
    }

    fn message(text: &str, ts: &str, tags: &[&str]) -> RawRecord {
        let mut raw = RawRecord::new("chat.message", "chat_json");
        raw.text = text.to_string();
        raw.ts = Some(ts.to_string());
        raw.tags = tags.iter().map(|t| t.to_string()).collect();
        raw
    }

    fn artifact_events(ws: &Workspace) -> Vec<EventRecord> {
        ws.log
            .read_from(0)
            .unwrap()
            .map(|e| e.unwrap().record)
            .filter(|r| r.event_type == ARTIFACT_CREATED)
            .collect()
    }

    fn digest_job(name: &str, config: Value) -> NewJob {
        NewJob {
            name: name.to_string(),
            kind: "daily_digest".to_string(),
            config,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_add_job_validates_and_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        let ws = workspace(&tmp).await;
        let registry = JobRegistry::with_builtins();

        let job = add_job(&ws, &registry, digest_job("digest", json!({"day": "2026-01-21"})))
            .await
            .unwrap();
        assert_eq!(job.config["out_dir"], "digests");
        assert_eq!(job.config["limit"], 500);

        let bad = add_job(&ws, &registry, digest_job("d2", json!({"out_dir": "../escape"}))).await;
        assert!(matches!(bad, Err(OpsError::InvalidArgument(_))));

        let mut unknown = digest_job("x", json!({}));
        unknown.kind = "nope".into();
        assert!(add_job(&ws, &registry, unknown).await.is_err());
        assert!(add_job(&ws, &registry, digest_job("bad name", json!({}))).await.is_err());

        assert_eq!(ws.jobs().list_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_daily_digest_emits_one_artifact_event() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        let registry = JobRegistry::with_builtins();

        ingest::ingest_batch(
            &mut ws,
            vec![
                message("deploy finished", "2026-01-21T09:00:00+09:00", &["ops"]),
                message("standup notes", "2026-01-21T23:30:00+09:00", &["team", "ops"]),
                message("next day", "2026-01-22T00:00:01+09:00", &["ops"]),
            ],
        )
        .await;

        add_job(&ws, &registry, digest_job("digest", json!({"day": "2026-01-21"})))
            .await
            .unwrap();
        let run = run_job(&mut ws, &registry, "digest").await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.event_ids.len(), 1);
        assert_eq!(run.output.as_ref().unwrap()["events"], 2);

        let events = artifact_events(&ws);
        assert_eq!(events.len(), 1);
        let path = ws.paths().root.join(events[0].content["path"].as_str().unwrap());
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Daily Digest 2026-01-21"));
        assert!(body.contains("- chat.message: 2"));
        assert!(body.contains("- ops: 2"));
        assert!(!body.contains("next day"));
        assert_eq!(events[0].content["sha256"], sha256_hex(body.as_bytes()));
        assert_eq!(events[0].id, run.event_ids[0]);

        let runs = ws.jobs().list_runs("digest", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0], run);

        let listed = artifact::list_artifacts(ws.index(), 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, "markdown");
    }

    #[tokio::test]
    async fn test_digest_reruns_keep_earlier_files() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        let registry = JobRegistry::with_builtins();

        ingest::ingest_batch(
            &mut ws,
            vec![message("first", "2026-01-21T09:00:00+09:00", &[])],
        )
        .await;
        add_job(&ws, &registry, digest_job("digest", json!({"day": "2026-01-21"})))
            .await
            .unwrap();
        let first = run_job(&mut ws, &registry, "digest").await.unwrap();

        ingest::ingest_batch(
            &mut ws,
            vec![message("second", "2026-01-21T10:00:00+09:00", &[])],
        )
        .await;
        let second = run_job(&mut ws, &registry, "digest").await.unwrap();

        assert_ne!(first.artifacts[0].path, second.artifacts[0].path);
        let events = artifact_events(&ws);
        assert_eq!(events.len(), 2);
        for (event, run) in events.iter().zip([&first, &second]) {
            let path = ws.paths().root.join(event.content["path"].as_str().unwrap());
            assert_eq!(path, run.artifacts[0].path);
            let body = std::fs::read(&path).unwrap();
            assert_eq!(event.content["sha256"], sha256_hex(&body));
            assert_eq!(event.content["run_id"], run.id.as_str());
        }
    }

    #[tokio::test]
    async fn test_digest_limit_ignores_artifact_events() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        let registry = JobRegistry::with_builtins();

        let mut batch = Vec::new();
        for i in 0..3 {
            let mut earlier = message(
                &format!("old artifact {}", i),
                "2026-01-21T08:00:00+09:00",
                &[],
            );
            earlier.event_type = ARTIFACT_CREATED.to_string();
            batch.push(earlier);
        }
        batch.push(message("real one", "2026-01-21T12:00:00+09:00", &[]));
        batch.push(message("real two", "2026-01-21T13:00:00+09:00", &[]));
        ingest::ingest_batch(&mut ws, batch).await;

        add_job(
            &ws,
            &registry,
            digest_job("digest", json!({"day": "2026-01-21", "limit": 2})),
        )
        .await
        .unwrap();
        let run = run_job(&mut ws, &registry, "digest").await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.output.as_ref().unwrap()["events"], 2);

        let body = std::fs::read_to_string(&run.artifacts[0].path).unwrap();
        assert!(body.contains("- chat.message: 2"));
        assert!(!body.contains(ARTIFACT_CREATED));
    }

    #[tokio::test]
    async fn test_artifact_pack_bundles_tagged_events() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        let registry = JobRegistry::with_builtins();

        ingest::ingest_batch(
            &mut ws,
            vec![
                message("incident opened", "2026-01-21T09:00:00+09:00", &["inc-7"]),
                message("unrelated", "2026-01-21T09:05:00+09:00", &["misc"]),
                message("incident closed", "2026-01-21T11:00:00+09:00", &["inc-7", "ops"]),
            ],
        )
        .await;
        add_job(&ws, &registry, digest_job("digest", json!({"day": "2026-01-21"})))
            .await
            .unwrap();
        let digest = run_job(&mut ws, &registry, "digest").await.unwrap();
        // Tag the digest event so the pack picks up its file as an asset.
        let mut tagged = ws.show(digest.event_ids[0]).await.unwrap();
        let mut asset_event = RawRecord::new(ARTIFACT_CREATED, "job");
        asset_event.tags = vec!["inc-7".into()];
        asset_event.refs = std::mem::take(&mut tagged.refs);
        asset_event.text = "digest for the incident".into();
        ingest::ingest_batch(&mut ws, vec![asset_event]).await;

        let run = run_adhoc(&mut ws, &registry, "artifact_pack", &json!({"tag": "inc-7"}))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.job_name, "artifact_pack");
        let output = run.output.as_ref().unwrap();
        assert_eq!(output["items"], 3);
        assert_eq!(output["assets"], 1);

        let pack: Value =
            serde_json::from_slice(&std::fs::read(&run.artifacts[0].path).unwrap()).unwrap();
        assert_eq!(pack["tag"], "inc-7");
        assert_eq!(pack["items"].as_array().unwrap().len(), 3);
        let asset = ws.paths().root.join(pack["assets"][0].as_str().unwrap());
        assert_eq!(
            std::fs::read(asset).unwrap(),
            std::fs::read(&digest.artifacts[0].path).unwrap()
        );

        let readme = std::fs::read_to_string(&run.artifacts[1].path).unwrap();
        assert!(readme.starts_with("# Artifact Pack inc-7\n\nTotal items: 3\n"));

        // One event per written file: pack.json, README.md and the asset.
        assert_eq!(run.artifacts.len(), 3);
        assert_eq!(run.event_ids.len(), 3);
        let events = artifact_events(&ws);
        let pack_events = &events[events.len() - 3..];
        for ((event, id), file) in pack_events.iter().zip(&run.event_ids).zip(&run.artifacts) {
            assert_eq!(event.id, *id);
            assert_eq!(event.refs.len(), 1);
            assert_eq!(event.tags, vec!["artifact-pack", "inc-7"]);
            assert_eq!(event.content["tag"], "inc-7");
            assert_eq!(event.content["sha256"], file.sha256.as_str());
            assert_eq!(ws.paths().root.join(event.content["path"].as_str().unwrap()), file.path);
        }

        let runs = ws.jobs().list_runs("artifact_pack", 5).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_artifact_pack_needs_tag() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        let registry = JobRegistry::with_builtins();

        let err = run_adhoc(&mut ws, &registry, "artifact_pack", &json!({"tag": " "}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        let err = run_adhoc(&mut ws, &registry, "artifact_pack", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert!(ws.jobs().list_runs("artifact_pack", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_job_keeps_history() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        let registry = JobRegistry::with_builtins();

        add_job(&ws, &registry, digest_job("digest", json!({"day": "2026-01-21"})))
            .await
            .unwrap();
        run_job(&mut ws, &registry, "digest").await.unwrap();

        delete_job(&ws, "digest").await.unwrap();
        assert!(ws.jobs().get_job("digest").await.unwrap().is_none());
        assert!(matches!(
            delete_job(&ws, "digest").await,
            Err(OpsError::NotFound(_))
        ));
        assert_eq!(ws.jobs().list_runs("digest", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_render_emits_no_event() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        let registry = JobRegistry::with_builtins();

        std::fs::write(ws.paths().artifacts.join("blocked"), "a file, not a dir").unwrap();
        add_job(
            &ws,
            &registry,
            digest_job("digest", json!({"day": "2026-01-21", "out_dir": "blocked"})),
        )
        .await
        .unwrap();

        let run = run_job(&mut ws, &registry, "digest").await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_ref().unwrap().code, "artifact_write");
        assert!(run.event_ids.is_empty());
        assert!(artifact_events(&ws).is_empty());
        assert_eq!(ws.canonical_len(), 0);
    }

    #[tokio::test]
    async fn test_index_rebuild_job() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        let registry = JobRegistry::with_builtins();

        ingest::ingest_batch(
            &mut ws,
            vec![message("a", "2026-01-21T09:00:00+09:00", &[])],
        )
        .await;
        add_job(
            &ws,
            &registry,
            NewJob {
                name: "rebuild".into(),
                kind: "index_rebuild".into(),
                config: Value::Null,
                enabled: true,
            },
        )
        .await
        .unwrap();

        let run = run_job(&mut ws, &registry, "rebuild").await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        let output = run.output.unwrap();
        assert_eq!(output["wiped"], true);
        assert_eq!(output["indexed"], 1);
    }

    #[tokio::test]
    async fn test_disabled_and_missing_jobs() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        let registry = JobRegistry::with_builtins();

        let mut job = digest_job("off", json!({}));
        job.enabled = false;
        add_job(&ws, &registry, job).await.unwrap();

        assert!(matches!(
            run_job(&mut ws, &registry, "off").await,
            Err(OpsError::InvalidArgument(_))
        ));
        assert!(matches!(
            run_job(&mut ws, &registry, "ghost").await,
            Err(OpsError::NotFound(_))
        ));
    }

    #[test]
    fn test_render_digest_sections() {
        let hits = vec![SearchHit {
            id: 4,
            ts: "2026-01-21T10:00:00+09:00".into(),
            event_type: "note".into(),
            tags: vec!["x".into()],
            source_name: "cli".into(),
            score: 0.0,
            snippet: "line one\nline two".into(),
        }];
        let md = render_digest("2026-01-21", "+09:00", &hits);
        assert!(md.contains("## Counts by type\n\n- note: 1\n"));
        assert!(md.contains("## Top tags\n\n- x: 1\n"));
        assert!(md.contains("- #4 `note` 2026-01-21T10:00:00+09:00: line one line two\n"));

        let empty = render_digest("2026-01-21", "UTC", &[]);
        assert!(empty.contains("- events: 0"));
    }
}
