use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use opslog::client::DaemonClient;
use opslog::config::{self, Config};
use opslog::error::OpsError;
use opslog::fallback;
use opslog::jobs::{ArtifactPackConfig, JobRegistry, NewJob, RunStatus};
use opslog::models::{RecordOutcome, ARTIFACT_CREATED};
use opslog::search::SearchQuery;
use opslog::server::Daemon;

fn setup_test_env() -> (TempDir, Config) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("ws");
    let config_path = tmp.path().join("ops.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"[workspace]
root = "{}"
timezone = "UTC"

[daemon]
bind = "127.0.0.1:0"

[client]
timeout_ms = 5000
lock_timeout_ms = 200
"#,
            root.display()
        ),
    )
    .unwrap();
    let config = config::load_config(&config_path).unwrap();
    (tmp, config)
}

struct Running {
    client: DaemonClient,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<opslog::error::Result<()>>,
}

impl Running {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        self.handle.await.unwrap().unwrap();
    }
}

async fn start(config: &Config) -> Running {
    let daemon = Daemon::start(config).await.unwrap();
    let addr = daemon.local_addr();
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(daemon.serve(async move {
        let _ = rx.await;
    }));

    let client = DaemonClient::new(&format!("http://{}", addr), Duration::from_secs(5)).unwrap();
    for _ in 0..50 {
        if client.health().await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Running {
        client,
        shutdown: tx,
        handle,
    }
}

fn event(text: &str, ts: &str) -> Value {
    json!({
        "type": "chat.message",
        "source_name": "slack",
        "source_locator": "C01",
        "ts": ts,
        "tags": ["team"],
        "text": text,
    })
}

fn three_events() -> Vec<Value> {
    vec![
        event("alpha deploy started", "2026-01-21T09:00:00Z"),
        event("beta rollback finished", "2026-01-21T10:00:00Z"),
        event("gamma deploy verified", "2026-01-21T11:00:00Z"),
    ]
}

fn log_path(config: &Config) -> PathBuf {
    config.workspace.root.join("canonical").join("events.jsonl")
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn new_ids(outcomes: &[RecordOutcome]) -> Vec<i64> {
    outcomes
        .iter()
        .map(|o| match o {
            RecordOutcome::New { id, .. } => *id,
            other => panic!("expected new, got {:?}", other),
        })
        .collect()
}

fn skipped_ids(outcomes: &[RecordOutcome]) -> Vec<i64> {
    outcomes
        .iter()
        .map(|o| match o {
            RecordOutcome::Skipped { existing_id, .. } => *existing_id,
            other => panic!("expected skipped, got {:?}", other),
        })
        .collect()
}

#[tokio::test]
async fn test_health_reports_workspace() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;

    let health = daemon.client.health().await.unwrap();
    assert!(health.ok);
    assert_eq!(health.pid, std::process::id());
    assert_eq!(health.schema_version, "0.2");
    assert_eq!(health.index_position, 0);
    assert!(health.workspace.ends_with("ws"));

    daemon.stop().await;
}

#[tokio::test]
async fn test_repeated_batch_is_skipped_with_same_ids() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;

    let first = daemon.client.ingest(three_events()).await.unwrap();
    assert_eq!((first.new, first.skipped, first.failed), (3, 0, 0));
    let ids = new_ids(&first.results);
    assert_eq!(ids, vec![1, 2, 3]);

    let len_after_first = file_len(&log_path(&config));
    let second = daemon.client.ingest(three_events()).await.unwrap();
    assert_eq!((second.new, second.skipped, second.failed), (0, 3, 0));
    assert_eq!(skipped_ids(&second.results), ids);
    assert_eq!(file_len(&log_path(&config)), len_after_first);

    let health = daemon.client.health().await.unwrap();
    assert_eq!(health.index_position, health.canonical_len);

    daemon.stop().await;
}

#[tokio::test]
async fn test_second_daemon_is_refused() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;
    daemon.client.ingest(three_events()).await.unwrap();

    let lock_path = config.workspace.root.join("canonical").join(".ops.lock");
    let lock_before = std::fs::read_to_string(&lock_path).unwrap();
    let log_before = file_len(&log_path(&config));

    match Daemon::start(&config).await {
        Err(OpsError::LockUnavailable { .. }) => {}
        Err(other) => panic!("expected lock_unavailable, got {}", other),
        Ok(_) => panic!("second daemon started"),
    }

    assert_eq!(std::fs::read_to_string(&lock_path).unwrap(), lock_before);
    assert_eq!(file_len(&log_path(&config)), log_before);
    assert!(daemon.client.health().await.unwrap().ok);

    daemon.stop().await;
}

#[tokio::test]
async fn test_fallback_write_refused_while_daemon_runs() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;

    let err = fallback::ingest(&config, three_events()).await.unwrap_err();
    assert_eq!(err.code(), "lock_unavailable");
    assert_eq!(file_len(&log_path(&config)), 0);

    // Reads need no lock.
    let hits = fallback::search(&config, &SearchQuery::default()).await.unwrap();
    assert!(hits.is_empty());

    daemon.stop().await;
}

#[tokio::test]
async fn test_fallback_then_daemon_dedupes() {
    let (_tmp, config) = setup_test_env();

    let offline = fallback::ingest(&config, three_events()).await.unwrap();
    assert_eq!(offline.new, 3);
    let ids = new_ids(&offline.results);

    let daemon = start(&config).await;
    let mut batch = three_events();
    batch.push(event("delta new message", "2026-01-21T12:00:00Z"));
    let online = daemon.client.ingest(batch).await.unwrap();

    assert_eq!((online.new, online.skipped), (1, 3));
    assert_eq!(skipped_ids(&online.results[..3]), ids);
    assert_eq!(new_ids(&online.results[3..]), vec![4]);

    daemon.stop().await;

    // Lock released on shutdown.
    let again = fallback::ingest(&config, three_events()).await.unwrap();
    assert_eq!(again.skipped, 3);
}

#[tokio::test]
async fn test_rebuild_job_preserves_search_results() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;

    let events: Vec<Value> = (0..100)
        .map(|i| {
            let text = if i == 42 {
                "needle incident postmortem needle".to_string()
            } else {
                format!("routine message number {}", i)
            };
            event(&text, &format!("2026-01-21T10:{:02}:00Z", i % 60))
        })
        .collect();
    let result = daemon.client.ingest(events).await.unwrap();
    assert_eq!(result.new, 100);

    let query = SearchQuery {
        q: Some("needle".into()),
        ..Default::default()
    };
    let before = daemon.client.search(&query).await.unwrap();
    assert_eq!(before.len(), 1);
    let all = SearchQuery {
        limit: Some(1000),
        ..Default::default()
    };
    assert_eq!(daemon.client.search(&all).await.unwrap().len(), 100);

    daemon
        .client
        .add_job(&NewJob {
            name: "reindex".into(),
            kind: "index_rebuild".into(),
            config: json!({"wipe": true}),
            enabled: true,
        })
        .await
        .unwrap();
    let run = daemon.client.run_job("reindex").await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);

    let after = daemon.client.search(&query).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(daemon.client.search(&all).await.unwrap().len(), 100);

    let runs = daemon.client.list_runs("reindex", 20).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, run.id);

    daemon.stop().await;
}

#[tokio::test]
async fn test_daily_digest_emits_one_artifact_event() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;
    daemon.client.ingest(three_events()).await.unwrap();

    daemon
        .client
        .add_job(&NewJob {
            name: "digest".into(),
            kind: "daily_digest".into(),
            config: json!({"day": "2026-01-21"}),
            enabled: true,
        })
        .await
        .unwrap();
    let run = daemon.client.run_job("digest").await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded, "error: {:?}", run.error);
    assert_eq!(run.event_ids.len(), 1);
    assert_eq!(run.artifacts.len(), 1);

    let path = &run.artifacts[0].path;
    let markdown = std::fs::read_to_string(path).unwrap();
    assert!(markdown.starts_with("# Daily Digest"));
    assert!(path.starts_with(config.workspace.root.join("artifacts").join("digests")));
    assert_eq!(
        path.file_name().unwrap().to_string_lossy(),
        format!("daily_digest-2026-01-21-{}.md", run.id)
    );

    let artifact = daemon.client.get_event(run.event_ids[0]).await.unwrap();
    assert_eq!(artifact.event_type, ARTIFACT_CREATED);
    assert_eq!(artifact.content["sha256"], json!(run.artifacts[0].sha256));

    let listed = daemon.client.artifacts(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].event_id, run.event_ids[0]);
    assert_eq!(listed[0].job.as_deref(), Some("digest"));

    daemon.stop().await;
}

fn many_events(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| event(&format!("bulk message {}", i), "2026-01-21T10:00:00Z"))
        .collect()
}

fn logged_keys(config: &Config) -> Vec<String> {
    std::fs::read_to_string(log_path(config))
        .unwrap()
        .lines()
        .map(|line| {
            let record: Value = serde_json::from_str(line).unwrap();
            record["dedupe_key"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
async fn test_abandoned_request_still_completes() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;
    let base = daemon.client.base_url().to_string();

    // The caller gives up long before the batch can finish.
    let impatient = reqwest::Client::new();
    let _ = impatient
        .post(format!("{}/v1/events:batch", base))
        .json(&json!({ "events": many_events(300) }))
        .timeout(Duration::from_millis(20))
        .send()
        .await;

    let retry = daemon.client.ingest(many_events(300)).await.unwrap();
    assert_eq!(retry.failed, 0);
    assert_eq!(retry.new + retry.skipped, 300);

    let mut keys = logged_keys(&config);
    assert_eq!(keys.len(), 300);
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 300);

    let health = daemon.client.health().await.unwrap();
    assert_eq!(health.index_position, health.canonical_len);

    daemon.stop().await;
}

#[tokio::test]
async fn test_short_client_timeout_does_not_cut_writes() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;
    let hasty =
        DaemonClient::new(daemon.client.base_url(), Duration::from_millis(50)).unwrap();

    // Queued behind another batch, then run in full.
    let busy = {
        let client = daemon.client.clone();
        tokio::spawn(async move { client.ingest(many_events(400)).await })
    };
    let second: Vec<Value> = (0..400)
        .map(|i| event(&format!("second wave {}", i), "2026-01-21T11:00:00Z"))
        .collect();
    let result = hasty.ingest(second).await.unwrap();
    assert_eq!((result.new, result.failed), (400, 0));

    let first = busy.await.unwrap().unwrap();
    assert_eq!(first.failed, 0);
    assert!(hasty.health().await.unwrap().ok);

    daemon.stop().await;
}

#[tokio::test]
async fn test_job_show_delete_and_pack() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;
    daemon.client.ingest(three_events()).await.unwrap();

    let job = daemon
        .client
        .add_job(&NewJob {
            name: "digest".into(),
            kind: "daily_digest".into(),
            config: json!({"day": "2026-01-21"}),
            enabled: true,
        })
        .await
        .unwrap();
    assert_eq!(daemon.client.get_job("digest").await.unwrap(), job);

    daemon.client.delete_job("digest").await.unwrap();
    assert!(daemon.client.list_jobs().await.unwrap().is_empty());
    match daemon.client.get_job("digest").await {
        Err(opslog::client::ClientError::Api { status, error }) => {
            assert_eq!(status, 404);
            assert_eq!(error.code, "not_found");
        }
        other => panic!("expected not_found, got {:?}", other),
    }

    let run = daemon
        .client
        .pack(&ArtifactPackConfig {
            tag: "team".into(),
            out_dir: "packs".into(),
            limit: 500,
        })
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded, "error: {:?}", run.error);
    assert_eq!(run.output.as_ref().unwrap()["items"], 3);
    assert_eq!(run.event_ids.len(), 2);

    let listed = daemon.client.artifacts(10).await.unwrap();
    let kinds: Vec<&str> = listed.iter().map(|a| a.kind.as_str()).collect();
    assert_eq!(kinds, vec!["markdown", "json"]);
    assert_eq!(daemon.client.list_runs("artifact_pack", 5).await.unwrap().len(), 1);

    daemon.stop().await;
}

#[tokio::test]
async fn test_canonical_log_survives_lost_index() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;
    daemon.client.ingest(three_events()).await.unwrap();
    daemon.stop().await;

    let index_dir = config.workspace.root.join("index");
    std::fs::remove_dir_all(&index_dir).unwrap();

    let record = fallback::show(&config, 2).await.unwrap();
    assert_eq!(record.text, "beta rollback finished");

    let report = fallback::rebuild(&config, true).await.unwrap();
    assert_eq!(report.indexed, 3);
    assert_eq!(report.position, file_len(&log_path(&config)));

    let hits = fallback::search(
        &config,
        &SearchQuery {
            q: Some("deploy".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let mut ids: Vec<i64> = hits.iter().map(|h| h.id).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 3]);
}

#[tokio::test]
async fn test_double_wipe_rebuild_is_idempotent() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;
    daemon.client.ingest(three_events()).await.unwrap();

    let first = daemon.client.rebuild(true).await.unwrap();
    let second = daemon.client.rebuild(true).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.indexed, 3);

    let catch_up = daemon.client.rebuild(false).await.unwrap();
    assert_eq!(catch_up.processed, 0);
    assert_eq!(catch_up.position, first.position);

    daemon.stop().await;
}

#[tokio::test]
async fn test_error_envelope() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;
    let base = daemon.client.base_url().to_string();
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("{}/v1/events:batch", base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = http
        .get(format!("{}/v1/events/999", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = http
        .get(format!("{}/v1/search?limit=0", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_argument");

    daemon.stop().await;
}

#[tokio::test]
async fn test_invalid_record_fails_alone() {
    let (_tmp, config) = setup_test_env();
    let daemon = start(&config).await;

    let batch = vec![
        event("first", "2026-01-21T09:00:00Z"),
        json!({"type": "", "source_name": "slack"}),
        json!("not an object"),
        event("last", "2026-01-21T09:05:00Z"),
    ];
    let result = daemon.client.ingest(batch).await.unwrap();
    assert_eq!((result.new, result.failed), (2, 2));
    match &result.results[1] {
        RecordOutcome::Failed { id, error, .. } => {
            assert!(id.is_none());
            assert_eq!(error.code, "invalid_record");
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(result.appended_ids(), vec![1, 2]);

    daemon.stop().await;
}

#[tokio::test]
async fn test_fallback_job_runs_use_registry() {
    let (_tmp, config) = setup_test_env();
    let registry = JobRegistry::with_builtins();

    let err = fallback::add_job(
        &config,
        &registry,
        NewJob {
            name: "bad".into(),
            kind: "nope".into(),
            config: Value::Null,
            enabled: true,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "invalid_argument");

    fallback::add_job(
        &config,
        &registry,
        NewJob {
            name: "reindex".into(),
            kind: "index_rebuild".into(),
            config: Value::Null,
            enabled: true,
        },
    )
    .await
    .unwrap();
    let run = fallback::run_job(&config, &registry, "reindex").await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);

    let jobs = fallback::list_jobs(&config).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let runs = fallback::list_runs(&config, "reindex", 5).await.unwrap();
    assert_eq!(runs.len(), 1);
}
