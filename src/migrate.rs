//! Schemas for the index database and the job state database.
//!
//! The index schema is disposable: [`reset_index`] drops and recreates it and
//! the index is then rebuilt from the canonical log. The state schema holds
//! job definitions and run history and is never wiped.

use sqlx::{SqliteConnection, SqlitePool};

/// Bumped whenever the index tables change shape. An index written under a
/// different version is discarded on open.
pub const INDEX_SCHEMA_VERSION: &str = "1";

pub async fn run_index_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    create_index_schema(&mut conn).await
}

/// Drops every derived table and recreates an empty index at position 0.
pub async fn reset_index(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for table in ["events_fts", "event_tags", "dedupe", "events", "index_state"] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(&mut *tx)
            .await?;
    }
    create_index_schema(&mut tx).await?;
    tx.commit().await
}

async fn create_index_schema(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    // Full records, one row per indexed event
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY,
            ts TEXT NOT NULL,
            ts_epoch_ms INTEGER NOT NULL,
            type TEXT NOT NULL,
            source_name TEXT NOT NULL,
            dedupe_key TEXT NOT NULL,
            record_json TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_tags (
            event_id INTEGER NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (event_id, tag)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dedupe (
            dedupe_key TEXT PRIMARY KEY,
            event_id INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_state (
            singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
            schema_version TEXT NOT NULL,
            position INTEGER NOT NULL,
            last_id INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "INSERT OR IGNORE INTO index_state (singleton, schema_version, position, last_id) VALUES (1, ?, 0, 0)",
    )
    .bind(INDEX_SCHEMA_VERSION)
    .execute(&mut *conn)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='events_fts'",
    )
    .fetch_one(&mut *conn)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE events_fts USING fts5(
                type,
                tags,
                text,
                content
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts_epoch_ms)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_type ON events(type)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_event_tags_tag ON event_tags(tag)")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn run_state_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            name TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            config_json TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_runs (
            id TEXT PRIMARY KEY,
            job_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            status TEXT NOT NULL,
            artifacts_json TEXT NOT NULL DEFAULT '[]',
            event_ids_json TEXT NOT NULL DEFAULT '[]',
            output_json TEXT,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_runs_job ON job_runs(job_name, started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
