//! Index Store: the derived SQLite view over the canonical log.
//!
//! Holds the dedupe map, full-text columns and the catch-up position. None of
//! it is authoritative; [`IndexStore::rebuild`] with `wipe = true` recreates
//! every table from the log.
//!
//! # Position
//!
//! `index_state.position` is the byte offset just past the last line that has
//! been indexed contiguously from the start of the log. Indexing a record only
//! moves the position when that record starts exactly at it, so a record whose
//! index write failed keeps the position behind it and incremental catch-up
//! visits it again.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

use crate::canonical::{CanonicalLog, LogSpan};
use crate::db;
use crate::dedupe::canonical_json;
use crate::error::{OpsError, Result};
use crate::migrate::{self, INDEX_SCHEMA_VERSION};
use crate::models::EventRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub schema_version: String,
    pub position: u64,
    pub last_id: i64,
}

/// Summary of one rebuild or catch-up pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub wiped: bool,
    pub start: u64,
    pub processed: usize,
    pub indexed: usize,
    pub conflicts: usize,
    pub parse_errors: usize,
    pub position: u64,
}

#[derive(Debug, Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    /// Opens the index database, creating tables on first use. An index
    /// written under another schema version is dropped and starts empty.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await.map_err(OpsError::IndexWrite)?;
        migrate::run_index_migrations(&pool)
            .await
            .map_err(OpsError::IndexWrite)?;

        let store = Self { pool };
        let state = store.state().await?;
        if state.schema_version != INDEX_SCHEMA_VERSION {
            warn!(
                found = %state.schema_version,
                expected = INDEX_SCHEMA_VERSION,
                "index schema version changed, discarding derived state"
            );
            migrate::reset_index(&store.pool)
                .await
                .map_err(OpsError::IndexWrite)?;
        }
        Ok(store)
    }

    /// Opens an existing index for reading only, without the workspace
    /// lock. Runs no migrations.
    pub async fn open_reader(path: &Path) -> Result<Self> {
        let pool = db::connect_read_only(path)
            .await
            .map_err(OpsError::IndexRead)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn state(&self) -> Result<IndexState> {
        let row = sqlx::query(
            "SELECT schema_version, position, last_id FROM index_state WHERE singleton = 1",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(OpsError::IndexRead)?;

        Ok(IndexState {
            schema_version: row.get("schema_version"),
            position: row.get::<i64, _>("position") as u64,
            last_id: row.get("last_id"),
        })
    }

    pub async fn position(&self) -> Result<u64> {
        Ok(self.state().await?.position)
    }

    pub async fn lookup_by_dedupe_key(&self, key: &str) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT event_id FROM dedupe WHERE dedupe_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(OpsError::IndexRead)
    }

    pub async fn get_event(&self, id: i64) -> Result<Option<EventRecord>> {
        let json: Option<String> = sqlx::query_scalar("SELECT record_json FROM events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(OpsError::IndexRead)?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn event_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(OpsError::IndexRead)
    }

    /// The whole dedupe map, ordered by key.
    pub async fn dedupe_map(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT dedupe_key, event_id FROM dedupe ORDER BY dedupe_key")
            .fetch_all(&self.pool)
            .await
            .map_err(OpsError::IndexRead)?;
        Ok(rows
            .iter()
            .map(|row| (row.get("dedupe_key"), row.get("event_id")))
            .collect())
    }

    /// Upserts one record in a single transaction. The record becomes visible
    /// to search only when the transaction commits.
    ///
    /// A dedupe key already bound to another id is a consistency violation and
    /// is returned as [`OpsError::DedupeConflict`]; nothing is written.
    pub async fn index(&self, record: &EventRecord, span: LogSpan) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(OpsError::IndexWrite)?;

        let bound: Option<i64> =
            sqlx::query_scalar("SELECT event_id FROM dedupe WHERE dedupe_key = ?")
                .bind(&record.dedupe_key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(OpsError::IndexWrite)?;

        match bound {
            Some(existing) if existing != record.id => {
                return Err(OpsError::DedupeConflict {
                    key: record.dedupe_key.clone(),
                    existing,
                    attempted: record.id,
                });
            }
            Some(_) => {}
            None => {
                sqlx::query("INSERT INTO dedupe (dedupe_key, event_id) VALUES (?, ?)")
                    .bind(&record.dedupe_key)
                    .bind(record.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(OpsError::IndexWrite)?;
            }
        }

        let record_json = canonical_json(record)?;
        let content_json = canonical_json(&record.content)?;

        sqlx::query(
            r#"
            INSERT INTO events (id, ts, ts_epoch_ms, type, source_name, dedupe_key, record_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                ts = excluded.ts,
                ts_epoch_ms = excluded.ts_epoch_ms,
                type = excluded.type,
                source_name = excluded.source_name,
                dedupe_key = excluded.dedupe_key,
                record_json = excluded.record_json
            "#,
        )
        .bind(record.id)
        .bind(record.ts.to_rfc3339())
        .bind(record.ts.timestamp_millis())
        .bind(&record.event_type)
        .bind(&record.source_name)
        .bind(&record.dedupe_key)
        .bind(&record_json)
        .execute(&mut *tx)
        .await
        .map_err(OpsError::IndexWrite)?;

        sqlx::query("DELETE FROM event_tags WHERE event_id = ?")
            .bind(record.id)
            .execute(&mut *tx)
            .await
            .map_err(OpsError::IndexWrite)?;
        for tag in &record.tags {
            sqlx::query("INSERT OR IGNORE INTO event_tags (event_id, tag) VALUES (?, ?)")
                .bind(record.id)
                .bind(tag)
                .execute(&mut *tx)
                .await
                .map_err(OpsError::IndexWrite)?;
        }

        sqlx::query("DELETE FROM events_fts WHERE rowid = ?")
            .bind(record.id)
            .execute(&mut *tx)
            .await
            .map_err(OpsError::IndexWrite)?;
        sqlx::query("INSERT INTO events_fts (rowid, type, tags, text, content) VALUES (?, ?, ?, ?, ?)")
            .bind(record.id)
            .bind(&record.event_type)
            .bind(record.tags.join(" "))
            .bind(&record.text)
            .bind(&content_json)
            .execute(&mut *tx)
            .await
            .map_err(OpsError::IndexWrite)?;

        advance(&mut tx, span, record.id).await?;

        tx.commit().await.map_err(OpsError::IndexWrite)
    }

    /// Moves the position past a line that will never be indexed (corrupt or
    /// conflicting), if it is the next line in order.
    async fn skip(&self, span: LogSpan) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(OpsError::IndexWrite)?;
        advance(&mut tx, span, 0).await?;
        tx.commit().await.map_err(OpsError::IndexWrite)
    }

    /// Rebuilds from the canonical log. `wipe = true` starts from an empty
    /// index at offset 0; `wipe = false` catches up from the stored position.
    ///
    /// The caller must hold the workspace write section for the duration so
    /// no append races the pass.
    pub async fn rebuild(&self, log: &CanonicalLog, wipe: bool) -> Result<RebuildReport> {
        if wipe {
            migrate::reset_index(&self.pool)
                .await
                .map_err(OpsError::IndexWrite)?;
        }

        let mut start = self.position().await?;
        if start > log.len() {
            warn!(
                position = start,
                canonical_len = log.len(),
                "index position is past the end of the canonical log, rebuilding from scratch"
            );
            migrate::reset_index(&self.pool)
                .await
                .map_err(OpsError::IndexWrite)?;
            start = 0;
        }

        info!(wipe, start, canonical_len = log.len(), "index rebuild started");

        let mut report = RebuildReport {
            wiped: wipe,
            start,
            ..Default::default()
        };

        for entry in log.read_from(start)? {
            match entry {
                Ok(entry) => {
                    report.processed += 1;
                    match self.index(&entry.record, entry.span).await {
                        Ok(()) => report.indexed += 1,
                        Err(e @ OpsError::DedupeConflict { .. }) => {
                            warn!(error = %e, "dedupe conflict during rebuild");
                            report.conflicts += 1;
                            self.skip(entry.span).await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(OpsError::CanonicalCorrupt {
                    offset,
                    next,
                    message,
                }) => {
                    warn!(offset, %message, "skipping corrupt canonical line");
                    report.parse_errors += 1;
                    self.skip(LogSpan { start: offset, end: next }).await?;
                }
                Err(e) => return Err(e),
            }
        }

        report.position = self.position().await?;
        info!(
            processed = report.processed,
            indexed = report.indexed,
            conflicts = report.conflicts,
            parse_errors = report.parse_errors,
            position = report.position,
            "index rebuild finished"
        );
        Ok(report)
    }
}

async fn advance(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    span: LogSpan,
    id: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE index_state SET
            position = CASE WHEN position = ? THEN ? ELSE position END,
            last_id = MAX(last_id, ?)
        WHERE singleton = 1
        "#,
    )
    .bind(span.start as i64)
    .bind(span.end as i64)
    .bind(id)
    .execute(&mut **tx)
    .await
    .map_err(OpsError::IndexWrite)?;
    Ok(())
}
