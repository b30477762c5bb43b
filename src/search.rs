//! Full-text search over the index.
//!
//! Keyword matching uses SQLite FTS5 with BM25 ranking. The raw `bm25()` value
//! is negated so that higher scores are better, and results are ordered by
//! score descending with id ascending as the tiebreak. An empty query lists
//! events matching the filters only, all with score 0.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::error::{OpsError, Result};
use crate::index::IndexStore;
use crate::models::EventRecord;

pub const MAX_LIMIT: i64 = 1000;

/// Search request. Every filter narrows the result set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    /// FTS5 match expression. Empty or absent means filter-only listing.
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
    /// Types left out of the result, applied before the limit.
    #[serde(default)]
    pub exclude_types: Vec<String>,
    /// Any-of: an event matches if it carries at least one of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    /// Inclusive RFC 3339 lower bound on `ts`.
    #[serde(default)]
    pub after: Option<String>,
    /// Inclusive RFC 3339 upper bound on `ts`.
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    pub ts: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub tags: Vec<String>,
    pub source_name: String,
    pub score: f64,
    pub snippet: String,
}

/// Runs a search against the index and returns at most `limit` hits.
///
/// `snippet_tokens` bounds the highlighted excerpt; `default_limit` applies
/// when the query carries none.
pub async fn search(
    index: &IndexStore,
    query: &SearchQuery,
    snippet_tokens: i64,
    default_limit: i64,
) -> Result<Vec<SearchHit>> {
    let limit = query.limit.unwrap_or(default_limit);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(OpsError::InvalidArgument(format!(
            "limit must be in [1, {}], got {}",
            MAX_LIMIT, limit
        )));
    }
    let after = parse_bound("after", query.after.as_deref())?;
    let before = parse_bound("before", query.before.as_deref())?;

    let text_query = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty());

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT e.id, e.record_json, ");
    match text_query {
        Some(q) => {
            qb.push("-bm25(events_fts) AS score, snippet(events_fts, -1, '>>>', '<<<', '...', ");
            qb.push_bind(snippet_tokens);
            qb.push(") AS snippet FROM events_fts JOIN events e ON e.id = events_fts.rowid WHERE events_fts MATCH ");
            qb.push_bind(q.to_string());
        }
        None => {
            qb.push("0.0 AS score, NULL AS snippet FROM events e WHERE 1 = 1");
        }
    }

    if !query.types.is_empty() {
        qb.push(" AND e.type IN (");
        let mut sep = qb.separated(", ");
        for t in &query.types {
            sep.push_bind(t.clone());
        }
        qb.push(")");
    }
    if !query.exclude_types.is_empty() {
        qb.push(" AND e.type NOT IN (");
        let mut sep = qb.separated(", ");
        for t in &query.exclude_types {
            sep.push_bind(t.clone());
        }
        qb.push(")");
    }
    if !query.tags.is_empty() {
        qb.push(" AND EXISTS (SELECT 1 FROM event_tags t WHERE t.event_id = e.id AND t.tag IN (");
        let mut sep = qb.separated(", ");
        for tag in &query.tags {
            sep.push_bind(tag.clone());
        }
        qb.push("))");
    }
    if let Some(source) = &query.source_name {
        qb.push(" AND e.source_name = ");
        qb.push_bind(source.clone());
    }
    if let Some(after) = after {
        qb.push(" AND e.ts_epoch_ms >= ");
        qb.push_bind(after);
    }
    if let Some(before) = before {
        qb.push(" AND e.ts_epoch_ms <= ");
        qb.push_bind(before);
    }

    qb.push(" ORDER BY score DESC, e.id ASC LIMIT ");
    qb.push_bind(limit);

    let rows = qb
        .build()
        .fetch_all(index.pool())
        .await
        .map_err(|e| match text_query {
            // FTS5 syntax errors surface as database errors from MATCH
            Some(q) if matches!(e, sqlx::Error::Database(_)) => {
                OpsError::InvalidArgument(format!("bad search query '{}': {}", q, e))
            }
            _ => OpsError::IndexRead(e),
        })?;

    let mut hits = Vec::with_capacity(rows.len());
    for row in &rows {
        let record: EventRecord = serde_json::from_str(row.get::<&str, _>("record_json"))?;
        let snippet: Option<String> = row.get("snippet");
        hits.push(SearchHit {
            id: row.get("id"),
            ts: record.ts.to_rfc3339(),
            score: row.get("score"),
            snippet: snippet.unwrap_or_else(|| excerpt(&record.text, snippet_tokens)),
            event_type: record.event_type,
            tags: record.tags,
            source_name: record.source_name,
        });
    }

    Ok(hits)
}

fn parse_bound(name: &str, value: Option<&str>) -> Result<Option<i64>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|ts| ts.timestamp_millis())
                .map_err(|e| {
                    OpsError::InvalidArgument(format!("{} must be RFC 3339, got '{}': {}", name, v, e))
                })
        })
        .transpose()
}

/// First `tokens` whitespace-separated words of `text`, on one line.
fn excerpt(text: &str, tokens: i64) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let take = tokens.max(1) as usize;
    let mut out = words.iter().take(take).copied().collect::<Vec<_>>().join(" ");
    if words.len() > take {
        out.push_str("...");
    }
    out
}
