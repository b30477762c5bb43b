//! Ingest pipeline.
//!
//! Raw record → [`normalize`] → dedupe lookup → canonical append → index.
//! Daemon, fallback and jobs all enter through [`ingest_batch`] or
//! [`ingest_json`] with a `&mut Workspace`, so every write path derives the
//! same dedupe key and follows the same ordering:
//!
//! 1. a record is appended only if its dedupe key is unknown;
//! 2. it is indexed only after its append is durable;
//! 3. an index failure fails that record alone; a canonical failure fails
//!    it and every record after it in the batch, none of which are written.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

use crate::dedupe::{canonical_json, dedupe_key, sha256_hex, DedupeInput};
use crate::error::{ErrorDetail, OpsError, Result};
use crate::models::{Digest, EventRecord, IngestResult, RawRecord, RecordOutcome, SCHEMA_VERSION};
use crate::workspace::Workspace;

/// A normalized record that has not been given an id yet.
///
/// Ids are assigned at append time so skipped records never consume one.
#[derive(Debug, Clone)]
pub struct EventDraft {
    record: EventRecord,
}

impl EventDraft {
    pub fn dedupe_key(&self) -> &str {
        &self.record.dedupe_key
    }

    pub fn assign(mut self, id: i64) -> EventRecord {
        self.record.id = id;
        self.record
    }
}

/// Validates a raw record and fills in everything but the id.
///
/// A missing `ts` becomes "now" in `tz`; a `ts` without an offset is read as
/// local time in `tz`.
pub fn normalize(raw: RawRecord, tz: &FixedOffset) -> Result<EventDraft> {
    let event_type = raw.event_type.trim().to_string();
    if event_type.is_empty() {
        return Err(OpsError::InvalidRecord("type is required".into()));
    }
    let source_name = raw.source_name.trim().to_string();
    if source_name.is_empty() {
        return Err(OpsError::InvalidRecord("source_name is required".into()));
    }
    if let Some(version) = &raw.schema_version {
        if version != SCHEMA_VERSION {
            return Err(OpsError::InvalidRecord(format!(
                "unsupported schema_version '{}', expected '{}'",
                version, SCHEMA_VERSION
            )));
        }
    }

    let content = match raw.content {
        Value::Null => Value::Object(Map::new()),
        Value::Object(map) => Value::Object(map),
        other => {
            return Err(OpsError::InvalidRecord(format!(
                "content must be an object, got {}",
                json_kind(&other)
            )))
        }
    };

    let ts = match raw.ts.as_deref().map(str::trim) {
        None | Some("") => Utc::now().with_timezone(tz),
        Some(value) => parse_ts(value, tz)?,
    };

    let tags: Vec<String> = raw
        .tags
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let text = raw.text.replace("\r\n", "\n").replace('\r', "\n");
    let source_locator = raw.source_locator.filter(|l| !l.is_empty());

    let key = dedupe_key(&DedupeInput {
        source_name: &source_name,
        source_locator: source_locator.as_deref(),
        event_type: &event_type,
        refs: &raw.refs,
        text: &text,
        content: &content,
    })?;

    let core = json!({
        "schema_version": SCHEMA_VERSION,
        "ts": ts,
        "type": event_type,
        "source_name": source_name,
        "source_locator": source_locator,
        "refs": raw.refs,
        "tags": tags,
        "text": text,
        "content": content,
    });
    let hash = Digest::sha256(sha256_hex(canonical_json(&core)?.as_bytes()));

    Ok(EventDraft {
        record: EventRecord {
            schema_version: SCHEMA_VERSION.to_string(),
            id: 0,
            ts,
            event_type,
            source_name,
            source_locator,
            refs: raw.refs,
            tags,
            text,
            content,
            hash,
            dedupe_key: key,
        },
    })
}

fn parse_ts(value: &str, tz: &FixedOffset) -> Result<DateTime<FixedOffset>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts);
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|_| OpsError::InvalidRecord(format!("ts is not RFC 3339: '{}'", value)))?;
    tz.from_local_datetime(&naive)
        .single()
        .ok_or_else(|| OpsError::InvalidRecord(format!("ts is ambiguous: '{}'", value)))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============ Batch ingest ============

pub async fn ingest_batch(ws: &mut Workspace, records: Vec<RawRecord>) -> IngestResult {
    run_batch(ws, records.into_iter().map(Ok).collect()).await
}

/// Like [`ingest_batch`], for records that arrive as loose JSON. An entry that
/// does not deserialize fails on its own.
pub async fn ingest_json(ws: &mut Workspace, events: Vec<Value>) -> IngestResult {
    let inputs = events
        .into_iter()
        .map(|value| {
            serde_json::from_value::<RawRecord>(value)
                .map_err(|e| OpsError::InvalidRecord(e.to_string()))
        })
        .collect();
    run_batch(ws, inputs).await
}

async fn run_batch(ws: &mut Workspace, inputs: Vec<Result<RawRecord>>) -> IngestResult {
    let mut result = IngestResult::default();
    let mut abort: Option<ErrorDetail> = None;

    for input in inputs {
        if let Some(cause) = &abort {
            result.push(RecordOutcome::Failed {
                id: None,
                dedupe_key: None,
                error: ErrorDetail::new(
                    "aborted",
                    format!("not attempted after canonical failure: {}", cause.message),
                ),
            });
            continue;
        }

        match ingest_one(ws, input).await {
            Step::Done(outcome) => result.push(outcome),
            Step::Fatal(outcome, cause) => {
                result.push(outcome);
                abort = Some(cause);
            }
        }
    }

    info!(
        new = result.new,
        skipped = result.skipped,
        failed = result.failed,
        "ingest batch finished"
    );
    result
}

enum Step {
    Done(RecordOutcome),
    Fatal(RecordOutcome, ErrorDetail),
}

fn failed(id: Option<i64>, key: Option<String>, error: &OpsError) -> RecordOutcome {
    RecordOutcome::Failed {
        id,
        dedupe_key: key,
        error: error.to_detail(),
    }
}

async fn ingest_one(ws: &mut Workspace, input: Result<RawRecord>) -> Step {
    let draft = match input.and_then(|raw| normalize(raw, &ws.timezone())) {
        Ok(draft) => draft,
        Err(e) => {
            debug!(error = %e, "rejected raw record");
            return Step::Done(failed(None, None, &e));
        }
    };
    let key = draft.dedupe_key().to_string();

    match ws.lookup_by_dedupe_key(&key).await {
        Ok(Some(existing_id)) => {
            return Step::Done(RecordOutcome::Skipped {
                existing_id,
                dedupe_key: key,
            })
        }
        Ok(None) => {}
        // Without a lookup the record could be a duplicate; do not append it.
        Err(e) => {
            warn!(error = %e, "dedupe lookup failed");
            return Step::Done(failed(None, Some(key), &e));
        }
    }

    let id = ws.next_id;
    let record = draft.assign(id);
    let span = match ws.log.append(&record) {
        Ok(span) => span,
        Err(e) if e.is_fatal_for_batch() => {
            error!(error = %e, id, "canonical append failed, aborting batch");
            let detail = e.to_detail();
            return Step::Fatal(failed(None, Some(key), &e), detail);
        }
        Err(e) => return Step::Done(failed(None, Some(key), &e)),
    };
    ws.next_id += 1;
    // Registered before the index await: if this future is dropped there, the
    // record is on the log and a retry must still find its key.
    ws.pending.insert(key.clone(), id);

    match ws.index.index(&record, span).await {
        Ok(()) => {
            ws.pending.remove(&key);
            Step::Done(RecordOutcome::New {
                id,
                dedupe_key: key,
            })
        }
        Err(e) => {
            warn!(error = %e, id, "index write failed, canonical record kept");
            if matches!(e, OpsError::DedupeConflict { .. }) {
                ws.pending.remove(&key);
            }
            Step::Done(failed(Some(id), Some(key), &e))
        }
    }
}
