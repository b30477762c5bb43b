//! Core data models used throughout the event store.
//!
//! These types represent the records that flow through the ingest pipeline:
//! raw records handed over by adapters, canonical event records as they are
//! stored in the log, and the per-record outcomes of an ingest batch.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorDetail;

/// Version tag written into every canonical record.
pub const SCHEMA_VERSION: &str = "0.2";

/// Event type emitted by jobs for every artifact they produce.
pub const ARTIFACT_CREATED: &str = "artifact.created";

/// A content digest, e.g. `{ "algo": "sha256", "value": "ab12..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub algo: String,
    pub value: String,
}

impl Digest {
    pub fn sha256(value: impl Into<String>) -> Self {
        Self {
            algo: "sha256".to_string(),
            value: value.into(),
        }
    }
}

/// Pointer from an event to the thing it was derived from (a file, a span).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRef {
    pub kind: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
}

/// Already-normalized record handed to the ingest pipeline by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source_name: String,
    #[serde(default)]
    pub source_locator: Option<String>,
    /// RFC 3339 timestamp; the configured zone's "now" is used when absent.
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub refs: Vec<EventRef>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub schema_version: Option<String>,
}

impl RawRecord {
    pub fn new(event_type: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source_name: source_name.into(),
            source_locator: None,
            ts: None,
            refs: Vec::new(),
            tags: Vec::new(),
            text: String::new(),
            content: Value::Null,
            schema_version: None,
        }
    }
}

/// A record as it exists on the canonical log. Never modified once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub schema_version: String,
    pub id: i64,
    pub ts: DateTime<FixedOffset>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_locator: Option<String>,
    #[serde(default)]
    pub refs: Vec<EventRef>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub content: Value,
    pub hash: Digest,
    pub dedupe_key: String,
}

/// Transport shape of a batch-ingest request.
///
/// Events stay as loose JSON so one malformed entry fails on its own instead
/// of rejecting the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestBatch {
    pub events: Vec<Value>,
}

/// Per-record outcome of an ingest batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    New {
        id: i64,
        dedupe_key: String,
    },
    Skipped {
        existing_id: i64,
        dedupe_key: String,
    },
    /// `id` is set when the record reached the canonical log but the index
    /// write failed; the event exists and a rebuild will index it.
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dedupe_key: Option<String>,
        error: ErrorDetail,
    },
}

/// Aggregate result of an ingest batch, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub new: usize,
    pub skipped: usize,
    pub failed: usize,
    pub results: Vec<RecordOutcome>,
}

impl IngestResult {
    pub fn push(&mut self, outcome: RecordOutcome) {
        match &outcome {
            RecordOutcome::New { .. } => self.new += 1,
            RecordOutcome::Skipped { .. } => self.skipped += 1,
            RecordOutcome::Failed { .. } => self.failed += 1,
        }
        self.results.push(outcome);
    }

    /// Ids of records appended by this batch, including ones whose index
    /// write failed.
    pub fn appended_ids(&self) -> Vec<i64> {
        self.results
            .iter()
            .filter_map(|outcome| match outcome {
                RecordOutcome::New { id, .. } => Some(*id),
                RecordOutcome::Failed { id, .. } => *id,
                RecordOutcome::Skipped { .. } => None,
            })
            .collect()
    }
}
