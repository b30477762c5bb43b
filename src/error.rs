//! Error taxonomy for the event store.
//!
//! Every failure the core can produce is one of these variants. Callers get
//! them back as values (per-record in an ingest result, per-run in a job run,
//! or as an HTTP error body); nothing is dropped silently.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpsError {
    /// Another process holds the workspace lock.
    #[error("workspace lock unavailable: {} is held by another writer", path.display())]
    LockUnavailable { path: PathBuf },

    /// Appending to the canonical log failed. Fatal for the rest of a batch.
    #[error("canonical write failed: {0}")]
    CanonicalWrite(#[source] std::io::Error),

    /// A line in the middle of the canonical log does not parse. `next` is
    /// the offset of the line after it.
    #[error("canonical log corrupt at offset {offset}: {message}")]
    CanonicalCorrupt {
        offset: u64,
        next: u64,
        message: String,
    },

    /// The index rejected a write. The canonical record stays authoritative.
    #[error("index write failed: {0}")]
    IndexWrite(#[source] sqlx::Error),

    #[error("index read failed: {0}")]
    IndexRead(#[source] sqlx::Error),

    /// The job state store (job definitions and runs) failed.
    #[error("state store failed: {0}")]
    State(#[source] sqlx::Error),

    /// A dedupe key is already bound to a different event id.
    #[error("dedupe key {key} is bound to event {existing}, refusing to rebind it to {attempted}")]
    DedupeConflict {
        key: String,
        existing: i64,
        attempted: i64,
    },

    #[error("job failed: {0}")]
    JobExecution(String),

    #[error("artifact write failed for {}: {source}", path.display())]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A query, job config, or request parameter was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OpsError>;

impl OpsError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            OpsError::LockUnavailable { .. } => "lock_unavailable",
            OpsError::CanonicalWrite(_) => "canonical_write",
            OpsError::CanonicalCorrupt { .. } => "canonical_corrupt",
            OpsError::IndexWrite(_) => "index_write",
            OpsError::IndexRead(_) => "index_read",
            OpsError::State(_) => "state_store",
            OpsError::DedupeConflict { .. } => "dedupe_conflict",
            OpsError::JobExecution(_) => "job_execution",
            OpsError::ArtifactWrite { .. } => "artifact_write",
            OpsError::InvalidRecord(_) => "invalid_record",
            OpsError::InvalidArgument(_) => "invalid_argument",
            OpsError::NotFound(_) => "not_found",
            OpsError::Config(_) => "config",
            OpsError::Io(_) => "io",
            OpsError::Json(_) => "json",
        }
    }

    /// True for errors that must stop the remainder of an ingest batch.
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(
            self,
            OpsError::CanonicalWrite(_) | OpsError::LockUnavailable { .. }
        )
    }

    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Serializable form of an error, used in results and HTTP bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
