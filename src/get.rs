//! Event retrieval by id.
//!
//! Used by `ops show` and `GET /v1/events/{id}`. The index answers first; a
//! record the index has not caught up with yet is read from the canonical
//! log, which is authoritative.

use std::path::Path;
use tracing::debug;

use crate::canonical;
use crate::error::{OpsError, Result};
use crate::index::IndexStore;
use crate::models::EventRecord;

pub async fn get_event(index: &IndexStore, log_path: &Path, id: i64) -> Result<EventRecord> {
    if let Some(record) = index.get_event(id).await? {
        return Ok(record);
    }

    debug!(id, "event not in index, scanning canonical log");
    let log_path = log_path.to_path_buf();
    let found = tokio::task::spawn_blocking(move || canonical::find_in(&log_path, id))
        .await
        .map_err(|e| OpsError::Io(std::io::Error::other(e)))??;

    found.ok_or_else(|| OpsError::NotFound(format!("event {}", id)))
}
