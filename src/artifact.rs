//! Artifact files written by jobs.
//!
//! Writes go to a hidden temp file in the destination directory, are synced,
//! and are then renamed to the final name. The final path therefore either
//! does not exist or holds the complete content. Only after [`write_atomic`]
//! returns may anything reference the file.
//!
//! An existing final path is never replaced, since an earlier
//! `artifact.created` event may record its hash. Callers pick unique names.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::dedupe::sha256_hex;
use crate::error::{OpsError, Result};
use crate::index::IndexStore;
use crate::models::{EventRecord, ARTIFACT_CREATED};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

pub fn write_atomic(dir: &Path, name: &str, contents: &[u8]) -> Result<ArtifactFile> {
    let final_path = dir.join(name);
    let tmp_path = dir.join(format!(".{}.tmp-{}", name, std::process::id()));
    let wrap = |path: &Path, source: std::io::Error| OpsError::ArtifactWrite {
        path: path.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(|e| wrap(dir, e))?;
    // Callers hold the workspace lock, so nothing else creates it meanwhile.
    if final_path.exists() {
        return Err(wrap(
            &final_path,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "artifact already exists"),
        ));
    }

    let written = File::create(&tmp_path).and_then(|mut file| {
        file.write_all(contents)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(wrap(&tmp_path, e));
    }

    if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(wrap(&final_path, e));
    }
    // Persist the rename itself
    #[cfg(unix)]
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| wrap(dir, e))?;

    debug!(path = %final_path.display(), bytes = contents.len(), "artifact written");
    Ok(ArtifactFile {
        path: final_path,
        sha256: sha256_hex(contents),
        bytes: contents.len() as u64,
    })
}

/// An `artifact.created` event as listed by `ops artifacts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub event_id: i64,
    pub path: String,
    pub kind: String,
    pub job: Option<String>,
    pub sha256: Option<String>,
    pub created_at: String,
}

impl ArtifactEntry {
    pub fn from_record(record: &EventRecord) -> Option<Self> {
        if record.event_type != ARTIFACT_CREATED {
            return None;
        }
        let path = record.content.get("path")?.as_str()?.to_string();
        Some(Self {
            event_id: record.id,
            kind: artifact_kind(&path).to_string(),
            job: record.content.get("job").and_then(|v| v.as_str()).map(String::from),
            sha256: record
                .content
                .get("sha256")
                .and_then(|v| v.as_str())
                .map(String::from),
            created_at: record.ts.to_rfc3339(),
            path,
        })
    }
}

/// Newest first.
pub async fn list_artifacts(index: &IndexStore, limit: i64) -> Result<Vec<ArtifactEntry>> {
    let rows: Vec<String> =
        sqlx::query_scalar("SELECT record_json FROM events WHERE type = ? ORDER BY id DESC LIMIT ?")
            .bind(ARTIFACT_CREATED)
            .bind(limit)
            .fetch_all(index.pool())
            .await
            .map_err(OpsError::IndexRead)?;

    let mut entries = Vec::with_capacity(rows.len());
    for json in rows {
        let record: EventRecord = serde_json::from_str(&json)?;
        entries.extend(ArtifactEntry::from_record(&record));
    }
    Ok(entries)
}

pub fn artifact_kind(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("md") => "markdown",
        Some("json") => "json",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_leaves_only_final_file() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("artifacts").join("digests");

        let file = write_atomic(&dir, "daily.md", b"# hello\n").unwrap();
        assert_eq!(std::fs::read(&file.path).unwrap(), b"# hello\n");
        assert_eq!(file.bytes, 8);
        assert_eq!(file.sha256, sha256_hex(b"# hello\n"));

        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["daily.md"]);
    }

    #[test]
    fn test_write_atomic_refuses_existing() {
        let tmp = TempDir::new().unwrap();
        let first = write_atomic(tmp.path(), "a.json", b"{}").unwrap();

        let err = write_atomic(tmp.path(), "a.json", b"{\"v\":2}").unwrap_err();
        assert_eq!(err.code(), "artifact_write");
        assert_eq!(std::fs::read_to_string(&first.path).unwrap(), "{}");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_blocked_directory_is_an_artifact_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("digests");
        std::fs::write(&blocker, "not a directory").unwrap();

        let err = write_atomic(&blocker, "x.md", b"x").unwrap_err();
        assert_eq!(err.code(), "artifact_write");
    }

    #[test]
    fn test_kinds() {
        assert_eq!(artifact_kind("a/b.md"), "markdown");
        assert_eq!(artifact_kind("b.json"), "json");
        assert_eq!(artifact_kind("c.tar"), "other");
    }
}
