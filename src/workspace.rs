//! The workspace handle.
//!
//! A [`Workspace`] is the single owner of everything that mutates a workspace
//! directory: the lock, the canonical log, the index and the job state store.
//! It exists only while the lock is held, so holding a `&mut Workspace` is the
//! write critical section. The daemon keeps one for its lifetime behind a
//! mutex; the fallback path opens one per operation.
//!
//! ```text
//! <root>/
//!   canonical/events.jsonl    canonical log
//!   canonical/.ops.lock       workspace lock (shared by daemon and fallback)
//!   index/ops.sqlite          derived index
//!   state/ops-state.sqlite    jobs and job runs
//!   artifacts/                job output
//! ```

use chrono::FixedOffset;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::canonical::CanonicalLog;
use crate::config::Config;
use crate::error::{OpsError, Result};
use crate::get;
use crate::index::{IndexStore, RebuildReport};
use crate::jobs::JobStore;
use crate::lock::WorkspaceLock;
use crate::models::EventRecord;
use crate::search::{self, SearchHit, SearchQuery};

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub log: PathBuf,
    pub lock: PathBuf,
    pub index_db: PathBuf,
    pub state_db: PathBuf,
    pub artifacts: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            log: root.join("canonical").join("events.jsonl"),
            lock: root.join("canonical").join(".ops.lock"),
            index_db: root.join("index").join("ops.sqlite"),
            state_db: root.join("state").join("ops-state.sqlite"),
            artifacts: root.join("artifacts"),
        }
    }
}

pub struct Workspace {
    config: Config,
    tz: FixedOffset,
    paths: WorkspacePaths,
    _lock: WorkspaceLock,
    pub(crate) log: CanonicalLog,
    pub(crate) index: IndexStore,
    jobs: JobStore,
    pub(crate) next_id: i64,
    /// Dedupe keys of canonical records the index does not cover yet.
    pub(crate) pending: HashMap<String, i64>,
}

impl Workspace {
    /// Takes the workspace lock (waiting at most `lock_timeout`) and opens the
    /// log, index and state store under it.
    pub async fn open(config: &Config, lock_timeout: Duration) -> Result<Self> {
        let tz = config
            .timezone()
            .map_err(|e| OpsError::Config(e.to_string()))?;
        let paths = WorkspacePaths::new(&config.workspace.root);

        let lock = WorkspaceLock::acquire(&paths.lock, lock_timeout).await?;
        let log = CanonicalLog::open(&paths.log)?;
        let index = IndexStore::open(&paths.index_db).await?;
        let jobs = JobStore::open(&paths.state_db).await?;
        std::fs::create_dir_all(&paths.artifacts)?;

        let mut workspace = Self {
            config: config.clone(),
            tz,
            paths,
            _lock: lock,
            log,
            index,
            jobs,
            next_id: 1,
            pending: HashMap::new(),
        };
        workspace.scan_unindexed().await?;

        info!(
            root = %workspace.paths.root.display(),
            canonical_len = workspace.log.len(),
            next_id = workspace.next_id,
            unindexed = workspace.pending.len(),
            "workspace opened"
        );
        Ok(workspace)
    }

    /// Reads the log tail past the index position to learn the next id and
    /// the dedupe keys the index cannot answer for.
    ///
    /// An unreadable index state counts as position 0: the whole log is then
    /// treated as unindexed, which keeps ids and dedupe answers correct.
    async fn scan_unindexed(&mut self) -> Result<()> {
        let (position, mut last_id) = match self.index.state().await {
            Ok(state) if state.position > self.log.len() => {
                warn!(
                    position = state.position,
                    canonical_len = self.log.len(),
                    "index position is past the end of the canonical log"
                );
                (0, 0)
            }
            Ok(state) => (state.position, state.last_id),
            Err(e) => {
                warn!(error = %e, "index state unreadable, scanning the whole log");
                (0, 0)
            }
        };

        self.pending.clear();
        for entry in self.log.read_from(position)? {
            match entry {
                Ok(entry) => {
                    last_id = last_id.max(entry.record.id);
                    self.pending
                        .entry(entry.record.dedupe_key)
                        .or_insert(entry.record.id);
                }
                Err(e) => warn!(error = %e, "skipping unreadable canonical line"),
            }
        }
        self.next_id = last_id + 1;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn timezone(&self) -> FixedOffset {
        self.tz
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn canonical_len(&self) -> u64 {
        self.log.len()
    }

    /// Existing id for a dedupe key, from the index or the unindexed tail.
    pub async fn lookup_by_dedupe_key(&self, key: &str) -> Result<Option<i64>> {
        if let Some(id) = self.pending.get(key) {
            return Ok(Some(*id));
        }
        self.index.lookup_by_dedupe_key(key).await
    }

    /// Rebuilds the index from the log. The unindexed tail is rescanned even
    /// when the rebuild fails part way, since a wipe may already have dropped
    /// dedupe keys the index was answering for.
    pub async fn rebuild(&mut self, wipe: bool) -> Result<RebuildReport> {
        let report = self.index.rebuild(&self.log, wipe).await;
        let rescan = self.scan_unindexed().await;
        let report = report?;
        rescan?;
        Ok(report)
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        search::search(
            &self.index,
            query,
            self.config.index.snippet_tokens,
            self.config.index.default_limit,
        )
        .await
    }

    pub async fn show(&self, id: i64) -> Result<EventRecord> {
        get::get_event(&self.index, &self.paths.log, id).await
    }

    /// Closes the databases and releases the lock.
    pub async fn close(self) {
        self.index.close().await;
        self.jobs.close().await;
    }
}
