//! Crash-recovery snapshot of coordinator state.
//!
//! Written once per cycle with a temp-file-and-rename so a crash mid-write
//! leaves the previous snapshot intact. Every field has a serde default and
//! unknown fields are ignored, so older and newer daemons can read each
//! other's files.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Task, TaskId, TaskType, WorkItem};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "Utc::now")]
    pub saved_at: DateTime<Utc>,
    /// Tasks that were queued, running, or waiting for a retry at save time.
    #[serde(default)]
    pub active_tasks: BTreeMap<TaskId, Task>,
    #[serde(default)]
    pub backlog_cache: Vec<WorkItem>,
    #[serde(default)]
    pub backlog_last_seen_mtime: Option<DateTime<Utc>>,
    /// Work item / task type pairs that exhausted their retries.
    #[serde(default)]
    pub escalated: BTreeSet<(String, TaskType)>,
    /// Items whose artifact task completed.
    #[serde(default)]
    pub artifacts_ready: BTreeSet<String>,
    /// Items whose implementation finished but the backlog still lists as planned.
    #[serde(default)]
    pub implemented: BTreeSet<String>,
    /// Earliest resubmission time for tasks waiting out a retry backoff.
    #[serde(default)]
    pub retry_not_before: BTreeMap<TaskId, DateTime<Utc>>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            saved_at: Utc::now(),
            active_tasks: BTreeMap::new(),
            backlog_cache: Vec::new(),
            backlog_last_seen_mtime: None,
            escalated: BTreeSet::new(),
            artifacts_ready: BTreeSet::new(),
            implemented: BTreeSet::new(),
            retry_not_before: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> SnapshotError {
        SnapshotError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Atomically replace the snapshot on disk.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        debug!(
            path = %self.path.display(),
            active_tasks = snapshot.active_tasks.len(),
            "snapshot written"
        );
        Ok(())
    }

    /// Load the snapshot. Returns `None` when no snapshot exists yet.
    pub fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| SnapshotError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Move an unreadable snapshot out of the way so the next save succeeds
    /// and the bad file stays around for inspection.
    pub fn quarantine(&self) -> Result<PathBuf, SnapshotError> {
        let target = self.path.with_extension("json.corrupt");
        std::fs::rename(&self.path, &target).map_err(|e| self.io_err(e))?;
        warn!(from = %self.path.display(), to = %target.display(), "corrupt snapshot moved aside");
        Ok(target)
    }
}
