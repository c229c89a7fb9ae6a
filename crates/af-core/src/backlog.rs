//! Reader for the shared Markdown backlog document.
//!
//! Each entry is a level-two heading followed by `key: value` lines:
//!
//! ```text
//! ## 12: Retry transient fetch failures
//! - status: planned
//! - priority: 2
//! - artifact: designs/retry.md
//! ```
//!
//! Change detection compares the file's modification time only; the
//! document is re-read in full when it changes. Entries that cannot be
//! parsed are skipped with a warning.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::types::{LifecycleStatus, WorkItem};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BacklogError {
    /// The backlog file could not be read (missing, locked, mid-rewrite).
    #[error("backlog {path} unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The directory that should contain the backlog is gone or forbidden.
    #[error("backlog location {0} is inaccessible")]
    LocationInaccessible(PathBuf),
}

impl BacklogError {
    /// Whether retrying on a later cycle can plausibly succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, BacklogError::LocationInaccessible(_))
    }
}

/// Largest priority an entry may set explicitly.
pub const MAX_EXPLICIT_PRIORITY: u32 = 999;
/// Entries without a priority rank after every explicit one, in document
/// order.
const UNRANKED_PRIORITY_BASE: u32 = MAX_EXPLICIT_PRIORITY + 1;

// ---------------------------------------------------------------------------
// Line patterns
// ---------------------------------------------------------------------------

static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+(?P<id>[A-Za-z0-9][A-Za-z0-9_.\-]*)\s*:\s*(?P<title>.*?)\s*$")
        .expect("valid heading pattern")
});

static FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*]\s*)?(?P<key>status|priority|artifact)\s*:\s*(?P<value>.*?)\s*$")
        .expect("valid field pattern")
});

#[derive(Debug, Default)]
struct RawEntry {
    line: usize,
    id: String,
    title: String,
    status: Option<String>,
    priority: Option<String>,
    artifact: Option<String>,
}

// ---------------------------------------------------------------------------
// BacklogReader
// ---------------------------------------------------------------------------

pub struct BacklogReader {
    path: PathBuf,
    artifact_dir: PathBuf,
    last_seen: Option<SystemTime>,
}

impl BacklogReader {
    pub fn new(path: impl Into<PathBuf>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            artifact_dir: artifact_dir.into(),
            last_seen: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Modification time recorded by the last successful [`parse`](Self::parse).
    pub fn last_seen_mtime(&self) -> Option<DateTime<Utc>> {
        self.last_seen.map(DateTime::<Utc>::from)
    }

    /// Seed the last-seen modification time, e.g. from a snapshot.
    pub fn set_last_seen_mtime(&mut self, mtime: Option<DateTime<Utc>>) {
        self.last_seen = mtime.map(SystemTime::from);
    }

    /// Forget the last-seen time so the next check reports a change.
    pub fn invalidate(&mut self) {
        self.last_seen = None;
    }

    /// Compare the document's mtime with the last-seen value. Does not parse.
    pub fn has_changed(&self) -> Result<bool, BacklogError> {
        let mtime = self.current_mtime()?;
        Ok(self.last_seen != Some(mtime))
    }

    /// Read and parse the whole document.
    pub fn parse(&mut self) -> Result<Vec<WorkItem>, BacklogError> {
        // Capture the mtime before reading so a concurrent rewrite is seen
        // as a change on the next check.
        let mtime = self.current_mtime()?;
        let text = std::fs::read_to_string(&self.path).map_err(|source| self.read_error(source))?;
        let items = self.parse_str(&text);
        self.last_seen = Some(mtime);
        debug!(path = %self.path.display(), items = items.len(), "backlog parsed");
        Ok(items)
    }

    /// Parse backlog text without touching change tracking.
    pub fn parse_str(&self, text: &str) -> Vec<WorkItem> {
        let mut raw: Vec<RawEntry> = Vec::new();
        // Whether field lines currently belong to the last entry.
        let mut open = false;

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            if line.starts_with("## ") || line == "##" {
                match HEADING.captures(line) {
                    Some(caps) => {
                        raw.push(RawEntry {
                            line: line_no,
                            id: caps["id"].to_string(),
                            title: caps["title"].to_string(),
                            ..RawEntry::default()
                        });
                        open = true;
                    }
                    None => {
                        warn!(line = line_no, "skipping backlog entry with malformed heading");
                        open = false;
                    }
                }
                continue;
            }
            // Any other heading level closes the current entry.
            if line.starts_with('#') {
                open = false;
                continue;
            }
            if !open {
                continue;
            }

            let Some(current) = raw.last_mut() else {
                continue;
            };
            if let Some(caps) = FIELD.captures(line) {
                let value = caps["value"].to_string();
                match caps["key"].to_ascii_lowercase().as_str() {
                    "status" => current.status = Some(value),
                    "priority" => current.priority = Some(value),
                    "artifact" => current.artifact = Some(value).filter(|v| !v.is_empty()),
                    _ => {}
                }
            }
        }

        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for (position, entry) in raw.into_iter().enumerate() {
            match self.build_item(&entry, position) {
                Ok(item) => {
                    if !seen.insert(item.id.clone()) {
                        warn!(line = entry.line, id = %item.id, "skipping duplicate backlog id");
                        continue;
                    }
                    items.push(item);
                }
                Err(reason) => {
                    warn!(line = entry.line, id = %entry.id, reason = %reason, "skipping malformed backlog entry");
                }
            }
        }

        // Stable sort keeps document order within equal priorities.
        items.sort_by_key(|item| item.priority);
        items
    }

    fn build_item(&self, entry: &RawEntry, position: usize) -> Result<WorkItem, String> {
        if entry.title.is_empty() {
            return Err("empty title".into());
        }
        let marker = entry.status.as_deref().ok_or("missing status")?;
        let lifecycle_status =
            LifecycleStatus::from_marker(marker).ok_or_else(|| format!("unknown status {marker:?}"))?;
        let priority = match entry.priority.as_deref() {
            Some(p) => p
                .parse::<u32>()
                .ok()
                .filter(|n| (1..=MAX_EXPLICIT_PRIORITY).contains(n))
                .ok_or_else(|| format!("invalid priority {p:?} (expected 1..={MAX_EXPLICIT_PRIORITY})"))?,
            None => UNRANKED_PRIORITY_BASE + position as u32,
        };

        let mut item = WorkItem {
            id: entry.id.clone(),
            title: entry.title.clone(),
            lifecycle_status,
            has_artifact: false,
            artifact_ref: entry.artifact.clone(),
            priority,
        };
        item.has_artifact = self.artifact_exists(&item);
        Ok(item)
    }

    /// Where the artifact for `item` lives (or will live).
    pub fn artifact_path(&self, item: &WorkItem) -> PathBuf {
        match &item.artifact_ref {
            Some(reference) => {
                let p = Path::new(reference);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    self.artifact_dir.join(p)
                }
            }
            None => self.artifact_dir.join(format!("{}.md", item.id)),
        }
    }

    /// Existence test against artifact storage. Never reads contents.
    pub fn artifact_exists(&self, item: &WorkItem) -> bool {
        self.artifact_path(item).exists()
    }

    fn current_mtime(&self) -> Result<SystemTime, BacklogError> {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|source| self.read_error(source))
    }

    fn read_error(&self, source: std::io::Error) -> BacklogError {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let parent_gone = !parent.is_dir();
        if parent_gone || source.kind() == std::io::ErrorKind::PermissionDenied {
            BacklogError::LocationInaccessible(self.path.clone())
        } else {
            BacklogError::Unreadable {
                path: self.path.clone(),
                source,
            }
        }
    }
}
