//! File-drop inbox for operator requests to a running daemon.
//!
//! The CLI creates an empty marker file; the coordinator picks markers up on
//! its next cycle and deletes them.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::types::AgentRole;

const RESET_PREFIX: &str = "reset-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Clear a `GivenUp` role and spawn it fresh.
    Reset(AgentRole),
}

pub struct ControlInbox {
    dir: PathBuf,
}

impl ControlInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Drop a request for the daemon to pick up.
    pub fn post(&self, request: ControlRequest) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = match request {
            ControlRequest::Reset(role) => self.dir.join(format!("{RESET_PREFIX}{role}")),
        };
        std::fs::write(&path, b"")?;
        Ok(path)
    }

    /// Consume all pending requests. Unrecognised files are removed with a
    /// warning.
    pub fn drain(&self) -> std::io::Result<Vec<ControlRequest>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut requests = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let parsed = name
                .strip_prefix(RESET_PREFIX)
                .and_then(|role| role.parse::<AgentRole>().ok())
                .map(ControlRequest::Reset);
            match parsed {
                Some(request) => requests.push(request),
                None => warn!(file = %path.display(), "ignoring unknown control request"),
            }
            std::fs::remove_file(&path)?;
        }
        requests.sort_by_key(|ControlRequest::Reset(role)| *role);
        Ok(requests)
    }
}
