//! Daemon lockfile guarding a state directory.
//!
//! `acquire()` creates `<state_dir>/daemon.lock` with `create_new`
//! (`O_CREAT | O_EXCL`), so of two daemons racing for the same state
//! directory exactly one wins. The CLI reads the same file to find the
//! daemon's pid for `status` and `stop`.
//!
//! A lockfile whose pid is no longer alive (crash, SIGKILL) is stale and is
//! removed automatically.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLockfile {
    pub pid: u32,
    pub started_at: String,
    pub state_dir: String,
    pub version: String,
}

/// Result of trying to acquire the lockfile.
pub enum AcquireResult {
    /// We created the lockfile and own it.
    Acquired,
    /// Another live daemon holds the lockfile.
    AlreadyRunning(DaemonLockfile),
    /// Stale lockfile was cleaned up; retry.
    StaleRemoved,
}

impl DaemonLockfile {
    /// Describe the current process.
    pub fn for_current_process(state_dir: &Path) -> Self {
        Self {
            pid: std::process::id(),
            started_at: chrono::Utc::now().to_rfc3339(),
            state_dir: state_dir.display().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Try to exclusively create and write the lockfile at `path`.
    pub fn acquire(&self, path: &Path) -> std::io::Result<AcquireResult> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match Self::read(path) {
                Some(existing) if existing.is_alive() => Ok(AcquireResult::AlreadyRunning(existing)),
                _ => {
                    tracing::info!(path = %path.display(), "removing stale daemon lockfile");
                    Self::remove(path);
                    Ok(AcquireResult::StaleRemoved)
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Acquire with one retry after stale cleanup.
    pub fn acquire_or_fail(&self, path: &Path) -> Result<(), String> {
        for attempt in 0..2 {
            match self.acquire(path) {
                Ok(AcquireResult::Acquired) => return Ok(()),
                Ok(AcquireResult::AlreadyRunning(existing)) => {
                    return Err(format!(
                        "daemon already running (pid={}, state_dir={})",
                        existing.pid, existing.state_dir
                    ));
                }
                Ok(AcquireResult::StaleRemoved) if attempt == 0 => continue,
                Ok(AcquireResult::StaleRemoved) => {
                    return Err("failed to acquire lockfile after stale cleanup".into());
                }
                Err(e) => return Err(format!("lockfile I/O error: {e}")),
            }
        }
        Err("lockfile acquire failed".into())
    }

    /// Read the lockfile. Returns `None` if missing or unparseable.
    pub fn read(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Read the lockfile and return it only if its pid is alive.
    pub fn read_valid(path: &Path) -> Option<Self> {
        let lock = Self::read(path)?;
        if lock.is_alive() {
            Some(lock)
        } else {
            tracing::info!(pid = lock.pid, "removing stale daemon lockfile (process not running)");
            Self::remove(path);
            None
        }
    }

    pub fn remove(path: &Path) {
        let _ = std::fs::remove_file(path);
    }

    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    /// Ask the daemon to shut down gracefully (SIGTERM).
    pub fn request_stop(&self) -> std::io::Result<()> {
        send_terminate(self.pid)
    }
}

/// Remove the lockfile when dropped.
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        DaemonLockfile::remove(&self.path);
    }
}

/// Check if a process with the given pid is alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> std::io::Result<()> {
    // SAFETY: plain signal delivery to a pid read from our own lockfile.
    let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are not supported on this platform",
    ))
}
