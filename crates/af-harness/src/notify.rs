//! Notification sink.
//!
//! The daemon raises `requires_human` only for retry exhaustion, a role
//! that gave up restarting, and fatal coordinator errors. Everything else is
//! informational and goes to the log.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub requires_human: bool,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(title, message, Severity::Info, false)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(title, message, Severity::Warning, false)
    }

    /// A high-severity alert that needs an operator decision.
    pub fn escalation(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(title, message, Severity::Critical, true)
    }

    fn build(
        title: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        requires_human: bool,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
            requires_human,
            timestamp: Utc::now(),
        }
    }
}

/// Delivery must never fail the caller; implementations log their own
/// transport errors.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

// ---------------------------------------------------------------------------
// LogNotifier
// ---------------------------------------------------------------------------

/// Writes every notification to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: Notification) {
        match n.severity {
            Severity::Info => info!(title = %n.title, requires_human = n.requires_human, "{}", n.message),
            Severity::Warning => warn!(title = %n.title, requires_human = n.requires_human, "{}", n.message),
            Severity::Critical => error!(title = %n.title, requires_human = n.requires_human, "{}", n.message),
        }
    }
}

// ---------------------------------------------------------------------------
// CommandNotifier
// ---------------------------------------------------------------------------

/// Logs every notification and additionally runs an external command for
/// the ones that need a human. Title and message are appended as the last
/// two arguments.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
}

impl CommandNotifier {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, n: Notification) {
        LogNotifier.notify(n.clone()).await;
        if !n.requires_human {
            return;
        }

        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&n.title)
            .arg(&n.message)
            .env("AF_SEVERITY", n.severity.to_string())
            .stdin(std::process::Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => warn!(program = %self.program, status = %s, "notification command failed"),
            Err(e) => warn!(program = %self.program, error = %e, "notification command could not run"),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryNotifier
// ---------------------------------------------------------------------------

/// Records notifications in memory. Clones share the same record.
#[derive(Debug, Default, Clone)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn requiring_human(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.requires_human)
            .cloned()
            .collect()
    }

    pub fn count_titled(&self, title: &str) -> usize {
        self.sent.lock().iter().filter(|n| n.title == title).count()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}
