use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentHealth, AgentRole, TaskSummary};

/// Per-role line of the status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleStatus {
    pub role: AgentRole,
    pub state: String,
    pub health: AgentHealth,
    pub restart_count: u32,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub last_restart_at: Option<DateTime<Utc>>,
}

/// Point-in-time daemon status, rewritten by the coordinator every cycle and
/// read by `af status` / `af bottlenecks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub roles: Vec<RoleStatus>,
    #[serde(default)]
    pub queue_depth: usize,
    #[serde(default)]
    pub active_tasks: usize,
    #[serde(default)]
    pub deferred_retries: usize,
    #[serde(default)]
    pub permanently_failed: usize,
    #[serde(default)]
    pub backlog_items: usize,
    #[serde(default)]
    pub slowest_tasks: Vec<TaskSummary>,
}

impl StatusReport {
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(tmp, path)
    }

    pub fn read(path: &Path) -> std::io::Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
