use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::AgentRole;

/// Top-level configuration loaded from `~/.auto-foreman/config.toml`.
///
/// Every section defaults, so a file only needs the settings it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub backlog: BacklogConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl Config {
    /// Load config from the default location, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coordinator.validate()?;
        self.supervisor.validate()?;
        self.agents.validate()?;
        if self.backlog.lookahead_window == 0 {
            return Err(ConfigError::Validation(
                "backlog.lookahead_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".auto-foreman")
            .join("config.toml")
    }

    /// State directory with `~` expanded.
    pub fn state_dir(&self) -> PathBuf {
        expand_home(&self.general.state_dir)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir().join("snapshot.json")
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.state_dir().join("errors.log")
    }

    pub fn status_path(&self) -> PathBuf {
        self.state_dir().join("status.json")
    }

    pub fn lockfile_path(&self) -> PathBuf {
        self.state_dir().join("daemon.lock")
    }

    pub fn control_dir(&self) -> PathBuf {
        self.state_dir().join("control")
    }

    pub fn backlog_path(&self) -> PathBuf {
        expand_home(&self.backlog.path)
    }

    pub fn artifact_dir(&self) -> PathBuf {
        expand_home(&self.backlog.artifact_dir)
    }
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None if raw == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        None => Path::new(raw).to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            state_dir: default_state_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_state_dir() -> String {
    "~/.auto-foreman/state".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    #[serde(default = "default_backlog_path")]
    pub path: String,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
    /// How many of the next planned items are considered for artifact work.
    #[serde(default = "default_lookahead_window")]
    pub lookahead_window: usize,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            path: default_backlog_path(),
            artifact_dir: default_artifact_dir(),
            lookahead_window: default_lookahead_window(),
        }
    }
}

fn default_backlog_path() -> String {
    "BACKLOG.md".into()
}
fn default_artifact_dir() -> String {
    "designs".into()
}
fn default_lookahead_window() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Artifact-production tasks kept in flight ahead of implementation.
    #[serde(default = "default_lookahead_target")]
    pub lookahead_target: usize,
    #[serde(default = "default_max_implementations")]
    pub max_concurrent_implementations: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_secs: u64,
    /// Running tasks older than this are flagged, not killed.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_retained_tasks")]
    pub retained_tasks: usize,
    #[serde(default = "default_bottleneck_capacity")]
    pub bottleneck_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval(),
            lookahead_target: default_lookahead_target(),
            max_concurrent_implementations: default_max_implementations(),
            max_retries: default_max_retries(),
            retry_base_secs: default_retry_base(),
            retry_max_secs: default_retry_max(),
            task_timeout_secs: default_task_timeout(),
            retained_tasks: default_retained_tasks(),
            bottleneck_capacity: default_bottleneck_capacity(),
        }
    }
}

impl CoordinatorConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "coordinator.cycle_interval_secs must be positive".to_string(),
            ));
        }
        if self.lookahead_target == 0 {
            return Err(ConfigError::Validation(
                "coordinator.lookahead_target must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_implementations == 0 {
            return Err(ConfigError::Validation(
                "coordinator.max_concurrent_implementations must be at least 1".to_string(),
            ));
        }
        if self.bottleneck_capacity == 0 {
            return Err(ConfigError::Validation(
                "coordinator.bottleneck_capacity must be at least 1".to_string(),
            ));
        }
        if self.retained_tasks == 0 {
            return Err(ConfigError::Validation(
                "coordinator.retained_tasks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_cycle_interval() -> u64 {
    30
}
fn default_lookahead_target() -> usize {
    3
}
fn default_max_implementations() -> usize {
    1
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base() -> u64 {
    60
}
fn default_retry_max() -> u64 {
    3600
}
fn default_task_timeout() -> u64 {
    2 * 60 * 60
}
fn default_retained_tasks() -> usize {
    500
}
fn default_bottleneck_capacity() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
    /// A worker is unresponsive after this many missed heartbeat intervals.
    #[serde(default = "default_staleness_multiplier")]
    pub staleness_multiplier: u32,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Kill and restart workers that stay unresponsive.
    #[serde(default)]
    pub restart_unresponsive: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            jitter: true,
            heartbeat_interval_secs: default_heartbeat(),
            staleness_multiplier: default_staleness_multiplier(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            restart_unresponsive: false,
        }
    }
}

impl SupervisorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.heartbeat_interval() * self.staleness_multiplier
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "supervisor.heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        if self.staleness_multiplier == 0 {
            return Err(ConfigError::Validation(
                "supervisor.staleness_multiplier must be at least 1".to_string(),
            ));
        }
        if self.backoff_base_secs == 0 {
            return Err(ConfigError::Validation(
                "supervisor.backoff_base_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_restarts() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    5
}
fn default_backoff_max() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_heartbeat() -> u64 {
    30
}
fn default_staleness_multiplier() -> u32 {
    5
}
fn default_shutdown_timeout() -> u64 {
    10
}

/// Worker commands per role (`[agents.designer]`, `[agents.implementer]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub designer: Option<WorkerConfig>,
    #[serde(default)]
    pub implementer: Option<WorkerConfig>,
}

impl AgentsConfig {
    pub fn worker(&self, role: AgentRole) -> Option<&WorkerConfig> {
        match role {
            AgentRole::Designer => self.designer.as_ref(),
            AgentRole::Implementer => self.implementer.as_ref(),
            AgentRole::Coordinator => None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for role in AgentRole::workers() {
            if let Some(worker) = self.worker(role) {
                if worker.command.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "agents.{role}.command must not be empty"
                    )));
                }
                if worker.concurrency == 0 {
                    return Err(ConfigError::Validation(format!(
                        "agents.{role}.concurrency must be at least 1"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Runner loops pulling tasks for this role in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Command run for human-required alerts; title and message are
    /// appended as the last two arguments.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}
