use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique task identifier, assigned on submission.
pub type TaskId = Uuid;

// ---------------------------------------------------------------------------
// AgentRole
// ---------------------------------------------------------------------------

/// Every participant that can send or receive a task.
///
/// `Coordinator` only ever sends; the worker roles each own one supervised
/// process and one logical queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coordinator,
    /// Artifact producer.
    Designer,
    /// Artifact consumer.
    Implementer,
}

impl AgentRole {
    /// Roles that run a supervised worker process.
    pub fn workers() -> [AgentRole; 2] {
        [AgentRole::Designer, AgentRole::Implementer]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Coordinator => "coordinator",
            AgentRole::Designer => "designer",
            AgentRole::Implementer => "implementer",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coordinator" => Ok(AgentRole::Coordinator),
            "designer" => Ok(AgentRole::Designer),
            "implementer" => Ok(AgentRole::Implementer),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskType / TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    ProduceArtifact,
    ConsumeArtifact,
}

impl TaskType {
    /// The worker role a task of this type is addressed to.
    pub fn recipient(&self) -> AgentRole {
        match self {
            TaskType::ProduceArtifact => AgentRole::Designer,
            TaskType::ConsumeArtifact => AgentRole::Implementer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ProduceArtifact => "produce-artifact",
            TaskType::ConsumeArtifact => "consume-artifact",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of dispatched work.
///
/// `task_id` is nil until the queue assigns one on submission. The work item
/// the task belongs to is carried in `work_item_id` so the coordinator can
/// enforce one in-flight task per item and task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub sender_role: AgentRole,
    pub recipient_role: AgentRole,
    pub task_type: TaskType,
    #[serde(default)]
    pub work_item_id: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    /// Build a new coordinator-originated task addressed to the role that
    /// handles `task_type`.
    pub fn new(task_type: TaskType, work_item_id: impl Into<String>, priority: u32) -> Self {
        Self {
            task_id: Uuid::nil(),
            sender_role: AgentRole::Coordinator,
            recipient_role: task_type.recipient(),
            task_type,
            work_item_id: work_item_id.into(),
            payload: serde_json::Map::new(),
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            status: TaskStatus::Queued,
            retry_count: 0,
            error: None,
        }
    }

    /// Attach a payload entry.
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Return a copy ready for resubmission: status back to `Queued`,
    /// timing fields cleared, `retry_count` preserved.
    pub fn requeued(&self) -> Self {
        Self {
            started_at: None,
            completed_at: None,
            duration_ms: None,
            status: TaskStatus::Queued,
            error: None,
            ..self.clone()
        }
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.task_id,
            task_type: self.task_type,
            recipient_role: self.recipient_role,
            work_item_id: self.work_item_id.clone(),
            duration_ms: self.duration_ms.unwrap_or(0),
            completed_at: self.completed_at,
        }
    }
}

/// Compact view of a finished task used for bottleneck reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub recipient_role: AgentRole,
    pub work_item_id: String,
    pub duration_ms: u64,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Planned,
    ArtifactInProgress,
    ImplementationInProgress,
    Done,
}

impl LifecycleStatus {
    /// Parse a backlog status marker. Returns `None` for unknown markers.
    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker.trim().to_ascii_lowercase().as_str() {
            "planned" | "todo" => Some(LifecycleStatus::Planned),
            "designing" | "artifact-in-progress" => Some(LifecycleStatus::ArtifactInProgress),
            "implementing" | "in-progress" | "implementation-in-progress" => {
                Some(LifecycleStatus::ImplementationInProgress)
            }
            "done" | "complete" => Some(LifecycleStatus::Done),
            _ => None,
        }
    }
}

/// One entry of the shared backlog. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub lifecycle_status: LifecycleStatus,
    pub has_artifact: bool,
    #[serde(default)]
    pub artifact_ref: Option<String>,
    /// Lower is more urgent.
    pub priority: u32,
}

impl WorkItem {
    pub fn is_planned(&self) -> bool {
        self.lifecycle_status == LifecycleStatus::Planned
    }
}

// ---------------------------------------------------------------------------
// AgentHealth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Healthy,
    /// Process exists but its last heartbeat is stale.
    Unresponsive,
    Dead,
}

impl fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentHealth::Healthy => "healthy",
            AgentHealth::Unresponsive => "unresponsive",
            AgentHealth::Dead => "dead",
        };
        f.write_str(label)
    }
}
