//! In-memory priority task queue with per-recipient retrieval and a
//! bounded tracker of the slowest completed tasks.
//!
//! The queue is the one structure shared between the single-threaded
//! coordinator loop and the per-role runners, so every operation takes a
//! short, non-async lock and returns immediately. Nothing here touches disk
//! or the network; contents are lost when the process exits.
//!
//! ## Ordering and fairness
//!
//! Each recipient role has its own binary heap ordered by
//! `(priority, created_at, insertion sequence)`, lowest first. Ordering is
//! strict: a steady stream of urgent tasks will keep a low-priority task
//! waiting indefinitely. There is deliberately no aging. Dispatch volume is
//! bounded by the coordinator's fixed cycle interval, which keeps the
//! starvation window finite in practice.
//!
//! ## Retention
//!
//! A finished task stays pinned until its owner calls
//! [`TaskQueue::acknowledge`]. Only acknowledged tasks count as evictable, so
//! the `retained_tasks` bound can never hide an outcome nobody has read yet.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{AgentRole, Task, TaskId, TaskStatus, TaskSummary};

/// Largest accepted priority value (lower is more urgent). Wide enough to
/// carry backlog rank for unprioritized items.
pub const MAX_PRIORITY: u32 = 100_000;
/// Default capacity of the slowest-task tracker.
pub const DEFAULT_SLOWEST_CAPACITY: usize = 100;
/// Default number of finished tasks whose metadata is retained.
pub const DEFAULT_RETAINED_TASKS: usize = 500;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
    #[error("invalid priority {0}: must be between 1 and {MAX_PRIORITY}")]
    InvalidPriority(u32),

    #[error("tasks cannot be addressed to the {0} role")]
    InvalidRecipient(AgentRole),

    #[error("task {0} is already queued or running")]
    Duplicate(TaskId),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("task {id} already finished with status {status:?}")]
    AlreadyFinished { id: TaskId, status: TaskStatus },
}

pub type Result<T> = std::result::Result<T, QueueError>;

// ---------------------------------------------------------------------------
// Heap entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: u32,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SlowEntry {
    duration_ms: u64,
    seq: u64,
    summary: TaskSummary,
}

impl Ord for SlowEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.duration_ms
            .cmp(&other.duration_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for SlowEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Top-K capacity of the slowest-task tracker.
    pub slowest_capacity: usize,
    /// How many acknowledged finished tasks keep their metadata before
    /// eviction.
    pub retained_tasks: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            slowest_capacity: DEFAULT_SLOWEST_CAPACITY,
            retained_tasks: DEFAULT_RETAINED_TASKS,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, Task>,
    /// Sequence of the live heap entry per queued task; older entries are stale.
    live_seq: HashMap<TaskId, u64>,
    pending: HashMap<AgentRole, BinaryHeap<Reverse<QueueEntry>>>,
    queued_by_role: HashMap<AgentRole, usize>,
    next_seq: u64,
    /// Min-heap so the fastest of the tracked slow tasks is evicted first.
    slowest: BinaryHeap<Reverse<SlowEntry>>,
    finished: VecDeque<TaskId>,
    /// Finished tasks whose outcome has not been acknowledged; never evicted.
    unacknowledged: HashSet<TaskId>,
}

impl QueueState {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn leave_queued(&mut self, role: AgentRole) {
        if let Some(count) = self.queued_by_role.get_mut(&role) {
            *count = count.saturating_sub(1);
        }
    }

    fn record_finished(&mut self, id: TaskId, retained: usize) {
        self.finished.push_back(id);
        self.unacknowledged.insert(id);
        self.evict_finished(retained);
    }

    /// Drop the oldest acknowledged finished tasks beyond `retained`.
    fn evict_finished(&mut self, retained: usize) {
        while self.finished.len() > retained {
            let Some(pos) = self
                .finished
                .iter()
                .position(|id| !self.unacknowledged.contains(id))
            else {
                break;
            };
            let Some(oldest) = self.finished.remove(pos) else {
                break;
            };
            let evict = self
                .tasks
                .get(&oldest)
                .map(|t| t.status.is_terminal())
                .unwrap_or(false);
            if evict {
                self.tasks.remove(&oldest);
                self.live_seq.remove(&oldest);
            }
        }
    }

    /// A resubmitted id is live again and no longer part of the finished log.
    fn forget_finished(&mut self, id: TaskId) {
        if self.tasks.contains_key(&id) {
            self.unacknowledged.remove(&id);
            self.finished.retain(|f| *f != id);
        }
    }
}

/// Thread-safe priority queue shared by the coordinator and role runners.
pub struct TaskQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Validate and enqueue a task, returning its id.
    ///
    /// A nil `task_id` is replaced by a fresh one. Resubmitting the id of a
    /// finished task (a retry) replaces its metadata; resubmitting the id of
    /// a task that is still queued or running is rejected.
    pub fn submit(&self, mut task: Task) -> Result<TaskId> {
        if task.priority == 0 || task.priority > MAX_PRIORITY {
            return Err(QueueError::InvalidPriority(task.priority));
        }
        if task.recipient_role == AgentRole::Coordinator {
            return Err(QueueError::InvalidRecipient(task.recipient_role));
        }
        if task.task_id.is_nil() {
            task.task_id = Uuid::new_v4();
        }

        let mut state = self.state.lock();
        if let Some(existing) = state.tasks.get(&task.task_id) {
            if existing.status.is_active() {
                return Err(QueueError::Duplicate(task.task_id));
            }
        }

        let id = task.task_id;
        let role = task.recipient_role;
        task.status = TaskStatus::Queued;
        task.started_at = None;
        task.completed_at = None;
        task.duration_ms = None;

        state.forget_finished(id);
        let seq = state.bump_seq();
        let entry = QueueEntry {
            priority: task.priority,
            created_at: task.created_at,
            seq,
            task_id: id,
        };
        debug!(task_id = %id, role = %role, priority = task.priority, task_type = %task.task_type, "task submitted");

        state.live_seq.insert(id, seq);
        state.tasks.insert(id, task);
        state.pending.entry(role).or_default().push(Reverse(entry));
        *state.queued_by_role.entry(role).or_insert(0) += 1;
        Ok(id)
    }

    /// Claim the most urgent queued task for `role`, marking it `Running`.
    ///
    /// `None` means no work is available right now; it is not an error.
    pub fn next(&self, role: AgentRole) -> Option<Task> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let heap = state.pending.get_mut(&role)?;

        while let Some(Reverse(entry)) = heap.pop() {
            if state.live_seq.get(&entry.task_id) != Some(&entry.seq) {
                continue;
            }
            let Some(task) = state.tasks.get_mut(&entry.task_id) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }

            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            let claimed = task.clone();
            state.live_seq.remove(&entry.task_id);
            state.leave_queued(role);
            debug!(task_id = %claimed.task_id, role = %role, "task claimed");
            return Some(claimed);
        }
        None
    }

    /// Mark a task complete and feed its duration to the bottleneck tracker.
    pub fn mark_completed(&self, task_id: TaskId, duration_ms: u64) -> Result<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::UnknownTask(task_id))?;
        if task.status.is_terminal() {
            return Err(QueueError::AlreadyFinished {
                id: task_id,
                status: task.status,
            });
        }

        let was_queued = task.status == TaskStatus::Queued;
        let role = task.recipient_role;
        task.status = TaskStatus::Complete;
        task.completed_at = Some(Utc::now());
        task.duration_ms = Some(duration_ms);
        task.error = None;
        let summary = task.summary();

        if was_queued {
            state.leave_queued(role);
        }

        let seq = state.bump_seq();
        state.slowest.push(Reverse(SlowEntry {
            duration_ms,
            seq,
            summary,
        }));
        while state.slowest.len() > self.config.slowest_capacity {
            state.slowest.pop();
        }

        state.record_finished(task_id, self.config.retained_tasks);
        Ok(())
    }

    /// Mark a task failed. Retrying is the coordinator's decision.
    pub fn mark_failed(&self, task_id: TaskId, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::UnknownTask(task_id))?;
        if task.status.is_terminal() {
            return Err(QueueError::AlreadyFinished {
                id: task_id,
                status: task.status,
            });
        }

        let was_queued = task.status == TaskStatus::Queued;
        let role = task.recipient_role;
        let now = Utc::now();
        task.status = TaskStatus::Failed;
        task.completed_at = Some(now);
        task.duration_ms = task
            .started_at
            .map(|s| now.signed_duration_since(s).num_milliseconds().max(0) as u64);
        warn!(task_id = %task_id, role = %role, error = %error, "task failed");
        task.error = Some(error);

        if was_queued {
            state.leave_queued(role);
        }
        state.record_finished(task_id, self.config.retained_tasks);
        Ok(())
    }

    /// Release a finished task's outcome for eviction.
    ///
    /// Returns `false` when the task was not waiting to be acknowledged.
    pub fn acknowledge(&self, task_id: TaskId) -> bool {
        let mut state = self.state.lock();
        let was_pending = state.unacknowledged.remove(&task_id);
        if was_pending {
            state.evict_finished(self.config.retained_tasks);
        }
        was_pending
    }

    /// Up to `limit` slowest completed tasks, longest first.
    pub fn slowest_tasks(&self, limit: usize) -> Vec<TaskSummary> {
        let state = self.state.lock();
        let mut entries: Vec<&SlowEntry> = state.slowest.iter().map(|Reverse(e)| e).collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .take(limit)
            .map(|e| e.summary.clone())
            .collect()
    }

    /// Number of tasks waiting to be claimed, across all roles.
    pub fn size(&self) -> usize {
        self.state.lock().queued_by_role.values().sum()
    }

    pub fn has_pending(&self, role: AgentRole) -> bool {
        self.state
            .lock()
            .queued_by_role
            .get(&role)
            .copied()
            .unwrap_or(0)
            > 0
    }

    /// A copy of the task's current metadata, if still retained.
    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.state.lock().tasks.get(&task_id).cloned()
    }

    /// All retained tasks currently in `status`.
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        self.state
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
