//! Per-role runner loop: claim the next task for a role, execute it, and
//! record the outcome in the queue.

use std::sync::Arc;
use std::time::Duration;

use af_core::task_queue::TaskQueue;
use af_core::types::{AgentRole, TaskId};
use af_harness::shutdown::ShutdownSignal;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::executor::AgentExecutor;

/// Default pause between polls when there is nothing to do.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// No task queued for the role.
    Idle,
    /// The role's worker is not ready; nothing was claimed.
    Unavailable,
    Completed { task_id: TaskId, duration_ms: u64 },
    Failed { task_id: TaskId, error: String },
}

pub struct RoleRunner {
    role: AgentRole,
    slot: usize,
    queue: Arc<TaskQueue>,
    executor: Arc<dyn AgentExecutor>,
    idle_interval: Duration,
}

impl RoleRunner {
    pub fn new(role: AgentRole, queue: Arc<TaskQueue>, executor: Arc<dyn AgentExecutor>) -> Self {
        Self {
            role,
            slot: 0,
            queue,
            executor,
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }

    /// Index of this runner among the role's parallel runners (for logs).
    pub fn with_slot(mut self, slot: usize) -> Self {
        self.slot = slot;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    /// One claim/execute/record step. Never blocks waiting for work.
    pub async fn run_once(&self) -> RunOutcome {
        if !self.executor.is_ready(self.role).await {
            return RunOutcome::Unavailable;
        }
        let Some(task) = self.queue.next(self.role) else {
            return RunOutcome::Idle;
        };

        let task_id = task.task_id;
        debug!(role = %self.role, slot = self.slot, task_id = %task_id, item = %task.work_item_id, "executing task");
        let started = Instant::now();
        let result = self.executor.execute(self.role, &task).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(_) => {
                if let Err(e) = self.queue.mark_completed(task_id, duration_ms) {
                    warn!(role = %self.role, task_id = %task_id, error = %e, "could not record completion");
                }
                info!(role = %self.role, task_id = %task_id, duration_ms, "task complete");
                RunOutcome::Completed { task_id, duration_ms }
            }
            Err(e) => {
                let error = e.to_string();
                if let Err(qe) = self.queue.mark_failed(task_id, error.clone()) {
                    warn!(role = %self.role, task_id = %task_id, error = %qe, "could not record failure");
                }
                RunOutcome::Failed { task_id, error }
            }
        }
    }

    /// Poll until shutdown. A task already executing is finished before the
    /// loop exits; the drain guard is released on return.
    pub async fn run(self, shutdown: ShutdownSignal) {
        let _guard = shutdown.guard();
        info!(role = %self.role, slot = self.slot, "runner started");

        while !shutdown.is_shutting_down() {
            match self.run_once().await {
                RunOutcome::Idle | RunOutcome::Unavailable => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                RunOutcome::Completed { .. } | RunOutcome::Failed { .. } => {}
            }
        }

        info!(role = %self.role, slot = self.slot, "runner drained");
    }
}
