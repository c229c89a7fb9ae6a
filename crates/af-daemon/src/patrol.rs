use std::time::Duration;

use af_core::types::{AgentRole, Task, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A task that has been `Running` longer than the configured timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrun {
    pub task_id: TaskId,
    pub role: AgentRole,
    pub work_item_id: String,
    pub started_at: DateTime<Utc>,
    pub running_for: Duration,
}

/// Result of a single patrol sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatrolReport {
    /// Running tasks inspected.
    pub running: usize,
    pub overruns: Vec<Overrun>,
}

/// Flags long-running tasks. Overruns are reported, never cancelled: the
/// external call may not be interruptible.
pub struct PatrolRunner {
    task_timeout: Duration,
}

impl PatrolRunner {
    pub fn new(task_timeout: Duration) -> Self {
        Self { task_timeout }
    }

    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    /// Inspect `tasks` as of `now`. Tasks that are not `Running` or have no
    /// start stamp are ignored.
    pub fn sweep<'a>(&self, tasks: impl IntoIterator<Item = &'a Task>, now: DateTime<Utc>) -> PatrolReport {
        let mut report = PatrolReport::default();
        for task in tasks {
            if task.status != TaskStatus::Running {
                continue;
            }
            let Some(started_at) = task.started_at else {
                continue;
            };
            report.running += 1;

            // Clock skew can make this negative; treat that as just started.
            let running_for = now
                .signed_duration_since(started_at)
                .to_std()
                .unwrap_or_default();
            if running_for > self.task_timeout {
                info!(
                    task_id = %task.task_id,
                    role = %task.recipient_role,
                    item = %task.work_item_id,
                    running_mins = running_for.as_secs() / 60,
                    "overrunning task detected"
                );
                report.overruns.push(Overrun {
                    task_id: task.task_id,
                    role: task.recipient_role,
                    work_item_id: task.work_item_id.clone(),
                    started_at,
                    running_for,
                });
            }
        }
        debug!(running = report.running, overruns = report.overruns.len(), "patrol sweep complete");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_core::types::TaskType;
    use uuid::Uuid;

    fn running(item: &str, started_mins_ago: i64, now: DateTime<Utc>) -> Task {
        let mut task = Task::new(TaskType::ConsumeArtifact, item, 1);
        task.task_id = Uuid::new_v4();
        task.status = TaskStatus::Running;
        task.started_at = Some(now - chrono::Duration::minutes(started_mins_ago));
        task
    }

    #[test]
    fn flags_only_running_tasks_past_timeout() {
        let now = Utc::now();
        let slow = running("1", 180, now);
        let fast = running("2", 5, now);
        let mut queued = running("3", 500, now);
        queued.status = TaskStatus::Queued;

        let patrol = PatrolRunner::new(Duration::from_secs(2 * 60 * 60));
        let report = patrol.sweep([&slow, &fast, &queued], now);

        assert_eq!(report.running, 2);
        assert_eq!(report.overruns.len(), 1);
        assert_eq!(report.overruns[0].task_id, slow.task_id);
        assert_eq!(report.overruns[0].role, AgentRole::Implementer);
        assert!(report.overruns[0].running_for >= Duration::from_secs(180 * 60));
    }

    #[test]
    fn future_start_is_not_an_overrun() {
        let now = Utc::now();
        let skewed = running("1", -10, now);
        let report = PatrolRunner::new(Duration::ZERO).sweep([&skewed], now);
        assert!(report.overruns.is_empty());
    }
}
