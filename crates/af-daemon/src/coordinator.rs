//! The continuous work loop.
//!
//! Each cycle reloads the backlog when it changed, collects finished tasks
//! from the queue, releases retries whose backoff expired, keeps the designer
//! up to `lookahead_target` artifacts ahead of the implementer, dispatches
//! implementation work for items whose artifact is ready, flags overrunning
//! tasks and finally persists a snapshot and a status report.
//!
//! The coordinator is driven by a single task and owns all of its state; the
//! only structure it shares with the runners is the [`TaskQueue`].

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use af_agents::supervisor::AgentSupervisor;
use af_core::backlog::{BacklogError, BacklogReader};
use af_core::config::Config;
use af_core::control::{ControlInbox, ControlRequest};
use af_core::error_log::ErrorLog;
use af_core::snapshot::{Snapshot, SnapshotError, SnapshotStore};
use af_core::status::{RoleStatus, StatusReport};
use af_core::task_queue::{QueueError, TaskQueue, MAX_PRIORITY};
use af_core::types::{AgentRole, LifecycleStatus, Task, TaskId, TaskStatus, TaskType, WorkItem};
use af_harness::backoff::Backoff;
use af_harness::notify::{Notification, Notifier};
use af_harness::shutdown::ShutdownSignal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::patrol::PatrolRunner;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("backlog: {0}")]
    Backlog(#[from] BacklogError),
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
}

impl CycleError {
    /// Fatal errors stop the daemon: a backlog location that is gone for
    /// good, or any I/O failure on the snapshot path. Everything else is
    /// logged and retried next cycle.
    pub fn is_fatal(&self) -> bool {
        match self {
            CycleError::Backlog(e) => e.is_permanent(),
            CycleError::Snapshot(_) => true,
            CycleError::Queue(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Settings and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub cycle_interval: Duration,
    /// Planned items considered for artifact production, from the top.
    pub lookahead_window: usize,
    pub lookahead_target: usize,
    pub max_concurrent_implementations: usize,
    pub max_retries: u32,
    pub retry_backoff: Backoff,
    pub task_timeout: Duration,
    /// Entries included in the status report's slowest-task list.
    pub bottleneck_capacity: usize,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        let c = &config.coordinator;
        Self {
            cycle_interval: c.cycle_interval(),
            lookahead_window: config.backlog.lookahead_window,
            lookahead_target: c.lookahead_target,
            max_concurrent_implementations: c.max_concurrent_implementations,
            max_retries: c.max_retries,
            retry_backoff: Backoff::new(
                Duration::from_secs(c.retry_base_secs),
                Duration::from_secs(c.retry_max_secs),
            ),
            task_timeout: c.task_timeout(),
            bottleneck_capacity: c.bottleneck_capacity,
        }
    }
}

/// What a single cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub backlog_reloaded: bool,
    pub artifacts_dispatched: usize,
    pub implementations_dispatched: usize,
    pub completed: usize,
    pub retries_scheduled: usize,
    pub retries_released: usize,
    pub escalated: usize,
    /// Active tasks the queue no longer knew and that were put back.
    pub resubmitted: usize,
    pub overruns: usize,
    /// Non-fatal errors hit during the cycle.
    pub errors: Vec<String>,
}

/// What startup reconciliation did with the previous run's snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Active tasks found in the snapshot.
    pub restored: usize,
    /// Tasks whose effect already happened while the daemon was down.
    pub reconciled: usize,
    pub resubmitted: usize,
    /// Tasks still waiting out a retry backoff.
    pub deferred: usize,
    /// Tasks for items the backlog no longer lists.
    pub dropped: usize,
    /// The snapshot was unreadable and moved aside.
    pub quarantined: bool,
}

/// Where a work item stands in the produce/consume pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemProgress {
    Planned,
    ArtifactDispatched,
    ArtifactReady,
    ImplementationDispatched,
    Done,
}

fn task_priority(item: &WorkItem) -> u32 {
    item.priority.clamp(1, MAX_PRIORITY)
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    settings: CoordinatorSettings,
    queue: Arc<TaskQueue>,
    supervisor: Arc<AgentSupervisor>,
    notifier: Arc<dyn Notifier>,
    backlog: BacklogReader,
    snapshots: SnapshotStore,
    error_log: ErrorLog,
    control: ControlInbox,
    status_path: PathBuf,
    patrol: PatrolRunner,

    items: Vec<WorkItem>,
    /// Tasks this coordinator dispatched that have not finished for good,
    /// including failed tasks waiting out a retry backoff.
    active: BTreeMap<TaskId, Task>,
    retry_not_before: BTreeMap<TaskId, DateTime<Utc>>,
    escalated: BTreeSet<(String, TaskType)>,
    artifacts_ready: BTreeSet<String>,
    implemented: BTreeSet<String>,
    overruns_flagged: HashSet<TaskId>,
    cycles: u64,
}

impl Coordinator {
    pub fn new(
        config: &Config,
        queue: Arc<TaskQueue>,
        supervisor: Arc<AgentSupervisor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let settings = CoordinatorSettings::from_config(config);
        Self {
            patrol: PatrolRunner::new(settings.task_timeout),
            settings,
            queue,
            supervisor,
            notifier,
            backlog: BacklogReader::new(config.backlog_path(), config.artifact_dir()),
            snapshots: SnapshotStore::new(config.snapshot_path()),
            error_log: ErrorLog::new(config.error_log_path()),
            control: ControlInbox::new(config.control_dir()),
            status_path: config.status_path(),
            items: Vec::new(),
            active: BTreeMap::new(),
            retry_not_before: BTreeMap::new(),
            escalated: BTreeSet::new(),
            artifacts_ready: BTreeSet::new(),
            implemented: BTreeSet::new(),
            overruns_flagged: HashSet::new(),
            cycles: 0,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Cached backlog items, most urgent first.
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn active_tasks(&self) -> impl Iterator<Item = &Task> {
        self.active.values()
    }

    pub fn deferred_retries(&self) -> usize {
        self.retry_not_before.len()
    }

    pub fn is_escalated(&self, item_id: &str, task_type: TaskType) -> bool {
        self.escalated.contains(&(item_id.to_string(), task_type))
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Load the previous run's snapshot and reconcile its active tasks with
    /// what happened while the daemon was down.
    ///
    /// A task whose effect is already visible (the artifact exists, the item
    /// left `Planned`) is completed locally instead of being dispatched again.
    /// Everything else goes back on the queue with its retry count intact.
    pub async fn restore(&mut self) -> Result<RestoreReport, CycleError> {
        let mut report = RestoreReport::default();
        let snapshot = match self.snapshots.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!(path = %self.snapshots.path().display(), "no snapshot, starting fresh");
                return Ok(report);
            }
            Err(e @ SnapshotError::Corrupt { .. }) => {
                warn!(error = %e, "snapshot unreadable, starting fresh");
                self.record_error(&format!("snapshot unreadable, starting fresh: {e}"));
                self.snapshots.quarantine()?;
                report.quarantined = true;
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        report.restored = snapshot.active_tasks.len();
        self.items = snapshot.backlog_cache;
        self.backlog.set_last_seen_mtime(snapshot.backlog_last_seen_mtime);
        self.escalated = snapshot.escalated;
        self.artifacts_ready = snapshot.artifacts_ready;
        self.implemented = snapshot.implemented;

        match self.refresh_backlog() {
            Ok(_) => {}
            Err(e) if e.is_permanent() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "backlog unreadable at startup, reconciling against cached items");
                self.record_error(&format!("backlog unreadable at startup: {e}"));
            }
        }

        let now = Utc::now();
        for (id, task) in snapshot.active_tasks {
            let Some(done) = self.effect_visible(&task) else {
                info!(task_id = %id, item = %task.work_item_id, "dropping task for item no longer in backlog");
                report.dropped += 1;
                continue;
            };
            if done {
                info!(
                    task_id = %id,
                    item = %task.work_item_id,
                    task_type = %task.task_type,
                    "task completed while daemon was down"
                );
                self.on_completed(&task);
                report.reconciled += 1;
                continue;
            }

            let mut task = task.requeued();
            task.task_id = id;
            if let Some(at) = snapshot.retry_not_before.get(&id).filter(|at| **at > now) {
                self.retry_not_before.insert(id, *at);
                self.active.insert(id, task);
                report.deferred += 1;
                continue;
            }
            match self.queue.submit(task.clone()) {
                Ok(_) => {
                    self.active.insert(id, task);
                    report.resubmitted += 1;
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "could not resubmit restored task");
                    self.record_error(&format!("could not resubmit restored task {id}: {e}"));
                }
            }
        }

        info!(
            restored = report.restored,
            reconciled = report.reconciled,
            resubmitted = report.resubmitted,
            deferred = report.deferred,
            dropped = report.dropped,
            "snapshot restored"
        );
        Ok(report)
    }

    /// `Some(true)` when the task's outcome is already visible, `None` when
    /// its item is gone from the backlog.
    fn effect_visible(&self, task: &Task) -> Option<bool> {
        let item = self.item(&task.work_item_id)?;
        Some(match task.task_type {
            TaskType::ProduceArtifact => self.backlog.artifact_exists(item),
            // Only a Done marker proves the work landed; `implementing` may
            // just mean it started.
            TaskType::ConsumeArtifact => item.lifecycle_status == LifecycleStatus::Done,
        })
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Run cycles on a fixed interval until `shutdown` fires or a fatal error
    /// occurs. A cycle already in progress when shutdown is requested runs to
    /// completion.
    pub async fn run(&mut self, shutdown: &ShutdownSignal) -> Result<(), CycleError> {
        let mut ticker = tokio::time::interval(self.settings.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.settings.cycle_interval.as_secs(), "coordinator loop started");

        while !shutdown.is_shutting_down() {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) => log_cycle(&report),
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "fatal coordinator error");
                            self.record_error(&format!("fatal: {e}"));
                            return Err(e);
                        }
                        Err(e) => {
                            warn!(error = %e, "cycle failed");
                            self.record_error(&format!("cycle failed: {e}"));
                        }
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!(cycles = self.cycles, "coordinator loop stopped");
        Ok(())
    }

    /// One full pass of the work loop.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        self.cycles += 1;
        let mut report = CycleReport {
            cycle: self.cycles,
            ..CycleReport::default()
        };
        let now = Utc::now();

        self.process_control_requests(&mut report).await;

        match self.refresh_backlog() {
            Ok(reloaded) => report.backlog_reloaded = reloaded,
            Err(e) if e.is_permanent() => return Err(e.into()),
            Err(e) => self.note(&mut report, format!("backlog unreadable, using cached items: {e}")),
        }

        self.collect_finished(now, &mut report).await;
        self.release_due_retries(now, &mut report);
        self.dispatch_artifacts(&mut report).await;
        self.dispatch_implementations(&mut report).await;
        self.flag_overruns(now, &mut report).await;

        self.persist()?;
        self.write_status(&mut report).await;
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Cycle steps
    // -----------------------------------------------------------------------

    async fn process_control_requests(&mut self, report: &mut CycleReport) {
        let requests = match self.control.drain() {
            Ok(requests) => requests,
            Err(e) => {
                self.note(report, format!("control inbox unreadable: {e}"));
                return;
            }
        };
        for request in requests {
            match request {
                ControlRequest::Reset(role) => match self.supervisor.reset(role).await {
                    Ok(true) => {
                        self.notifier
                            .notify(Notification::info(
                                format!("{role} reset"),
                                format!("{role} was reset by an operator and restarted"),
                            ))
                            .await;
                    }
                    Ok(false) => info!(role = %role, "reset requested for a role that has not given up"),
                    Err(e) => self.note(report, format!("reset of {role} failed: {e}")),
                },
            }
        }
    }

    /// Re-parse the backlog if its modification time moved. Returns whether
    /// it was reloaded.
    fn refresh_backlog(&mut self) -> Result<bool, BacklogError> {
        if !self.backlog.has_changed()? {
            return Ok(false);
        }
        let items = self.backlog.parse()?;
        info!(items = items.len(), planned = items.iter().filter(|i| i.is_planned()).count(), "backlog reloaded");
        self.items = items;

        let planned: HashSet<&str> = self
            .items
            .iter()
            .filter(|i| i.is_planned())
            .map(|i| i.id.as_str())
            .collect();
        let known: HashSet<&str> = self.items.iter().map(|i| i.id.as_str()).collect();
        // Once the backlog moves an item past Planned its local markers are
        // no longer needed.
        self.implemented.retain(|id| planned.contains(id.as_str()));
        self.artifacts_ready.retain(|id| known.contains(id.as_str()));
        self.escalated.retain(|(id, _)| known.contains(id.as_str()));
        Ok(true)
    }

    async fn collect_finished(&mut self, now: DateTime<Utc>, report: &mut CycleReport) {
        let ids: Vec<TaskId> = self
            .active
            .keys()
            .filter(|id| !self.retry_not_before.contains_key(id))
            .copied()
            .collect();

        for id in ids {
            let Some(current) = self.queue.task(id) else {
                // The queue no longer knows this task; put it back as it was.
                let Some(task) = self.active.get(&id).cloned() else {
                    continue;
                };
                match self.queue.submit(task.requeued()) {
                    Ok(_) => {
                        warn!(task_id = %id, item = %task.work_item_id, "lost task resubmitted");
                        report.resubmitted += 1;
                    }
                    Err(e) => self.note(report, format!("could not resubmit lost task {id}: {e}")),
                }
                continue;
            };

            match current.status {
                TaskStatus::Queued | TaskStatus::Running => {
                    self.active.insert(id, current);
                }
                TaskStatus::Complete => {
                    self.queue.acknowledge(id);
                    self.active.remove(&id);
                    self.overruns_flagged.remove(&id);
                    info!(
                        task_id = %id,
                        item = %current.work_item_id,
                        task_type = %current.task_type,
                        duration_ms = current.duration_ms.unwrap_or(0),
                        "task complete"
                    );
                    self.on_completed(&current);
                    report.completed += 1;
                }
                TaskStatus::Failed => {
                    self.queue.acknowledge(id);
                    self.active.remove(&id);
                    self.overruns_flagged.remove(&id);
                    self.handle_failure(current, now, report).await;
                }
            }
        }
    }

    fn on_completed(&mut self, task: &Task) {
        match task.task_type {
            TaskType::ProduceArtifact => {
                self.artifacts_ready.insert(task.work_item_id.clone());
            }
            TaskType::ConsumeArtifact => {
                self.implemented.insert(task.work_item_id.clone());
            }
        }
    }

    async fn handle_failure(&mut self, task: Task, now: DateTime<Utc>, report: &mut CycleReport) {
        let error = task.error.clone().unwrap_or_else(|| "unknown error".to_string());

        if task.retry_count >= self.settings.max_retries {
            self.escalate(&task, &error).await;
            report.escalated += 1;
            return;
        }

        let mut retry = task.requeued();
        retry.retry_count += 1;
        let delay = self.settings.retry_backoff.delay_for(retry.retry_count - 1);
        let not_before = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);

        warn!(
            task_id = %task.task_id,
            item = %task.work_item_id,
            task_type = %task.task_type,
            attempt = retry.retry_count,
            max_retries = self.settings.max_retries,
            delay_secs = delay.as_secs(),
            error = %error,
            "task failed, retry scheduled"
        );
        self.record_error(&format!(
            "{} for item {} failed (retry {}/{} in {}s): {error}",
            task.task_type,
            task.work_item_id,
            retry.retry_count,
            self.settings.max_retries,
            delay.as_secs()
        ));
        self.retry_not_before.insert(task.task_id, not_before);
        self.active.insert(task.task_id, retry);
        report.retries_scheduled += 1;
    }

    /// Mark the item/type pair permanently failed. Notifies at most once per
    /// pair.
    async fn escalate(&mut self, task: &Task, error: &str) {
        if !self
            .escalated
            .insert((task.work_item_id.clone(), task.task_type))
        {
            return;
        }
        error!(
            task_id = %task.task_id,
            item = %task.work_item_id,
            task_type = %task.task_type,
            retries = task.retry_count,
            error = %error,
            "task permanently failed"
        );
        self.record_error(&format!(
            "{} for item {} permanently failed after {} retries: {error}",
            task.task_type, task.work_item_id, task.retry_count
        ));
        self.notifier
            .notify(Notification::escalation(
                format!("Item {} needs attention", task.work_item_id),
                format!(
                    "{} failed {} times and will not be retried. Last error: {error}",
                    task.task_type,
                    task.retry_count + 1
                ),
            ))
            .await;
    }

    fn release_due_retries(&mut self, now: DateTime<Utc>, report: &mut CycleReport) {
        let due: Vec<TaskId> = self
            .retry_not_before
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            self.retry_not_before.remove(&id);
            let Some(task) = self.active.get(&id).cloned() else {
                continue;
            };
            match self.queue.submit(task) {
                Ok(_) => {
                    debug!(task_id = %id, "retry released");
                    report.retries_released += 1;
                }
                Err(e) => {
                    self.retry_not_before.insert(id, now);
                    self.note(report, format!("could not resubmit retry {id}: {e}"));
                }
            }
        }
    }

    async fn dispatch_artifacts(&mut self, report: &mut CycleReport) {
        if !self.supervisor.has_capacity(AgentRole::Designer).await {
            debug!("designer has no capacity, skipping artifact dispatch");
            return;
        }
        let slots = self
            .settings
            .lookahead_target
            .saturating_sub(self.in_flight(TaskType::ProduceArtifact));
        if slots == 0 {
            return;
        }

        let candidates: Vec<WorkItem> = self
            .items
            .iter()
            .filter(|item| item.is_planned())
            .take(self.settings.lookahead_window)
            .filter(|item| !self.item_has_artifact(item))
            .filter(|item| !self.is_tracked(&item.id, TaskType::ProduceArtifact))
            .take(slots)
            .cloned()
            .collect();

        for item in candidates {
            let task = self.task_for(&item, TaskType::ProduceArtifact);
            if self.dispatch(task, report) {
                report.artifacts_dispatched += 1;
            }
        }
    }

    async fn dispatch_implementations(&mut self, report: &mut CycleReport) {
        if !self.supervisor.has_capacity(AgentRole::Implementer).await {
            debug!("implementer has no capacity, skipping implementation dispatch");
            return;
        }
        let slots = self
            .settings
            .max_concurrent_implementations
            .saturating_sub(self.in_flight(TaskType::ConsumeArtifact));
        if slots == 0 {
            return;
        }

        let candidates: Vec<WorkItem> = self
            .items
            .iter()
            .filter(|item| item.is_planned())
            .filter(|item| self.item_has_artifact(item))
            .filter(|item| !self.implemented.contains(&item.id))
            .filter(|item| !self.is_tracked(&item.id, TaskType::ConsumeArtifact))
            .take(slots)
            .cloned()
            .collect();

        for item in candidates {
            let task = self.task_for(&item, TaskType::ConsumeArtifact);
            if self.dispatch(task, report) {
                report.implementations_dispatched += 1;
            }
        }
    }

    async fn flag_overruns(&mut self, now: DateTime<Utc>, report: &mut CycleReport) {
        let sweep = self.patrol.sweep(self.active.values(), now);
        self.overruns_flagged.retain(|id| self.active.contains_key(id));

        for overrun in sweep.overruns {
            if !self.overruns_flagged.insert(overrun.task_id) {
                continue;
            }
            report.overruns += 1;
            self.notifier
                .notify(Notification::warning(
                    format!("Task overrunning on item {}", overrun.work_item_id),
                    format!(
                        "{} task {} has been running for {} minutes (timeout {} minutes)",
                        overrun.role,
                        overrun.task_id,
                        overrun.running_for.as_secs() / 60,
                        self.patrol.task_timeout().as_secs() / 60
                    ),
                ))
                .await;
        }
    }

    async fn write_status(&mut self, report: &mut CycleReport) {
        let status = self.status_report().await;
        if let Err(e) = status.write(&self.status_path) {
            self.note(report, format!("could not write status report: {e}"));
        }
    }

    // -----------------------------------------------------------------------
    // Persistence and reporting
    // -----------------------------------------------------------------------

    /// Final pass during shutdown: record outcomes that arrived since the
    /// last cycle, then write the snapshot and status report. Nothing new is
    /// dispatched.
    pub async fn wind_down(&mut self) -> Result<CycleReport, SnapshotError> {
        let mut report = CycleReport {
            cycle: self.cycles,
            ..CycleReport::default()
        };
        self.collect_finished(Utc::now(), &mut report).await;
        self.persist()?;
        self.write_status(&mut report).await;
        info!(
            active_tasks = self.active.len(),
            completed = report.completed,
            "final snapshot written"
        );
        Ok(report)
    }

    /// Write the snapshot now.
    pub fn persist(&self) -> Result<(), SnapshotError> {
        let snapshot = Snapshot {
            saved_at: Utc::now(),
            active_tasks: self.active.clone(),
            backlog_cache: self.items.clone(),
            backlog_last_seen_mtime: self.backlog.last_seen_mtime(),
            escalated: self.escalated.clone(),
            artifacts_ready: self.artifacts_ready.clone(),
            implemented: self.implemented.clone(),
            retry_not_before: self.retry_not_before.clone(),
        };
        self.snapshots.save(&snapshot)
    }

    pub async fn status_report(&self) -> StatusReport {
        let roles = self
            .supervisor
            .list()
            .await
            .into_iter()
            .map(|info| RoleStatus {
                role: info.role,
                state: info.state.as_str().to_string(),
                health: info.health,
                restart_count: info.restart_count,
                pid: info.pid,
                last_restart_at: info.last_restart_at,
            })
            .collect();
        StatusReport {
            pid: std::process::id(),
            updated_at: Utc::now(),
            roles,
            queue_depth: self.queue.size(),
            active_tasks: self.active.len(),
            deferred_retries: self.retry_not_before.len(),
            permanently_failed: self.escalated.len(),
            backlog_items: self.items.len(),
            slowest_tasks: self.queue.slowest_tasks(self.settings.bottleneck_capacity),
        }
    }

    /// Pipeline position of a backlog item, or `None` if the item is unknown.
    pub fn progress(&self, item_id: &str) -> Option<ItemProgress> {
        let item = self.item(item_id)?;
        let progress = if item.lifecycle_status == LifecycleStatus::Done
            || self.implemented.contains(item_id)
        {
            ItemProgress::Done
        } else if self.has_active(item_id, TaskType::ConsumeArtifact) {
            ItemProgress::ImplementationDispatched
        } else if self.item_has_artifact(item) {
            ItemProgress::ArtifactReady
        } else if self.has_active(item_id, TaskType::ProduceArtifact) {
            ItemProgress::ArtifactDispatched
        } else {
            ItemProgress::Planned
        };
        Some(progress)
    }

    /// Append to the error-recovery log. Failing to write it is only logged.
    pub fn record_error(&self, message: &str) {
        if let Err(e) = self.error_log.append(message) {
            warn!(path = %self.error_log.path().display(), error = %e, "could not append to error log");
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn item(&self, item_id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    fn item_has_artifact(&self, item: &WorkItem) -> bool {
        item.has_artifact
            || self.artifacts_ready.contains(&item.id)
            || self.backlog.artifact_exists(item)
    }

    fn has_active(&self, item_id: &str, task_type: TaskType) -> bool {
        self.active
            .values()
            .any(|t| t.task_type == task_type && t.work_item_id == item_id)
    }

    /// Active or given up on; either way not to be dispatched again.
    fn is_tracked(&self, item_id: &str, task_type: TaskType) -> bool {
        self.has_active(item_id, task_type) || self.is_escalated(item_id, task_type)
    }

    fn in_flight(&self, task_type: TaskType) -> usize {
        self.active
            .values()
            .filter(|t| t.task_type == task_type)
            .count()
    }

    fn task_for(&self, item: &WorkItem, task_type: TaskType) -> Task {
        Task::new(task_type, item.id.clone(), task_priority(item))
            .with_payload("title", item.title.clone())
            .with_payload(
                "artifact_path",
                self.backlog.artifact_path(item).display().to_string(),
            )
    }

    fn dispatch(&mut self, mut task: Task, report: &mut CycleReport) -> bool {
        match self.queue.submit(task.clone()) {
            Ok(id) => {
                task.task_id = id;
                info!(
                    task_id = %id,
                    item = %task.work_item_id,
                    task_type = %task.task_type,
                    priority = task.priority,
                    "task dispatched"
                );
                self.active.insert(id, task);
                true
            }
            Err(e) => {
                self.note(
                    report,
                    format!("could not dispatch {} for item {}: {e}", task.task_type, task.work_item_id),
                );
                false
            }
        }
    }

    fn note(&self, report: &mut CycleReport, message: String) {
        warn!(cycle = report.cycle, "{message}");
        self.record_error(&message);
        report.errors.push(message);
    }
}

fn log_cycle(report: &CycleReport) {
    info!(
        cycle = report.cycle,
        backlog_reloaded = report.backlog_reloaded,
        artifacts_dispatched = report.artifacts_dispatched,
        implementations_dispatched = report.implementations_dispatched,
        completed = report.completed,
        retries_scheduled = report.retries_scheduled,
        escalated = report.escalated,
        errors = report.errors.len(),
        "cycle complete"
    );
}
