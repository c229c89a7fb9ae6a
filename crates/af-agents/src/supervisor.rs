use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use af_core::config::SupervisorConfig;
use af_core::types::{AgentHealth, AgentRole};
use af_harness::backoff::Backoff;
use af_harness::notify::{Notification, Notifier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::heartbeat::HeartbeatBoard;
use crate::link::WorkerLink;
use crate::process::{Launched, ProcessError, ProcessLauncher, WorkerProcess};
use crate::state_machine::{RoleEvent, RoleState, RoleStateMachine, StateMachineError};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("role {0} is not supervised")]
    UnknownRole(AgentRole),

    #[error("role {0} is already running")]
    AlreadyRunning(AgentRole),

    #[error("role {0} gave up restarting; reset it first")]
    GivenUp(AgentRole),

    #[error("launching {role} worker failed: {source}")]
    Launch {
        role: AgentRole,
        #[source]
        source: ProcessError,
    },

    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Restart and health settings shared read-only by every role.
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    pub max_restarts: u32,
    pub backoff: Backoff,
    /// Silence after which a live worker counts as unresponsive.
    pub staleness: Duration,
}

impl SupervisorPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            backoff: Backoff::new(
                Duration::from_secs(config.backoff_base_secs),
                Duration::from_secs(config.backoff_max_secs),
            )
            .with_jitter(config.jitter),
            staleness: config.staleness_threshold(),
        }
    }
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

/// What `handle_crash` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashOutcome {
    /// Respawned after waiting `delay`; `attempt` is the new restart count.
    Restarted { attempt: u32, delay: Duration },
    /// Restart budget exhausted on this call; a human was notified.
    GivenUp,
    /// The role had already given up earlier; nothing was done.
    AlreadyGivenUp,
    /// The role was stopped, reset or respawned while we waited.
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleInfo {
    pub role: AgentRole,
    pub state: RoleState,
    pub health: AgentHealth,
    pub restart_count: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
}

// ---------------------------------------------------------------------------
// ManagedRole
// ---------------------------------------------------------------------------

struct ManagedRole {
    role: AgentRole,
    machine: RoleStateMachine,
    process: Option<Box<dyn WorkerProcess>>,
    link: Option<WorkerLink>,
    restart_count: u32,
    last_restart_at: Option<DateTime<Utc>>,
    /// Bumped on every spawn, stop and reset so a pending restart can tell
    /// whether the role changed under it.
    generation: u64,
}

impl ManagedRole {
    fn new(role: AgentRole) -> Self {
        Self {
            role,
            machine: RoleStateMachine::new(),
            process: None,
            link: None,
            restart_count: 0,
            last_restart_at: None,
            generation: 0,
        }
    }

    fn process_alive(&mut self) -> bool {
        self.process.as_mut().is_some_and(|p| !p.has_exited())
    }

    /// Record an unexpected exit: drop the handle and move to `Crashed`.
    fn mark_crashed(&mut self) -> std::result::Result<(), StateMachineError> {
        self.process = None;
        self.link = None;
        self.machine.transition(RoleEvent::Fail)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AgentSupervisor
// ---------------------------------------------------------------------------

/// Owns one worker per role and restarts crashed workers with exponential
/// backoff.
///
/// Each role sits behind its own lock; nothing mutable is shared between
/// roles, so a slow restart or a stuck shutdown for one role never blocks
/// another.
pub struct AgentSupervisor {
    policy: SupervisorPolicy,
    launcher: Arc<dyn ProcessLauncher>,
    notifier: Arc<dyn Notifier>,
    heartbeats: HeartbeatBoard,
    roles: BTreeMap<AgentRole, Arc<Mutex<ManagedRole>>>,
}

impl AgentSupervisor {
    pub fn new(
        roles: impl IntoIterator<Item = AgentRole>,
        policy: SupervisorPolicy,
        launcher: Arc<dyn ProcessLauncher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let roles = roles
            .into_iter()
            .filter(|role| *role != AgentRole::Coordinator)
            .map(|role| (role, Arc::new(Mutex::new(ManagedRole::new(role)))))
            .collect();
        Self {
            policy,
            launcher,
            notifier,
            heartbeats: HeartbeatBoard::new(),
            roles,
        }
    }

    pub fn roles(&self) -> impl Iterator<Item = AgentRole> + '_ {
        self.roles.keys().copied()
    }

    pub fn heartbeats(&self) -> &HeartbeatBoard {
        &self.heartbeats
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }

    fn slot(&self, role: AgentRole) -> Result<&Arc<Mutex<ManagedRole>>> {
        self.roles.get(&role).ok_or(SupervisorError::UnknownRole(role))
    }

    /// Fresh spawn: launches the worker and resets the restart count.
    pub async fn spawn(&self, role: AgentRole) -> Result<()> {
        let mut managed = self.slot(role)?.lock().await;
        match managed.machine.state() {
            RoleState::Running | RoleState::Starting | RoleState::Stopping => {
                return Err(SupervisorError::AlreadyRunning(role));
            }
            RoleState::GivenUp => return Err(SupervisorError::GivenUp(role)),
            _ => {}
        }
        managed.restart_count = 0;
        self.launch_locked(&mut managed).await
    }

    /// Spawn every supervised role, collecting failures instead of stopping
    /// at the first one.
    pub async fn spawn_all(&self) -> Vec<(AgentRole, SupervisorError)> {
        let mut failures = Vec::new();
        for role in self.roles.keys().copied() {
            if let Err(e) = self.spawn(role).await {
                failures.push((role, e));
            }
        }
        failures
    }

    async fn launch_locked(&self, managed: &mut ManagedRole) -> Result<()> {
        let role = managed.role;
        managed.machine.transition(RoleEvent::Start)?;
        managed.generation += 1;

        match self.launcher.launch(role, self.heartbeats.clone()).await {
            Ok(Launched { process, link }) => {
                self.heartbeats.beat(role);
                let pid = process.pid();
                managed.process = Some(process);
                managed.link = Some(link);
                managed.machine.transition(RoleEvent::Started)?;
                info!(role = %role, pid = ?pid, restart_count = managed.restart_count, "worker running");
                Ok(())
            }
            Err(source) => {
                managed.machine.transition(RoleEvent::Fail)?;
                warn!(role = %role, error = %source, "worker launch failed");
                Err(SupervisorError::Launch { role, source })
            }
        }
    }

    /// Process-exists probe.
    pub async fn is_alive(&self, role: AgentRole) -> bool {
        match self.roles.get(&role) {
            Some(slot) => slot.lock().await.process_alive(),
            None => false,
        }
    }

    /// Dead if there is no live process, Unresponsive if the process exists
    /// but has been silent longer than the staleness threshold.
    pub async fn health(&self, role: AgentRole) -> AgentHealth {
        if !self.is_alive(role).await {
            AgentHealth::Dead
        } else if self.heartbeats.is_stale(role, self.policy.staleness) {
            AgentHealth::Unresponsive
        } else {
            AgentHealth::Healthy
        }
    }

    /// Move every `Running` role whose process has exited to `Crashed`.
    /// Returns the roles that still need [`handle_crash`](Self::handle_crash),
    /// including ones left `Crashed` by an earlier failed launch.
    pub async fn detect_crashes(&self) -> Vec<AgentRole> {
        let mut crashed = Vec::new();
        for (role, slot) in &self.roles {
            let mut managed = slot.lock().await;
            match managed.machine.state() {
                RoleState::Running if !managed.process_alive() => {
                    warn!(role = %role, "worker exited unexpectedly");
                    if let Err(e) = managed.mark_crashed() {
                        error!(role = %role, error = %e, "crash bookkeeping failed");
                        continue;
                    }
                    crashed.push(*role);
                }
                RoleState::Crashed => crashed.push(*role),
                _ => {}
            }
        }
        crashed
    }

    /// Restart a crashed role after its backoff delay, or give up once the
    /// restart budget is spent.
    ///
    /// The role's lock is released while sleeping so status queries and
    /// shutdown stay responsive. A launch failure counts as another crash
    /// and goes around again.
    pub async fn handle_crash(&self, role: AgentRole) -> Result<CrashOutcome> {
        let slot = Arc::clone(self.slot(role)?);

        loop {
            let (attempt, delay, generation) = {
                let mut managed = slot.lock().await;
                match managed.machine.state() {
                    RoleState::GivenUp => return Ok(CrashOutcome::AlreadyGivenUp),
                    RoleState::Crashed => {}
                    RoleState::Running if !managed.process_alive() => managed.mark_crashed()?,
                    _ => return Ok(CrashOutcome::Aborted),
                }

                if managed.restart_count >= self.policy.max_restarts {
                    managed.machine.transition(RoleEvent::GiveUp)?;
                    let restarts = managed.restart_count;
                    drop(managed);
                    error!(role = %role, restarts, "worker keeps crashing, giving up");
                    self.notifier
                        .notify(Notification::escalation(
                            format!("{role} worker gave up"),
                            format!(
                                "The {role} worker crashed after {restarts} restarts and will not be restarted. \
                                 Investigate, then run `af reset {role}`."
                            ),
                        ))
                        .await;
                    return Ok(CrashOutcome::GivenUp);
                }

                let delay = self.policy.backoff.delay_for(managed.restart_count);
                managed.machine.transition(RoleEvent::Backoff)?;
                managed.restart_count += 1;
                warn!(
                    role = %role,
                    attempt = managed.restart_count,
                    max = self.policy.max_restarts,
                    delay_ms = delay.as_millis() as u64,
                    "restarting worker after backoff"
                );
                (managed.restart_count, delay, managed.generation)
            };

            tokio::time::sleep(delay).await;

            let mut managed = slot.lock().await;
            if managed.generation != generation || managed.machine.state() != RoleState::Backoff {
                info!(role = %role, "pending restart abandoned");
                return Ok(CrashOutcome::Aborted);
            }
            managed.last_restart_at = Some(Utc::now());
            match self.launch_locked(&mut managed).await {
                Ok(()) => return Ok(CrashOutcome::Restarted { attempt, delay }),
                Err(SupervisorError::Launch { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Kill a live but unresponsive worker so the crash path restarts it.
    pub async fn force_restart(&self, role: AgentRole) -> Result<()> {
        let mut managed = self.slot(role)?.lock().await;
        if managed.machine.state() != RoleState::Running {
            return Ok(());
        }
        if let Some(process) = managed.process.as_mut() {
            if let Err(e) = process.kill().await {
                warn!(role = %role, error = %e, "kill of unresponsive worker failed");
            }
        }
        warn!(role = %role, "unresponsive worker killed");
        managed.mark_crashed()?;
        Ok(())
    }

    /// Graceful stop: terminate, wait up to `timeout`, then kill.
    ///
    /// Stopping a role that is not running is a no-op. A role waiting out a
    /// restart delay is stopped and its restart abandoned.
    pub async fn shutdown(&self, role: AgentRole, timeout: Duration) -> Result<()> {
        let mut managed = self.slot(role)?.lock().await;
        match managed.machine.state() {
            RoleState::NotStarted | RoleState::Stopped | RoleState::GivenUp | RoleState::Stopping => {
                return Ok(());
            }
            RoleState::Crashed | RoleState::Backoff => {
                managed.machine.transition(RoleEvent::Stop)?;
                managed.generation += 1;
                info!(role = %role, "role stopped while awaiting restart");
                return Ok(());
            }
            RoleState::Running | RoleState::Starting => {}
        }

        managed.machine.transition(RoleEvent::Stop)?;
        managed.generation += 1;
        managed.link = None;

        if let Some(mut process) = managed.process.take() {
            if let Err(e) = process.terminate().await {
                warn!(role = %role, error = %e, "graceful terminate failed");
            }
            if process.wait_for_exit(timeout).await {
                info!(role = %role, "worker exited gracefully");
            } else {
                warn!(role = %role, timeout_ms = timeout.as_millis() as u64, "worker ignored terminate, killing");
                if let Err(e) = process.kill().await {
                    error!(role = %role, error = %e, "kill failed");
                }
                process.wait_for_exit(timeout).await;
            }
        }

        self.heartbeats.clear(role);
        managed.machine.transition(RoleEvent::Stopped)?;
        Ok(())
    }

    /// Stop every role, continuing past individual failures.
    pub async fn shutdown_all(&self, timeout: Duration) {
        for role in self.roles.keys().copied() {
            if let Err(e) = self.shutdown(role, timeout).await {
                error!(role = %role, error = %e, "role shutdown failed");
            }
        }
        info!("all workers stopped");
    }

    /// Manual reset of a `GivenUp` role followed by a fresh spawn.
    /// Returns `false` if the role had not given up.
    pub async fn reset(&self, role: AgentRole) -> Result<bool> {
        {
            let mut managed = self.slot(role)?.lock().await;
            if managed.machine.state() != RoleState::GivenUp {
                return Ok(false);
            }
            managed.machine.transition(RoleEvent::Reset)?;
            managed.restart_count = 0;
            managed.generation += 1;
            info!(role = %role, "role reset by operator");
        }
        self.spawn(role).await?;
        Ok(true)
    }

    /// Whether work should still be dispatched to `role`. Only a role that
    /// gave up (or is not supervised) has no capacity; a role in backoff
    /// will pick its queue up again after restarting.
    pub async fn has_capacity(&self, role: AgentRole) -> bool {
        match self.roles.get(&role) {
            Some(slot) => !matches!(
                slot.lock().await.machine.state(),
                RoleState::GivenUp | RoleState::Stopping | RoleState::Stopped
            ),
            None => false,
        }
    }

    /// Link to the role's worker while it is running.
    pub async fn link(&self, role: AgentRole) -> Option<WorkerLink> {
        let slot = self.roles.get(&role)?;
        let managed = slot.lock().await;
        if managed.machine.state() == RoleState::Running {
            managed.link.clone()
        } else {
            None
        }
    }

    pub async fn state(&self, role: AgentRole) -> Option<RoleState> {
        let slot = self.roles.get(&role)?;
        let state = slot.lock().await.machine.state();
        Some(state)
    }

    pub async fn info(&self, role: AgentRole) -> Option<RoleInfo> {
        let slot = self.roles.get(&role)?;
        let (state, restart_count, last_restart_at, pid, alive) = {
            let mut managed = slot.lock().await;
            let alive = managed.process_alive();
            (
                managed.machine.state(),
                managed.restart_count,
                managed.last_restart_at,
                managed.process.as_ref().and_then(|p| p.pid()),
                alive,
            )
        };
        let health = if !alive {
            AgentHealth::Dead
        } else if self.heartbeats.is_stale(role, self.policy.staleness) {
            AgentHealth::Unresponsive
        } else {
            AgentHealth::Healthy
        };
        Some(RoleInfo {
            role,
            state,
            health,
            restart_count,
            last_restart_at,
            pid,
        })
    }

    pub async fn list(&self) -> Vec<RoleInfo> {
        let mut out = Vec::with_capacity(self.roles.len());
        for role in self.roles.keys().copied() {
            if let Some(info) = self.info(role).await {
                out.push(info);
            }
        }
        out
    }
}
