//! Supervisor watchdog: notices exited and silent workers between
//! coordinator cycles.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use af_agents::supervisor::AgentSupervisor;
use af_core::types::{AgentHealth, AgentRole};
use af_harness::notify::{Notification, Notifier};
use af_harness::shutdown::ShutdownSignal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a single watchdog sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    /// Roles found crashed this sweep.
    pub crashed: Vec<AgentRole>,
    /// Crashed roles handed to a new restart task.
    pub restarting: Vec<AgentRole>,
    /// Roles that became unresponsive this sweep.
    pub unresponsive: Vec<AgentRole>,
}

pub struct Watchdog {
    supervisor: Arc<AgentSupervisor>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    restart_unresponsive: bool,
    /// One restart task per role; a role is never handled twice at once.
    restarts: HashMap<AgentRole, JoinHandle<()>>,
    /// Roles already reported unresponsive in the current episode.
    silent: HashSet<AgentRole>,
}

impl Watchdog {
    pub fn new(supervisor: Arc<AgentSupervisor>, notifier: Arc<dyn Notifier>, interval: Duration) -> Self {
        Self {
            supervisor,
            notifier,
            interval,
            restart_unresponsive: false,
            restarts: HashMap::new(),
            silent: HashSet::new(),
        }
    }

    /// Kill and restart workers that stop sending heartbeats.
    pub fn with_restart_unresponsive(mut self, enabled: bool) -> Self {
        self.restart_unresponsive = enabled;
        self
    }

    pub async fn sweep(&mut self) -> WatchdogReport {
        self.restarts.retain(|_, handle| !handle.is_finished());
        let mut report = WatchdogReport::default();

        for role in self.supervisor.detect_crashes().await {
            report.crashed.push(role);
            if self.restarts.contains_key(&role) {
                continue;
            }
            // Each role restarts on its own task so one role's backoff never
            // delays another's.
            let supervisor = Arc::clone(&self.supervisor);
            let handle = tokio::spawn(async move {
                match supervisor.handle_crash(role).await {
                    Ok(outcome) => debug!(role = %role, ?outcome, "crash handled"),
                    Err(e) => warn!(role = %role, error = %e, "crash handling failed"),
                }
            });
            self.restarts.insert(role, handle);
            report.restarting.push(role);
        }

        let roles: Vec<AgentRole> = self.supervisor.roles().collect();
        for role in roles {
            if self.supervisor.health(role).await != AgentHealth::Unresponsive {
                self.silent.remove(&role);
                continue;
            }
            if !self.silent.insert(role) {
                continue;
            }
            report.unresponsive.push(role);
            let silence = self
                .supervisor
                .heartbeats()
                .silence(role)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            warn!(role = %role, silent_secs = silence, "worker unresponsive");
            self.notifier
                .notify(Notification::info(
                    format!("{role} unresponsive"),
                    format!("{role} has not sent a heartbeat for {silence}s"),
                ))
                .await;

            if self.restart_unresponsive {
                match self.supervisor.force_restart(role).await {
                    Ok(()) => {
                        info!(role = %role, "unresponsive worker restarted");
                        self.silent.remove(&role);
                    }
                    Err(e) => warn!(role = %role, error = %e, "could not restart unresponsive worker"),
                }
            }
        }

        report
    }

    /// Sweep every interval until shutdown. Pending restarts are abandoned
    /// on exit; the supervisor's shutdown takes over from there.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        let _guard = shutdown.guard();
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately; workers were just spawned.
        ticker.tick().await;
        info!(interval_secs = self.interval.as_secs(), "watchdog started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.crashed.is_empty() || !report.unresponsive.is_empty() {
                        debug!(?report, "watchdog sweep");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        for (role, handle) in self.restarts.drain() {
            debug!(role = %role, "abandoning pending restart");
            handle.abort();
        }
        info!("watchdog stopped");
    }
}
