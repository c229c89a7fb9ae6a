use std::sync::Arc;

use af_agents::executor::{AgentExecutor, LinkExecutor};
use af_agents::process::{CommandLauncher, ProcessLauncher};
use af_agents::roles::RoleRegistry;
use af_agents::runner::RoleRunner;
use af_agents::supervisor::{AgentSupervisor, SupervisorPolicy};
use af_core::config::Config;
use af_core::lockfile::{DaemonLockfile, LockGuard};
use af_core::task_queue::{QueueConfig, TaskQueue};
use af_harness::notify::{CommandNotifier, LogNotifier, Notification, Notifier};
use af_harness::shutdown::{DrainResult, ShutdownReason, ShutdownSignal};
use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::coordinator::Coordinator;
use crate::watchdog::Watchdog;

/// How the daemon ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonExit {
    Clean,
    Fatal(String),
}

impl DaemonExit {
    /// Process exit code: 0 on clean shutdown, 1 on a fatal error.
    pub fn code(&self) -> i32 {
        match self {
            DaemonExit::Clean => 0,
            DaemonExit::Fatal(_) => 1,
        }
    }
}

/// The auto-foreman daemon: supervisor, per-role runners, watchdog and the
/// coordinator loop, with a single stop sequence shared by signals and
/// fatal errors.
pub struct Daemon {
    config: Config,
    registry: RoleRegistry,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    notifier: Arc<dyn Notifier>,
    shutdown: ShutdownSignal,
    handle_signals: bool,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let notifier: Arc<dyn Notifier> = match &config.notifications.command {
            Some(program) => Arc::new(CommandNotifier::new(
                program.clone(),
                config.notifications.args.clone(),
            )),
            None => Arc::new(LogNotifier),
        };
        Self {
            registry: RoleRegistry::from_config(&config.agents),
            config,
            launcher: None,
            notifier,
            shutdown: ShutdownSignal::new(),
            handle_signals: true,
        }
    }

    /// Run workers through `launcher` instead of the configured commands.
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Do not install SIGINT/SIGTERM handlers; stop only through
    /// [`shutdown_handle`](Self::shutdown_handle).
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A handle that stops the daemon when triggered.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run until a stop signal or a fatal error.
    ///
    /// Errors returned here happen before anything was started (another
    /// daemon holds the lock, no worker command configured). Fatal errors
    /// after startup are reported as [`DaemonExit::Fatal`] once the stop
    /// sequence has run.
    pub async fn run(self) -> Result<DaemonExit> {
        let config = &self.config;
        let launcher = match &self.launcher {
            Some(launcher) => Arc::clone(launcher),
            None => {
                let missing = self.registry.missing_commands();
                if !missing.is_empty() {
                    let roles: Vec<String> = missing.iter().map(|r| r.to_string()).collect();
                    bail!("no worker command configured for: {}", roles.join(", "));
                }
                Arc::new(CommandLauncher::new(self.registry.clone())) as Arc<dyn ProcessLauncher>
            }
        };

        let state_dir = config.state_dir();
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
        let lock_path = config.lockfile_path();
        DaemonLockfile::for_current_process(&state_dir)
            .acquire_or_fail(&lock_path)
            .map_err(anyhow::Error::msg)?;
        let _lock = LockGuard::new(lock_path);

        let queue = Arc::new(TaskQueue::new(QueueConfig {
            slowest_capacity: config.coordinator.bottleneck_capacity,
            retained_tasks: config.coordinator.retained_tasks,
        }));
        let supervisor = Arc::new(AgentSupervisor::new(
            self.registry.roles(),
            SupervisorPolicy::from_config(&config.supervisor),
            launcher,
            Arc::clone(&self.notifier),
        ));
        let mut coordinator = Coordinator::new(
            config,
            Arc::clone(&queue),
            Arc::clone(&supervisor),
            Arc::clone(&self.notifier),
        );

        if let Err(e) = coordinator.restore().await {
            let message = format!("startup failed: {e}");
            error!(error = %e, "could not restore coordinator state");
            coordinator.record_error(&message);
            self.notifier
                .notify(Notification::escalation("auto-foreman failed to start", message.clone()))
                .await;
            return Ok(DaemonExit::Fatal(message));
        }

        for (role, e) in supervisor.spawn_all().await {
            warn!(role = %role, error = %e, "initial spawn failed, the watchdog will retry");
        }

        // Every runner and the watchdog holds a drain guard.
        let mut participants = JoinSet::new();
        let executor: Arc<dyn AgentExecutor> = Arc::new(LinkExecutor::new(Arc::clone(&supervisor)));
        for spec in self.registry.specs() {
            for slot in 0..spec.concurrency {
                let runner = RoleRunner::new(spec.role, Arc::clone(&queue), Arc::clone(&executor))
                    .with_slot(slot);
                participants.spawn(runner.run(self.shutdown.clone()));
            }
        }
        let watchdog = Watchdog::new(
            Arc::clone(&supervisor),
            Arc::clone(&self.notifier),
            config.supervisor.heartbeat_interval(),
        )
        .with_restart_unresponsive(config.supervisor.restart_unresponsive);
        participants.spawn(watchdog.run(self.shutdown.clone()));
        let expected = participants.len();

        let signals = self
            .handle_signals
            .then(|| tokio::spawn(listen_for_signals(self.shutdown.clone())));

        info!(
            pid = std::process::id(),
            state_dir = %state_dir.display(),
            participants = expected,
            "auto-foreman started"
        );

        let exit = match coordinator.run(&self.shutdown).await {
            Ok(()) => DaemonExit::Clean,
            Err(e) => {
                let message = e.to_string();
                self.shutdown.trigger(ShutdownReason::Fatal(message.clone()));
                DaemonExit::Fatal(message)
            }
        };
        info!(reason = ?self.shutdown.reason(), "stopping");

        let timeout = config.supervisor.shutdown_timeout();
        if let DrainResult::Timeout { drained, expected } =
            self.shutdown.wait_for_drain(expected, timeout).await
        {
            warn!(drained, expected, "runners still busy at shutdown timeout");
        }

        match coordinator.wind_down().await {
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "could not write final snapshot");
                coordinator.record_error(&format!("final snapshot failed: {e}"));
            }
        }

        supervisor.shutdown_all(timeout).await;
        participants.shutdown().await;
        if let Some(signals) = signals {
            signals.abort();
        }

        let notification = match &exit {
            DaemonExit::Clean => Notification::info(
                "auto-foreman stopped",
                "All workers stopped and state was saved.",
            ),
            DaemonExit::Fatal(message) => {
                Notification::escalation("auto-foreman stopped on a fatal error", message.clone())
            }
        };
        self.notifier.notify(notification).await;
        info!(code = exit.code(), "auto-foreman exited");
        Ok(exit)
    }
}

/// Translate SIGINT/SIGTERM into a shutdown request. Later signals are
/// ignored by the already-triggered signal.
async fn listen_for_signals(shutdown: ShutdownSignal) {
    loop {
        match wait_for_signal().await {
            Ok(name) => {
                if shutdown.trigger(ShutdownReason::Signal(name)) {
                    info!(signal = name, "shutdown requested");
                }
            }
            Err(e) => {
                warn!(error = %e, "could not listen for signals");
                return;
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}
