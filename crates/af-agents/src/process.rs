//! Worker processes and the launchers that create them.
//!
//! [`CommandLauncher`] runs each role as an OS child process speaking the
//! JSON-lines protocol from [`crate::link`]. [`InProcessLauncher`] runs a
//! [`TaskHandler`] on a tokio task instead, with heartbeats written straight
//! to the board. The supervisor only sees the two traits below.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use af_core::types::AgentRole;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::heartbeat::HeartbeatBoard;
use crate::link::{spawn_stdio_bridge, TaskReply, TaskRequest, WorkerLink};
use crate::roles::RoleRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("no worker command configured for the {0} role")]
    NotConfigured(AgentRole),

    #[error("failed to spawn {role} worker: {source}")]
    Spawn {
        role: AgentRole,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} worker has no piped stdio")]
    Stdio(AgentRole),

    #[error("signal delivery failed: {0}")]
    Signal(#[source] std::io::Error),
}

/// A running worker owned exclusively by the supervisor.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS pid, if this worker is an OS process that has not been reaped.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit probe.
    fn has_exited(&mut self) -> bool;

    /// Ask the worker to stop gracefully.
    async fn terminate(&mut self) -> Result<(), ProcessError>;

    /// Stop the worker immediately.
    async fn kill(&mut self) -> Result<(), ProcessError>;

    /// Wait up to `timeout` for the worker to exit. Returns whether it did.
    async fn wait_for_exit(&mut self, timeout: Duration) -> bool;
}

pub struct Launched {
    pub process: Box<dyn WorkerProcess>,
    pub link: WorkerLink,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, role: AgentRole, heartbeats: HeartbeatBoard) -> Result<Launched, ProcessError>;
}

// ---------------------------------------------------------------------------
// OS child processes
// ---------------------------------------------------------------------------

pub struct CommandLauncher {
    registry: RoleRegistry,
}

impl CommandLauncher {
    pub fn new(registry: RoleRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, role: AgentRole, heartbeats: HeartbeatBoard) -> Result<Launched, ProcessError> {
        let command = self
            .registry
            .get(role)
            .and_then(|spec| spec.command.as_ref())
            .ok_or(ProcessError::NotConfigured(role))?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .env("AF_ROLE", role.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn { role, source })?;
        let stdin = child.stdin.take().ok_or(ProcessError::Stdio(role))?;
        let stdout = child.stdout.take().ok_or(ProcessError::Stdio(role))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(role = %role, "{line}");
                }
            });
        }

        let link = spawn_stdio_bridge(role, stdin, stdout, heartbeats);
        info!(role = %role, pid = ?child.id(), program = %command.program, "worker process spawned");
        Ok(Launched {
            process: Box::new(OsProcess { role, child }),
            link,
        })
    }
}

pub struct OsProcess {
    role: AgentRole,
    child: Child,
}

#[async_trait]
impl WorkerProcess for OsProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(role = %self.role, status = %status, "worker exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(role = %self.role, error = %e, "worker status probe failed");
                true
            }
        }
    }

    async fn terminate(&mut self) -> Result<(), ProcessError> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        send_sigterm(pid)
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(ProcessError::Signal(e)),
        }
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.child.wait()).await.is_ok()
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<(), ProcessError> {
    // SAFETY: signalling a child we spawned and have not yet reaped.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(ProcessError::Signal(err))
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> Result<(), ProcessError> {
    // No graceful signal; the caller falls back to kill after the grace period.
    Ok(())
}

// ---------------------------------------------------------------------------
// In-process workers
// ---------------------------------------------------------------------------

/// Worker logic run inside the daemon. Called once per task; a returned
/// failure reply is a task failure, not a worker crash.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, role: AgentRole, request: TaskRequest) -> TaskReply;
}

pub struct InProcessLauncher {
    handler: Arc<dyn TaskHandler>,
    heartbeat_interval: Duration,
}

impl InProcessLauncher {
    pub fn new(handler: Arc<dyn TaskHandler>, heartbeat_interval: Duration) -> Self {
        Self {
            handler,
            heartbeat_interval,
        }
    }
}

#[async_trait]
impl ProcessLauncher for InProcessLauncher {
    async fn launch(&self, role: AgentRole, heartbeats: HeartbeatBoard) -> Result<Launched, ProcessError> {
        let (link, mut calls) = WorkerLink::channel(role);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handler = Arc::clone(&self.handler);
        let interval = self.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut in_flight = JoinSet::new();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => heartbeats.beat(role),
                    call = calls.recv() => {
                        let Some(call) = call else { break };
                        let handler = Arc::clone(&handler);
                        in_flight.spawn(async move {
                            let reply = handler.handle(role, call.request).await;
                            let _ = call.reply.send(reply);
                        });
                    }
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                }
            }
            // Let in-flight calls finish after a graceful stop.
            while in_flight.join_next().await.is_some() {}
            debug!(role = %role, "in-process worker stopped");
        });

        Ok(Launched {
            process: Box::new(InProcessWorker {
                handle,
                stop: Some(stop_tx),
            }),
            link,
        })
    }
}

pub struct InProcessWorker {
    handle: JoinHandle<()>,
    stop: Option<oneshot::Sender<()>>,
}

#[async_trait]
impl WorkerProcess for InProcessWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> bool {
        self.handle.is_finished()
    }

    async fn terminate(&mut self) -> Result<(), ProcessError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        self.handle.abort();
        Ok(())
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        if self.handle.is_finished() {
            return true;
        }
        tokio::time::timeout(timeout, &mut self.handle).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_core::types::TaskType;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, role: AgentRole, request: TaskRequest) -> TaskReply {
            TaskReply::success(request.task_id, Some(role.as_str().into()))
        }
    }

    #[tokio::test]
    async fn in_process_worker_serves_calls_and_stops() {
        let launcher = InProcessLauncher::new(Arc::new(Echo), Duration::from_millis(10));
        let board = HeartbeatBoard::new();
        let Launched { mut process, link } = launcher.launch(AgentRole::Designer, board.clone()).await.unwrap();

        let reply = link
            .call(TaskRequest {
                task_id: uuid::Uuid::new_v4(),
                task_type: TaskType::ProduceArtifact,
                work_item_id: "1".into(),
                payload: Default::default(),
            })
            .await
            .unwrap();
        assert_eq!(reply.output, Some("designer".into()));
        assert!(board.last_beat(AgentRole::Designer).is_some());
        assert!(!process.has_exited());

        process.terminate().await.unwrap();
        assert!(process.wait_for_exit(Duration::from_secs(1)).await);
        assert!(process.has_exited());
        assert!(link.call(TaskRequest {
            task_id: uuid::Uuid::new_v4(),
            task_type: TaskType::ProduceArtifact,
            work_item_id: "2".into(),
            payload: Default::default(),
        })
        .await
        .is_err());
    }

    #[tokio::test]
    async fn command_launcher_requires_a_command() {
        let launcher = CommandLauncher::new(RoleRegistry::in_process());
        let err = launcher
            .launch(AgentRole::Implementer, HeartbeatBoard::new())
            .await
            .err()
            .expect("launch should fail");
        assert!(matches!(err, ProcessError::NotConfigured(AgentRole::Implementer)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn os_process_terminates_gracefully() {
        use crate::roles::{RoleSpec, WorkerCommand};

        let registry = RoleRegistry::in_process();
        let mut registry_specs: Vec<RoleSpec> = registry.specs().cloned().collect();
        for spec in &mut registry_specs {
            spec.command = Some(WorkerCommand {
                program: "sh".into(),
                args: vec!["-c".into(), "while true; do echo '{\"type\":\"heartbeat\"}'; sleep 1; done".into()],
                env: Default::default(),
                working_dir: None,
            });
        }
        let launcher = CommandLauncher::new(RoleRegistry::from_specs(registry_specs));
        let board = HeartbeatBoard::new();
        let Launched { mut process, .. } = launcher.launch(AgentRole::Designer, board.clone()).await.unwrap();

        assert!(process.pid().is_some());
        assert!(!process.has_exited());
        process.terminate().await.unwrap();
        assert!(process.wait_for_exit(Duration::from_secs(5)).await);
    }
}
