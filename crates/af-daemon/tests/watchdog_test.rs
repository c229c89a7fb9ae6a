use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use af_agents::heartbeat::HeartbeatBoard;
use af_agents::link::WorkerLink;
use af_agents::process::{Launched, ProcessError, ProcessLauncher, WorkerProcess};
use af_agents::state_machine::RoleState;
use af_agents::supervisor::{AgentSupervisor, SupervisorPolicy};
use af_core::types::AgentRole;
use af_daemon::watchdog::Watchdog;
use af_harness::backoff::Backoff;
use af_harness::notify::MemoryNotifier;
use async_trait::async_trait;

struct FakeProcess {
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> bool {
        !self.alive.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self) -> Result<(), ProcessError> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_exit(&mut self, _timeout: Duration) -> bool {
        !self.alive.load(Ordering::SeqCst)
    }
}

/// Launches fake workers that never heartbeat on their own.
#[derive(Default)]
struct FakeLauncher {
    alive: Mutex<HashMap<AgentRole, Arc<AtomicBool>>>,
    launches: Mutex<HashMap<AgentRole, u32>>,
}

impl FakeLauncher {
    fn kill(&self, role: AgentRole) {
        self.alive.lock().unwrap()[&role].store(false, Ordering::SeqCst);
    }

    fn launches(&self, role: AgentRole) -> u32 {
        self.launches.lock().unwrap().get(&role).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, role: AgentRole, _heartbeats: HeartbeatBoard) -> Result<Launched, ProcessError> {
        let alive = Arc::new(AtomicBool::new(true));
        self.alive.lock().unwrap().insert(role, Arc::clone(&alive));
        *self.launches.lock().unwrap().entry(role).or_insert(0) += 1;
        let (link, _calls) = WorkerLink::channel(role);
        Ok(Launched {
            process: Box::new(FakeProcess { alive }),
            link,
        })
    }
}

async fn setup(restart_unresponsive: bool) -> (Arc<FakeLauncher>, Arc<AgentSupervisor>, MemoryNotifier, Watchdog) {
    let launcher = Arc::new(FakeLauncher::default());
    let notifier = MemoryNotifier::new();
    let supervisor = Arc::new(AgentSupervisor::new(
        AgentRole::workers(),
        SupervisorPolicy {
            max_restarts: 3,
            backoff: Backoff::new(Duration::from_secs(5), Duration::from_secs(300)),
            staleness: Duration::from_secs(150),
        },
        Arc::clone(&launcher) as Arc<dyn ProcessLauncher>,
        Arc::new(notifier.clone()),
    ));
    assert!(supervisor.spawn_all().await.is_empty());
    let watchdog = Watchdog::new(
        Arc::clone(&supervisor),
        Arc::new(notifier.clone()),
        Duration::from_secs(30),
    )
    .with_restart_unresponsive(restart_unresponsive);
    (launcher, supervisor, notifier, watchdog)
}

#[tokio::test(start_paused = true)]
async fn crashed_worker_is_restarted_once() {
    let (launcher, supervisor, _notifier, mut watchdog) = setup(false).await;
    launcher.kill(AgentRole::Designer);

    let report = watchdog.sweep().await;
    assert_eq!(report.crashed, [AgentRole::Designer]);
    assert_eq!(report.restarting, [AgentRole::Designer]);

    // The restart is already in hand; a second sweep does not start another.
    let report = watchdog.sweep().await;
    assert!(report.restarting.is_empty());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(supervisor.state(AgentRole::Designer).await, Some(RoleState::Running));
    assert_eq!(launcher.launches(AgentRole::Designer), 2);
    assert_eq!(launcher.launches(AgentRole::Implementer), 1);
    assert_eq!(supervisor.info(AgentRole::Designer).await.unwrap().restart_count, 1);
}

#[tokio::test(start_paused = true)]
async fn silent_worker_is_reported_once_per_episode() {
    let (_launcher, supervisor, notifier, mut watchdog) = setup(false).await;

    tokio::time::sleep(Duration::from_secs(200)).await;
    let report = watchdog.sweep().await;
    assert_eq!(report.unresponsive, [AgentRole::Designer, AgentRole::Implementer]);
    assert!(watchdog.sweep().await.unresponsive.is_empty());
    assert_eq!(notifier.count_titled("designer unresponsive"), 1);
    assert!(notifier.requiring_human().is_empty());

    // A heartbeat ends the episode; the next silence is reported again.
    supervisor.heartbeats().beat(AgentRole::Designer);
    assert!(watchdog.sweep().await.unresponsive.is_empty());
    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(watchdog.sweep().await.unresponsive, [AgentRole::Designer]);
    assert_eq!(notifier.count_titled("designer unresponsive"), 2);
}

#[tokio::test(start_paused = true)]
async fn unresponsive_worker_can_be_restarted() {
    let (launcher, supervisor, _notifier, mut watchdog) = setup(true).await;

    tokio::time::sleep(Duration::from_secs(200)).await;
    let report = watchdog.sweep().await;
    assert_eq!(report.unresponsive.len(), 2);
    assert_eq!(supervisor.state(AgentRole::Designer).await, Some(RoleState::Crashed));

    let report = watchdog.sweep().await;
    assert_eq!(report.restarting, [AgentRole::Designer, AgentRole::Implementer]);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(launcher.launches(AgentRole::Designer), 2);
    assert_eq!(supervisor.state(AgentRole::Designer).await, Some(RoleState::Running));
}
