use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use af_agents::heartbeat::HeartbeatBoard;
use af_agents::link::WorkerLink;
use af_agents::process::{Launched, ProcessError, ProcessLauncher, WorkerProcess};
use af_agents::state_machine::RoleState;
use af_agents::supervisor::{AgentSupervisor, CrashOutcome, SupervisorError, SupervisorPolicy};
use af_core::types::{AgentHealth, AgentRole};
use af_harness::backoff::Backoff;
use af_harness::notify::MemoryNotifier;
use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FakeProcess {
    alive: Arc<AtomicBool>,
    ignore_terminate: bool,
    terminations: Arc<AtomicU32>,
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
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_terminate {
            self.alive.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        if self.alive.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout).await;
        }
        !self.alive.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeLauncher {
    /// New processes die immediately.
    crash_on_start: AtomicBool,
    /// New processes ignore SIGTERM.
    ignore_terminate: AtomicBool,
    /// Fail the launch itself.
    refuse: AtomicBool,
    launches: AtomicU32,
    terminations: Arc<AtomicU32>,
    last_alive: Mutex<Option<Arc<AtomicBool>>>,
}

impl FakeLauncher {
    fn crashing() -> Arc<Self> {
        let launcher = Self::default();
        launcher.crash_on_start.store(true, Ordering::SeqCst);
        Arc::new(launcher)
    }

    fn healthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    fn current_alive(&self) -> Arc<AtomicBool> {
        self.last_alive.lock().unwrap().clone().expect("a process was launched")
    }

    /// Simulate the most recently launched worker dying.
    fn kill_current(&self) {
        self.current_alive().store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, role: AgentRole, _heartbeats: HeartbeatBoard) -> Result<Launched, ProcessError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ProcessError::NotConfigured(role));
        }
        let alive = Arc::new(AtomicBool::new(!self.crash_on_start.load(Ordering::SeqCst)));
        *self.last_alive.lock().unwrap() = Some(Arc::clone(&alive));
        let (link, _calls) = WorkerLink::channel(role);
        Ok(Launched {
            process: Box::new(FakeProcess {
                alive,
                ignore_terminate: self.ignore_terminate.load(Ordering::SeqCst),
                terminations: Arc::clone(&self.terminations),
            }),
            link,
        })
    }
}

fn policy(jitter: bool) -> SupervisorPolicy {
    SupervisorPolicy {
        max_restarts: 3,
        backoff: Backoff::new(Duration::from_secs(5), Duration::from_secs(300)).with_jitter(jitter),
        staleness: Duration::from_secs(150),
    }
}

fn supervisor(launcher: Arc<FakeLauncher>, notifier: MemoryNotifier, jitter: bool) -> AgentSupervisor {
    AgentSupervisor::new(
        AgentRole::workers(),
        policy(jitter),
        launcher,
        Arc::new(notifier),
    )
}

async fn crash_until_given_up(sup: &AgentSupervisor, role: AgentRole) -> Vec<Duration> {
    let mut delays = Vec::new();
    loop {
        let crashed = sup.detect_crashes().await;
        assert!(crashed.contains(&role));
        match sup.handle_crash(role).await.unwrap() {
            CrashOutcome::Restarted { attempt, delay } => {
                delays.push(delay);
                assert_eq!(attempt as usize, delays.len());
            }
            CrashOutcome::GivenUp => return delays,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Restart bound
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn always_crashing_role_restarts_exactly_max_times_then_gives_up_once() {
    let launcher = FakeLauncher::crashing();
    let notifier = MemoryNotifier::new();
    let sup = supervisor(Arc::clone(&launcher), notifier.clone(), false);

    sup.spawn(AgentRole::Designer).await.unwrap();
    let delays = crash_until_given_up(&sup, AgentRole::Designer).await;

    assert_eq!(
        delays,
        vec![Duration::from_secs(5), Duration::from_secs(10), Duration::from_secs(20)]
    );
    assert_eq!(launcher.launches(), 4, "initial spawn plus three restarts");
    assert_eq!(sup.state(AgentRole::Designer).await, Some(RoleState::GivenUp));
    assert_eq!(notifier.requiring_human().len(), 1);

    // Further crash handling never notifies again.
    assert_eq!(
        sup.handle_crash(AgentRole::Designer).await.unwrap(),
        CrashOutcome::AlreadyGivenUp
    );
    assert!(!sup.detect_crashes().await.contains(&AgentRole::Designer));
    assert_eq!(notifier.requiring_human().len(), 1);
    assert_eq!(launcher.launches(), 4);
    assert!(!sup.has_capacity(AgentRole::Designer).await);
}

#[tokio::test(start_paused = true)]
async fn jittered_backoff_is_strictly_increasing() {
    let launcher = FakeLauncher::crashing();
    let sup = supervisor(launcher, MemoryNotifier::new(), true);

    sup.spawn(AgentRole::Implementer).await.unwrap();
    let delays = crash_until_given_up(&sup, AgentRole::Implementer).await;

    assert_eq!(delays.len(), 3);
    assert!(delays.windows(2).all(|w| w[1] > w[0]), "{delays:?}");
}

#[tokio::test(start_paused = true)]
async fn failed_launches_count_against_the_restart_budget() {
    let launcher = FakeLauncher::healthy();
    let notifier = MemoryNotifier::new();
    let sup = supervisor(Arc::clone(&launcher), notifier.clone(), false);

    sup.spawn(AgentRole::Designer).await.unwrap();
    launcher.refuse.store(true, Ordering::SeqCst);
    launcher.kill_current();

    assert_eq!(sup.detect_crashes().await, vec![AgentRole::Designer]);
    assert_eq!(
        sup.handle_crash(AgentRole::Designer).await.unwrap(),
        CrashOutcome::GivenUp
    );
    assert_eq!(launcher.launches(), 4);
    assert_eq!(notifier.requiring_human().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_count_survives_replacement_and_resets_on_fresh_spawn() {
    let launcher = FakeLauncher::healthy();
    let sup = supervisor(Arc::clone(&launcher), MemoryNotifier::new(), false);

    sup.spawn(AgentRole::Designer).await.unwrap();
    launcher.kill_current();
    sup.detect_crashes().await;
    assert_eq!(
        sup.handle_crash(AgentRole::Designer).await.unwrap(),
        CrashOutcome::Restarted {
            attempt: 1,
            delay: Duration::from_secs(5)
        }
    );

    let info = sup.info(AgentRole::Designer).await.unwrap();
    assert_eq!(info.state, RoleState::Running);
    assert_eq!(info.restart_count, 1);
    assert!(info.last_restart_at.is_some());

    sup.shutdown(AgentRole::Designer, Duration::from_secs(1)).await.unwrap();
    sup.spawn(AgentRole::Designer).await.unwrap();
    assert_eq!(sup.info(AgentRole::Designer).await.unwrap().restart_count, 0);
}

// ---------------------------------------------------------------------------
// Isolation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn one_role_crashing_leaves_the_other_running() {
    let launcher = FakeLauncher::healthy();
    let sup = supervisor(Arc::clone(&launcher), MemoryNotifier::new(), false);

    assert!(sup.spawn_all().await.is_empty());
    // The implementer was launched last; kill only it.
    launcher.kill_current();

    assert_eq!(sup.detect_crashes().await, vec![AgentRole::Implementer]);
    assert!(sup.is_alive(AgentRole::Designer).await);
    assert_eq!(sup.state(AgentRole::Designer).await, Some(RoleState::Running));
    assert!(sup.link(AgentRole::Designer).await.is_some());
    assert!(sup.link(AgentRole::Implementer).await.is_none());
}

#[tokio::test]
async fn spawning_a_running_role_is_rejected() {
    let sup = supervisor(FakeLauncher::healthy(), MemoryNotifier::new(), false);
    sup.spawn(AgentRole::Designer).await.unwrap();
    assert!(matches!(
        sup.spawn(AgentRole::Designer).await,
        Err(SupervisorError::AlreadyRunning(AgentRole::Designer))
    ));
    assert!(matches!(
        sup.spawn(AgentRole::Coordinator).await,
        Err(SupervisorError::UnknownRole(AgentRole::Coordinator))
    ));
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn silent_worker_becomes_unresponsive_and_dead_worker_is_dead() {
    let launcher = FakeLauncher::healthy();
    let sup = supervisor(Arc::clone(&launcher), MemoryNotifier::new(), false);
    sup.spawn(AgentRole::Designer).await.unwrap();

    assert_eq!(sup.health(AgentRole::Designer).await, AgentHealth::Healthy);

    tokio::time::advance(Duration::from_secs(151)).await;
    assert!(sup.is_alive(AgentRole::Designer).await);
    assert_eq!(sup.health(AgentRole::Designer).await, AgentHealth::Unresponsive);

    sup.heartbeats().beat(AgentRole::Designer);
    assert_eq!(sup.health(AgentRole::Designer).await, AgentHealth::Healthy);

    launcher.kill_current();
    assert_eq!(sup.health(AgentRole::Designer).await, AgentHealth::Dead);
    assert_eq!(sup.health(AgentRole::Implementer).await, AgentHealth::Dead);
}

#[tokio::test(start_paused = true)]
async fn force_restart_kills_then_crash_path_restarts() {
    let launcher = FakeLauncher::healthy();
    let sup = supervisor(Arc::clone(&launcher), MemoryNotifier::new(), false);
    sup.spawn(AgentRole::Designer).await.unwrap();

    sup.force_restart(AgentRole::Designer).await.unwrap();
    assert_eq!(sup.state(AgentRole::Designer).await, Some(RoleState::Crashed));
    assert!(matches!(
        sup.handle_crash(AgentRole::Designer).await.unwrap(),
        CrashOutcome::Restarted { attempt: 1, .. }
    ));
    assert_eq!(launcher.launches(), 2);
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn shutdown_is_idempotent() {
    let launcher = FakeLauncher::healthy();
    let sup = supervisor(Arc::clone(&launcher), MemoryNotifier::new(), false);
    sup.spawn(AgentRole::Designer).await.unwrap();

    sup.shutdown(AgentRole::Designer, Duration::from_secs(2)).await.unwrap();
    sup.shutdown(AgentRole::Designer, Duration::from_secs(2)).await.unwrap();

    assert_eq!(sup.state(AgentRole::Designer).await, Some(RoleState::Stopped));
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
    assert!(!sup.is_alive(AgentRole::Designer).await);

    // Never-started roles shut down as a no-op too.
    sup.shutdown(AgentRole::Implementer, Duration::from_secs(2)).await.unwrap();
    assert_eq!(sup.state(AgentRole::Implementer).await, Some(RoleState::NotStarted));

    sup.shutdown_all(Duration::from_secs(2)).await;
    sup.shutdown_all(Duration::from_secs(2)).await;
}

#[tokio::test(start_paused = true)]
async fn stubborn_worker_is_killed_after_timeout() {
    let launcher = FakeLauncher::healthy();
    launcher.ignore_terminate.store(true, Ordering::SeqCst);
    let sup = supervisor(Arc::clone(&launcher), MemoryNotifier::new(), false);
    sup.spawn(AgentRole::Implementer).await.unwrap();
    let alive = launcher.current_alive();

    let started = tokio::time::Instant::now();
    sup.shutdown(AgentRole::Implementer, Duration::from_secs(10)).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(!alive.load(Ordering::SeqCst), "worker was force-killed");
    assert_eq!(sup.state(AgentRole::Implementer).await, Some(RoleState::Stopped));
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_backoff_abandons_the_restart() {
    let launcher = FakeLauncher::healthy();
    let sup = Arc::new(supervisor(Arc::clone(&launcher), MemoryNotifier::new(), false));
    sup.spawn(AgentRole::Designer).await.unwrap();
    launcher.kill_current();
    sup.detect_crashes().await;

    let pending = tokio::spawn({
        let sup = Arc::clone(&sup);
        async move { sup.handle_crash(AgentRole::Designer).await }
    });
    // Let the restart enter its backoff sleep.
    tokio::task::yield_now().await;
    assert_eq!(sup.state(AgentRole::Designer).await, Some(RoleState::Backoff));

    sup.shutdown(AgentRole::Designer, Duration::from_secs(1)).await.unwrap();
    assert_eq!(pending.await.unwrap().unwrap(), CrashOutcome::Aborted);
    assert_eq!(sup.state(AgentRole::Designer).await, Some(RoleState::Stopped));
    assert_eq!(launcher.launches(), 1);
}

// ---------------------------------------------------------------------------
// Reset
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reset_brings_a_given_up_role_back() {
    let launcher = FakeLauncher::crashing();
    let sup = supervisor(Arc::clone(&launcher), MemoryNotifier::new(), false);
    sup.spawn(AgentRole::Designer).await.unwrap();
    crash_until_given_up(&sup, AgentRole::Designer).await;

    assert!(matches!(
        sup.spawn(AgentRole::Designer).await,
        Err(SupervisorError::GivenUp(AgentRole::Designer))
    ));

    launcher.crash_on_start.store(false, Ordering::SeqCst);
    assert!(sup.reset(AgentRole::Designer).await.unwrap());
    let info = sup.info(AgentRole::Designer).await.unwrap();
    assert_eq!(info.state, RoleState::Running);
    assert_eq!(info.restart_count, 0);
    assert!(sup.has_capacity(AgentRole::Designer).await);

    // Resetting a role that did not give up does nothing.
    assert!(!sup.reset(AgentRole::Designer).await.unwrap());
}
