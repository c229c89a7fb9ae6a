use std::sync::Arc;
use std::time::Duration;

use af_agents::link::{TaskReply, TaskRequest};
use af_agents::process::{InProcessLauncher, TaskHandler};
use af_core::config::Config;
use af_core::lockfile::{AcquireResult, DaemonLockfile};
use af_core::snapshot::SnapshotStore;
use af_core::types::{AgentRole, TaskType};
use af_daemon::{Daemon, DaemonExit};
use af_harness::notify::MemoryNotifier;
use af_harness::shutdown::ShutdownReason;
use async_trait::async_trait;
use tempfile::TempDir;

/// Designer writes the artifact it was asked for; implementer just succeeds.
struct Pipeline;

#[async_trait]
impl TaskHandler for Pipeline {
    async fn handle(&self, _role: AgentRole, request: TaskRequest) -> TaskReply {
        if request.task_type == TaskType::ProduceArtifact {
            let Some(path) = request.payload.get("artifact_path").and_then(|v| v.as_str()) else {
                return TaskReply::failure(request.task_id, "no artifact path");
            };
            if let Err(e) = std::fs::write(path, "design") {
                return TaskReply::failure(request.task_id, e.to_string());
            }
        }
        TaskReply::success(request.task_id, None)
    }
}

fn config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.general.state_dir = dir.path().join("state").display().to_string();
    config.backlog.path = dir.path().join("BACKLOG.md").display().to_string();
    config.backlog.artifact_dir = dir.path().join("designs").display().to_string();
    config.coordinator.cycle_interval_secs = 1;
    std::fs::create_dir_all(config.artifact_dir()).unwrap();
    config
}

fn daemon(config: Config, notifier: &MemoryNotifier) -> Daemon {
    Daemon::new(config)
        .with_launcher(Arc::new(InProcessLauncher::new(
            Arc::new(Pipeline),
            Duration::from_secs(1),
        )))
        .with_notifier(Arc::new(notifier.clone()))
        .without_signal_handlers()
}

#[tokio::test(start_paused = true)]
async fn runs_the_pipeline_and_stops_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    std::fs::write(
        config.backlog_path(),
        "## 1: First\n- status: planned\n\n## 2: Second\n- status: planned\n",
    )
    .unwrap();
    let notifier = MemoryNotifier::new();
    let daemon = daemon(config.clone(), &notifier);

    let shutdown = daemon.shutdown_handle();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(20)).await;
        let first = shutdown.trigger(ShutdownReason::Requested);
        let second = shutdown.trigger(ShutdownReason::Signal("SIGTERM"));
        (first, second)
    });

    let exit = daemon.run().await.unwrap();
    assert_eq!(exit, DaemonExit::Clean);
    assert_eq!(exit.code(), 0);
    assert_eq!(stopper.await.unwrap(), (true, false));

    assert!(config.artifact_dir().join("1.md").exists());
    assert!(config.artifact_dir().join("2.md").exists());
    assert!(!config.lockfile_path().exists());

    let snapshot = SnapshotStore::new(config.snapshot_path()).load().unwrap().unwrap();
    assert!(snapshot.active_tasks.is_empty());
    assert!(snapshot.implemented.contains("1"));
    assert!(snapshot.implemented.contains("2"));

    assert_eq!(notifier.count_titled("auto-foreman stopped"), 1);
    assert!(notifier.requiring_human().is_empty());
}

#[tokio::test(start_paused = true)]
async fn fatal_error_saves_state_and_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.backlog.path = dir.path().join("gone").join("BACKLOG.md").display().to_string();
    let notifier = MemoryNotifier::new();

    let exit = daemon(config.clone(), &notifier).run().await.unwrap();
    assert!(matches!(exit, DaemonExit::Fatal(ref msg) if msg.contains("inaccessible")));
    assert_eq!(exit.code(), 1);

    assert!(config.snapshot_path().exists());
    assert!(!config.lockfile_path().exists());
    let alerts = notifier.requiring_human();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].title, "auto-foreman stopped on a fatal error");
}

#[tokio::test]
async fn refuses_to_start_twice_on_one_state_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let holder = DaemonLockfile::for_current_process(&config.state_dir());
    assert!(matches!(
        holder.acquire(&config.lockfile_path()).unwrap(),
        AcquireResult::Acquired
    ));

    let err = daemon(config.clone(), &MemoryNotifier::new())
        .run()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already running"));
    assert!(config.lockfile_path().exists(), "the other daemon's lock is untouched");
}

#[tokio::test]
async fn worker_commands_are_required_without_a_custom_launcher() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);

    let err = Daemon::new(config.clone()).run().await.unwrap_err();
    assert!(err.to_string().contains("no worker command configured"));
    assert!(!config.lockfile_path().exists());
}
