use std::time::Duration;

use af_core::config::Config;
use af_core::lockfile::DaemonLockfile;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Run the `stop` subcommand: send SIGTERM to the daemon and wait until it
/// has released its lockfile.
pub async fn run(config: &Config, timeout_secs: u64) -> anyhow::Result<()> {
    let lock_path = config.lockfile_path();
    let Some(lock) = DaemonLockfile::read_valid(&lock_path) else {
        println!("auto-foreman is not running");
        return Ok(());
    };

    lock.request_stop()
        .map_err(|e| anyhow::anyhow!("could not signal pid {}: {e}", lock.pid))?;
    println!("Stopping auto-foreman (pid {})...", lock.pid);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while lock_path.exists() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "auto-foreman (pid {}) did not stop within {timeout_secs}s",
                lock.pid
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    println!("Stopped.");
    Ok(())
}
