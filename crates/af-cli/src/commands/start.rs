use af_core::config::Config;
use af_daemon::{Daemon, DaemonExit};
use af_telemetry::logging::{init_logging, LogSettings};
use tracing::error;

/// Run the `start` subcommand: run the daemon in the foreground and return
/// its exit code.
pub async fn run(config: Config) -> anyhow::Result<i32> {
    init_logging(
        "auto-foreman",
        &LogSettings {
            level: config.general.log_level.clone(),
            json: config.general.json_logs,
        },
    );

    let exit = Daemon::new(config).run().await?;
    if let DaemonExit::Fatal(message) = &exit {
        error!(error = %message, "auto-foreman stopped on a fatal error");
    }
    Ok(exit.code())
}
