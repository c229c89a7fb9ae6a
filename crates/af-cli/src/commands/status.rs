use std::fmt::Write;

use af_core::config::Config;
use af_core::lockfile::DaemonLockfile;
use af_core::status::StatusReport;

/// Run the `status` subcommand: print daemon liveness and the last status
/// report the coordinator wrote.
pub fn run(config: &Config) -> anyhow::Result<()> {
    let lock = DaemonLockfile::read_valid(&config.lockfile_path());
    let report = match StatusReport::read(&config.status_path()) {
        Ok(report) => Some(report),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => anyhow::bail!("could not read {}: {e}", config.status_path().display()),
    };
    print!("{}", render(lock.as_ref(), report.as_ref()));
    Ok(())
}

pub fn render(lock: Option<&DaemonLockfile>, report: Option<&StatusReport>) -> String {
    let mut out = String::new();
    match lock {
        Some(lock) => {
            let _ = writeln!(
                out,
                "auto-foreman running  (pid {}, v{}, since {})",
                lock.pid, lock.version, lock.started_at
            );
        }
        None => out.push_str("auto-foreman is not running\n"),
    }

    let Some(report) = report else {
        out.push_str("No status report yet.\n");
        return out;
    };

    let _ = writeln!(out, "{}", "-".repeat(40));
    let _ = writeln!(out, "Updated:            {}", report.updated_at.to_rfc3339());
    let _ = writeln!(out, "Backlog items:      {}", report.backlog_items);
    let _ = writeln!(out, "Queued tasks:       {}", report.queue_depth);
    let _ = writeln!(out, "Active tasks:       {}", report.active_tasks);
    let _ = writeln!(out, "Waiting to retry:   {}", report.deferred_retries);
    let _ = writeln!(out, "Permanently failed: {}", report.permanently_failed);
    if !report.roles.is_empty() {
        out.push_str("Workers:\n");
        for role in &report.roles {
            let pid = role.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
            let _ = writeln!(
                out,
                "  {:<12} {:<10} {:<13} restarts={} pid={}",
                role.role.to_string(),
                role.state,
                role.health.to_string(),
                role.restart_count,
                pid
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_core::status::RoleStatus;
    use af_core::types::{AgentHealth, AgentRole};
    use chrono::Utc;

    fn report() -> StatusReport {
        StatusReport {
            pid: 4242,
            updated_at: Utc::now(),
            roles: vec![RoleStatus {
                role: AgentRole::Designer,
                state: "running".into(),
                health: AgentHealth::Healthy,
                restart_count: 2,
                pid: Some(777),
                last_restart_at: None,
            }],
            queue_depth: 3,
            active_tasks: 4,
            deferred_retries: 1,
            permanently_failed: 0,
            backlog_items: 12,
            slowest_tasks: Vec::new(),
        }
    }

    #[test]
    fn render_without_daemon_or_report() {
        let out = render(None, None);
        assert!(out.contains("not running"));
        assert!(out.contains("No status report yet"));
    }

    #[test]
    fn render_shows_counts_and_workers() {
        let out = render(None, Some(&report()));
        assert!(out.contains("Backlog items:      12"));
        assert!(out.contains("Active tasks:       4"));
        assert!(out.contains("designer"));
        assert!(out.contains("restarts=2 pid=777"));
    }
}
