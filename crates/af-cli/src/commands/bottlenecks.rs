use std::fmt::Write;

use af_core::config::Config;
use af_core::status::StatusReport;
use af_core::types::TaskSummary;
use anyhow::Context;

/// Run the `bottlenecks` subcommand: print the slowest completed tasks from
/// the last status report.
pub fn run(config: &Config, limit: usize) -> anyhow::Result<()> {
    let path = config.status_path();
    let report = StatusReport::read(&path)
        .with_context(|| format!("no status report at {} (has the daemon run?)", path.display()))?;
    print!("{}", render(&report.slowest_tasks, limit));
    Ok(())
}

pub fn render(tasks: &[TaskSummary], limit: usize) -> String {
    if tasks.is_empty() {
        return "No completed tasks recorded yet.\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(out, "{:>10}  {:<12} {:<18} item", "duration", "role", "type");
    for task in tasks.iter().take(limit) {
        let _ = writeln!(
            out,
            "{:>10}  {:<12} {:<18} {}",
            format_duration(task.duration_ms),
            task.recipient_role.to_string(),
            task.task_type.to_string(),
            task.work_item_id
        );
    }
    out
}

fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    match secs {
        0 => format!("{ms}ms"),
        1..=59 => format!("{}.{}s", secs, (ms % 1000) / 100),
        60..=3599 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}
