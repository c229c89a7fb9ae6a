use af_core::config::Config;
use af_core::control::{ControlInbox, ControlRequest};
use af_core::lockfile::DaemonLockfile;
use af_core::types::AgentRole;

/// Run the `reset` subcommand: ask the daemon to bring a given-up worker
/// back. The request is picked up on the next coordinator cycle.
pub fn run(config: &Config, role: AgentRole) -> anyhow::Result<()> {
    if !AgentRole::workers().contains(&role) {
        anyhow::bail!("{role} is not a worker role");
    }
    let path = ControlInbox::new(config.control_dir()).post(ControlRequest::Reset(role))?;
    if DaemonLockfile::read_valid(&config.lockfile_path()).is_some() {
        println!("Reset of {role} requested.");
    } else {
        println!(
            "auto-foreman is not running; the reset request ({}) will apply on next start.",
            path.display()
        );
    }
    Ok(())
}
