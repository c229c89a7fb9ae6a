//! Worker side of auto-foreman: the per-role worker lifecycle, the
//! supervisor that restarts crashed workers, and the runners that feed
//! queued tasks to them.

pub mod executor;
pub mod heartbeat;
pub mod link;
pub mod process;
pub mod roles;
pub mod runner;
pub mod state_machine;
pub mod supervisor;
