//! The auto-foreman daemon: the coordinator work loop and the wiring that
//! runs it next to the supervised workers.

pub mod coordinator;
pub mod daemon;
pub mod patrol;
pub mod watchdog;

pub use coordinator::{Coordinator, CycleError, CycleReport, ItemProgress};
pub use daemon::{Daemon, DaemonExit};
