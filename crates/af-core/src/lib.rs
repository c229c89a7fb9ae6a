//! Core domain for auto-foreman: work items and tasks, configuration, the
//! shared priority task queue, the backlog reader, and the small on-disk
//! records (snapshot, error log, status, lockfile, control inbox) the
//! coordinator and CLI exchange.

pub mod backlog;
pub mod config;
pub mod control;
pub mod error_log;
pub mod lockfile;
pub mod snapshot;
pub mod status;
pub mod task_queue;
pub mod types;
