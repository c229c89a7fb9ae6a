//! Tracing subscriber setup shared by the `af` binary and tests.

pub mod logging;

pub use logging::{init_logging, LogSettings};
