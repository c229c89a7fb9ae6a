//! Reliability plumbing for the auto-foreman daemon: cooperative shutdown
//! with drain confirmation, exponential backoff, and the notification sink.

pub mod backoff;
pub mod notify;
pub mod shutdown;
