use tracing_subscriber::{fmt, EnvFilter};

/// Subscriber settings, usually taken from `[general]` in the config file.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Filter directive used when `RUST_LOG` is unset (e.g. "info",
    /// "af_daemon=debug,info").
    pub level: String,
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `settings.level`. Safe to call more than
/// once; later calls are no-ops.
pub fn init_logging(service_name: &str, settings: &LogSettings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(false)
            .try_init()
            .ok();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_level(true)
            .try_init()
            .ok();
    }

    tracing::info!(
        service = service_name,
        json = settings.json,
        "logging initialised"
    );
}
