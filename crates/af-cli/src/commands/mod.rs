pub mod bottlenecks;
pub mod reset;
pub mod start;
pub mod status;
pub mod stop;

use std::path::Path;

use af_core::config::Config;
use anyhow::Context;

/// Load the config from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("could not load config from {}", path.display())),
        None => Config::load().context("could not load config"),
    }
}
