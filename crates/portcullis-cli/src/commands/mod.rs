//! CLI command implementations.

pub mod check_host;
pub mod config;
pub mod key;
pub mod serve;
pub mod users;

pub use check_host::run_check_host;
pub use config::run_config;
pub use key::run_key;
pub use serve::run_serve;
pub use users::run_users;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use portcullis_core::Config;

/// Config file in use: the `--config` path or the default location.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(Config::default_path, Path::to_path_buf)
}

/// Load the configuration with environment overrides applied.
///
/// A missing default file yields the defaults; a missing explicit file is
/// an error.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let config = match explicit {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_default().context("Failed to load default config")?,
    };
    Ok(config.with_env_overrides())
}
