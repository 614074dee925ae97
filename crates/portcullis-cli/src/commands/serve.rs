//! Serve command - run the gateway.

use std::path::Path;

use anyhow::{Context, Result};
use portcullis_gateway::GatewayConfig;

use crate::ui;

/// Serve command arguments.
#[derive(Debug, Clone, Default)]
pub struct ServeArgs {
    /// Port override.
    pub port: Option<u16>,
    /// Bind address override.
    pub bind: Option<String>,
    /// Debug mode: cookies without `Secure`.
    pub debug: bool,
}

/// Run the gateway until interrupted.
///
/// # Errors
///
/// Returns error if the configuration is invalid or the server fails.
pub async fn run_serve(config_file: Option<&Path>, args: ServeArgs) -> Result<()> {
    let mut config = super::load_config(config_file)?;
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    if let Some(bind) = args.bind {
        config.gateway.bind_address = bind;
    }
    if args.debug {
        config.gateway.debug = true;
    }
    config.validate()?;

    ensure_definition_file(&config.backends.apps_file)?;
    ensure_definition_file(&config.backends.davs_file)?;

    ui::header("Starting Portcullis");
    ui::kv(
        "Address",
        &format!("{}:{}", config.gateway.bind_address, config.gateway.port),
    );
    ui::kv("Hostname", &config.gateway.hostname);
    ui::kv("Apps", &config.backends.apps_file.display().to_string());
    ui::kv("Davs", &config.backends.davs_file.display().to_string());
    if config.oauth2.is_none() {
        ui::kv("Login", "local accounts only");
    }
    if config.gateway.debug {
        ui::warning("Debug mode: session cookies are not marked Secure");
    }
    println!();

    portcullis_gateway::start(GatewayConfig::from(&config)).await?;
    Ok(())
}

/// Create an empty definition file so a fresh install starts.
fn ensure_definition_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, "[]").with_context(|| format!("Failed to create {}", path.display()))?;
    tracing::info!(path = %path.display(), "created empty definition file");
    Ok(())
}
