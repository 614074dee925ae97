//! Token key management.

use std::path::Path;

use anyhow::{Context, Result};
use portcullis_core::SessionKey;

use crate::ui;

/// Write a fresh token key to the configured key file.
///
/// Replacing a key invalidates every outstanding session and share token,
/// so an existing file is only overwritten with `force`.
///
/// # Errors
///
/// Returns error if the key file exists without `force`, or cannot be written.
pub fn run_key(config_file: Option<&Path>, force: bool) -> Result<()> {
    let config = super::load_config(config_file)?;
    let path = &config.auth.key_file;
    generate_key(path, force)?;
    ui::success(&format!("Token key written to {}", path.display()));
    if force {
        ui::warning("Existing sessions and share tokens are no longer valid");
    }
    Ok(())
}

fn generate_key(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, use --force to replace it",
            path.display()
        );
    }
    SessionKey::generate()
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}
