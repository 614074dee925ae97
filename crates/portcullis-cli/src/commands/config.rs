//! Config inspection and editing.

use std::path::Path;

use anyhow::{Context, Result};
use portcullis_core::Config;
use serde_json::Value;

use crate::ui;

/// Config command actions.
#[derive(Debug, Clone, Default)]
pub enum ConfigAction {
    /// Print the effective configuration.
    #[default]
    Show,
    /// Check the configuration file.
    Validate,
    /// Print the configuration file location.
    Path,
    /// Print one value by dotted key.
    Get(String),
    /// Set one value by dotted key.
    Set(String, String),
}

/// Run the config command.
///
/// # Errors
///
/// Returns error if the file cannot be read, parsed or written.
pub fn run_config(config_file: Option<&Path>, action: ConfigAction) -> Result<()> {
    let path = super::config_path(config_file);
    match action {
        ConfigAction::Show => {
            let config = super::load_config(config_file)?;
            if !path.exists() {
                ui::info(&format!(
                    "No config file at {}, showing defaults",
                    path.display()
                ));
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigAction::Validate => validate_config(&path),
        ConfigAction::Path => {
            println!("{}", path.display());
            Ok(())
        }
        ConfigAction::Get(key) => {
            let value = read_raw(&path)?;
            match lookup(&value, &key) {
                Some(Value::String(s)) => println!("{s}"),
                Some(other) => println!("{}", serde_json::to_string_pretty(other)?),
                None => anyhow::bail!("Key not found: {key}"),
            }
            Ok(())
        }
        ConfigAction::Set(key, raw) => {
            let mut value = if path.exists() {
                read_raw(&path)?
            } else {
                Value::Object(serde_json::Map::new())
            };
            set_nested_value(&mut value, &key, parse_value(&raw))?;

            // Refuse to write a file the gateway would reject.
            let config: Config = serde_json::from_value(value.clone())
                .with_context(|| format!("{key} = {raw} does not fit the config schema"))?;
            config.validate()?;

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, serde_json::to_string_pretty(&value)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            ui::success(&format!("Set {key} = {raw}"));
            Ok(())
        }
    }
}

fn read_raw(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Config file not found: {}", path.display()))?;
    Ok(json5::from_str(&content)?)
}

fn validate_config(path: &Path) -> Result<()> {
    ui::header("Validating Configuration");

    if !path.exists() {
        ui::warning(&format!("Config file not found: {}", path.display()));
        ui::info("Defaults apply; run 'portcullis config set gateway.hostname <host>' to create one");
        return Ok(());
    }

    let content = std::fs::read_to_string(path)?;
    if let Err(e) = json5::from_str::<Value>(&content) {
        ui::error(&format!("Syntax error: {e}"));
        anyhow::bail!("invalid configuration");
    }
    ui::success("Syntax: Valid JSON5");

    let config = match Config::load(path) {
        Ok(config) => config.with_env_overrides(),
        Err(e) => {
            ui::error(&format!("Schema error: {e}"));
            anyhow::bail!("invalid configuration");
        }
    };
    ui::success("Schema: Configuration is valid");

    for (label, file) in [
        ("Apps", &config.backends.apps_file),
        ("Davs", &config.backends.davs_file),
        ("Users", &config.auth.users_file),
    ] {
        if file.exists() {
            ui::success(&format!("{label}: {}", file.display()));
        } else {
            ui::warning(&format!("{label}: {} does not exist yet", file.display()));
        }
    }
    if config.oauth2.is_none() {
        ui::info("No OAuth2 provider configured, local accounts only");
    }
    Ok(())
}

/// Value at a dotted path, indexing arrays by number.
fn lookup<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(root, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Set a value at a dotted path, creating intermediate objects.
fn set_nested_value(root: &mut Value, key: &str, value: Value) -> Result<()> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let Some(last) = parts.pop().filter(|p| !p.is_empty()) else {
        anyhow::bail!("Invalid key: {key}");
    };

    let mut current = root;
    for part in parts {
        current = current
            .as_object_mut()
            .with_context(|| format!("Cannot set {key}: {part} is inside a non-object"))?
            .entry(part)
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    current
        .as_object_mut()
        .with_context(|| format!("Cannot set {key}: parent is not an object"))?
        .insert(last.to_string(), value);
    Ok(())
}

/// JSON when it parses, otherwise a plain string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_lookup() {
        let value = json!({"gateway": {"port": 8443}, "oauth2": {"scopes": ["openid", "email"]}});
        assert_eq!(lookup(&value, "gateway.port"), Some(&json!(8443)));
        assert_eq!(lookup(&value, "oauth2.scopes.1"), Some(&json!("email")));
        assert_eq!(lookup(&value, "gateway.missing"), None);
    }

    #[test]
    fn test_set_nested_value() {
        let mut value = json!({"gateway": {"port": 443}});
        set_nested_value(&mut value, "gateway.port", parse_value("8443")).unwrap();
        set_nested_value(&mut value, "auth.adminRole", parse_value("OPS")).unwrap();
        assert_eq!(value, json!({"gateway": {"port": 8443}, "auth": {"adminRole": "OPS"}}));
        assert!(set_nested_value(&mut value, "", json!(1)).is_err());
        assert!(set_nested_value(&mut value, "gateway.port.x", json!(1)).is_err());
    }

    #[test]
    fn test_set_writes_valid_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("portcullis.json");

        run_config(
            Some(&path),
            ConfigAction::Set("gateway.hostname".to_string(), "gate.test".to_string()),
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway.hostname, "gate.test");

        // Port 0 fails validation and leaves the file untouched.
        assert!(
            run_config(
                Some(&path),
                ConfigAction::Set("gateway.port".to_string(), "0".to_string()),
            )
            .is_err()
        );
        assert_eq!(Config::load(&path).unwrap().gateway.port, config.gateway.port);
    }
}
