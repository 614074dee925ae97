//! Configuration loading and validation.
//!
//! JSON5 format. Config location: `~/.portcullis/portcullis.json`
//! (directory overridable with `PORTCULLIS_STATE_DIR`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON5 parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] json5::Error),

    /// Config validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing required field.
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Listener and public host settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Session and credential settings.
    #[serde(default)]
    pub auth: AuthSection,

    /// Backend definition files.
    #[serde(default)]
    pub backends: BackendsConfig,

    /// External identity provider, if any.
    #[serde(default)]
    pub oauth2: Option<OAuth2Config>,

    /// Global settings.
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns error if config cannot be loaded or parsed.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a path.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        Self::state_dir().join("portcullis.json")
    }

    /// Get the state directory.
    ///
    /// Uses `PORTCULLIS_STATE_DIR` env var if set, otherwise `~/.portcullis`.
    #[must_use]
    pub fn state_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("PORTCULLIS_STATE_DIR") {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".portcullis")
        } else {
            PathBuf::from(".portcullis")
        }
    }

    /// Apply `PORTCULLIS_*` environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok());
        self
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(hostname) = lookup("PORTCULLIS_HOSTNAME") {
            self.gateway.hostname = hostname;
        }
        if let Some(role) = lookup("PORTCULLIS_ADMIN_ROLE") {
            self.auth.admin_role = role;
        }
        if let Some(debug) = lookup("PORTCULLIS_DEBUG") {
            self.gateway.debug = matches!(debug.as_str(), "1" | "true" | "yes");
        }

        let oauth_vars = [
            "PORTCULLIS_CLIENT_ID",
            "PORTCULLIS_CLIENT_SECRET",
            "PORTCULLIS_REDIRECT_URL",
            "PORTCULLIS_AUTH_URL",
            "PORTCULLIS_TOKEN_URL",
            "PORTCULLIS_USERINFO_URL",
            "PORTCULLIS_LOGOUT_URL",
            "PORTCULLIS_ISSUER_URL",
        ];
        if self.oauth2.is_none() && oauth_vars.iter().any(|v| lookup(v).is_some()) {
            self.oauth2 = Some(OAuth2Config::default());
        }
        if let Some(oauth2) = self.oauth2.as_mut() {
            let slots = [
                (oauth_vars[0], &mut oauth2.client_id),
                (oauth_vars[1], &mut oauth2.client_secret),
                (oauth_vars[2], &mut oauth2.redirect_url),
                (oauth_vars[3], &mut oauth2.auth_url),
                (oauth_vars[4], &mut oauth2.token_url),
                (oauth_vars[5], &mut oauth2.userinfo_url),
                (oauth_vars[6], &mut oauth2.logout_url),
                (oauth_vars[7], &mut oauth2.issuer_url),
            ];
            for (var, slot) in slots {
                if let Some(value) = lookup(var) {
                    *slot = value;
                }
            }
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.port == 0 {
            return Err(ConfigError::Validation(
                "Gateway port cannot be 0".to_string(),
            ));
        }

        if self.gateway.hostname.trim().is_empty() {
            return Err(ConfigError::MissingField("gateway.hostname".to_string()));
        }

        if self.auth.session_ttl_hours == 0 {
            return Err(ConfigError::Validation(
                "Session lifetime cannot be 0".to_string(),
            ));
        }

        if let Some(oauth2) = &self.oauth2 {
            if oauth2.client_id.is_empty() {
                return Err(ConfigError::MissingField("oauth2.clientId".to_string()));
            }
            if oauth2.redirect_url.is_empty() {
                return Err(ConfigError::MissingField("oauth2.redirectUrl".to_string()));
            }
            if oauth2.issuer_url.is_empty()
                && (oauth2.auth_url.is_empty()
                    || oauth2.token_url.is_empty()
                    || oauth2.userinfo_url.is_empty())
            {
                return Err(ConfigError::Validation(
                    "oauth2 needs either issuerUrl or authUrl, tokenUrl and userinfoUrl"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Listener and public host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Host name that serves the gateway's own endpoints.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Port clients reach the gateway on, used in redirects.
    #[serde(default = "default_public_port")]
    pub public_port: u16,

    /// Address to bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Directory with the gateway's web front-end.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,

    /// Debug mode: cookies are not marked `Secure`.
    #[serde(default)]
    pub debug: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            public_port: default_public_port(),
            bind_address: default_bind_address(),
            static_dir: default_static_dir(),
            debug: false,
        }
    }
}

fn default_hostname() -> String {
    "portcullis.127.0.0.1.nip.io".to_string()
}

const fn default_port() -> u16 {
    8443
}

const fn default_public_port() -> u16 {
    443
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("web")
}

/// Session and local credential configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSection {
    /// Role that grants administrator rights.
    #[serde(default = "default_admin_role")]
    pub admin_role: String,

    /// File holding the token key.
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    /// Local accounts file.
    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,

    /// Session cookie name.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Session lifetime in hours.
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            admin_role: default_admin_role(),
            key_file: default_key_file(),
            users_file: default_users_file(),
            cookie_name: default_cookie_name(),
            session_ttl_hours: default_session_ttl_hours(),
        }
    }
}

fn default_admin_role() -> String {
    "ADMINS".to_string()
}

fn default_key_file() -> PathBuf {
    Config::state_dir().join("token.key")
}

fn default_users_file() -> PathBuf {
    Config::state_dir().join("users.json")
}

fn default_cookie_name() -> String {
    "auth_token".to_string()
}

const fn default_session_ttl_hours() -> u64 {
    24
}

/// Backend definition files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendsConfig {
    /// Reverse-proxied and statically served applications.
    #[serde(default = "default_apps_file")]
    pub apps_file: PathBuf,

    /// File-serving endpoints.
    #[serde(default = "default_davs_file")]
    pub davs_file: PathBuf,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            apps_file: default_apps_file(),
            davs_file: default_davs_file(),
        }
    }
}

fn default_apps_file() -> PathBuf {
    Config::state_dir().join("apps.json")
}

fn default_davs_file() -> PathBuf {
    Config::state_dir().join("davs.json")
}

/// OAuth2 identity provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuth2Config {
    /// Client identifier registered with the provider.
    #[serde(default)]
    pub client_id: String,

    /// Client secret.
    #[serde(default)]
    pub client_secret: String,

    /// Callback URL registered with the provider.
    #[serde(default)]
    pub redirect_url: String,

    /// Authorization endpoint.
    #[serde(default)]
    pub auth_url: String,

    /// Token endpoint.
    #[serde(default)]
    pub token_url: String,

    /// User info endpoint.
    #[serde(default)]
    pub userinfo_url: String,

    /// Where `/Logout` sends the browser.
    #[serde(default)]
    pub logout_url: String,

    /// OpenID issuer used to discover missing endpoints.
    #[serde(default)]
    pub issuer_url: String,

    /// Requested scopes.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

fn default_scopes() -> Vec<String> {
    ["login", "memberOf", "displayName", "email"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Global settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    /// Log format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}
