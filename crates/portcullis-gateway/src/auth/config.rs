//! Authentication configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default session lifetime in hours.
const DEFAULT_SESSION_TTL_HOURS: u64 = 24;

/// Lifetime of the OAuth2 state cookie.
pub const OAUTH_STATE_TTL: Duration = Duration::from_secs(30);

/// Lifetime of the post-login redirect cookie.
pub const REDIRECT_COOKIE_TTL: Duration = Duration::from_secs(60);

/// Name of the OAuth2 state cookie.
pub const OAUTH_STATE_COOKIE: &str = "oauth2_state";

/// Name of the post-login redirect cookie.
pub const REDIRECT_COOKIE: &str = "redirectAfterLogin";

/// Header carrying the anti-forgery value.
pub const XSRF_HEADER: &str = "XSRF-TOKEN";

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Host that serves the gateway's own endpoints; cookie domain.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Port clients use to reach the gateway.
    #[serde(default = "default_public_port")]
    pub public_port: u16,

    /// Role that grants administrator rights.
    #[serde(default = "default_admin_role")]
    pub admin_role: String,

    /// Session cookie name.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Session lifetime in hours.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_hours: u64,

    /// File holding the token key.
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    /// Local accounts file.
    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,

    /// Debug mode: cookies without `Secure`.
    #[serde(default)]
    pub debug: bool,
}

fn default_hostname() -> String {
    "portcullis.127.0.0.1.nip.io".to_string()
}

const fn default_public_port() -> u16 {
    443
}

fn default_admin_role() -> String {
    "ADMINS".to_string()
}

fn default_cookie_name() -> String {
    "auth_token".to_string()
}

const fn default_session_ttl() -> u64 {
    DEFAULT_SESSION_TTL_HOURS
}

fn default_key_file() -> PathBuf {
    PathBuf::from("token.key")
}

fn default_users_file() -> PathBuf {
    PathBuf::from("users.json")
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            public_port: default_public_port(),
            admin_role: default_admin_role(),
            cookie_name: default_cookie_name(),
            session_ttl_hours: default_session_ttl(),
            key_file: default_key_file(),
            users_file: default_users_file(),
            debug: false,
        }
    }
}

impl AuthConfig {
    /// Create a new auth config builder.
    #[must_use]
    pub fn builder() -> AuthConfigBuilder {
        AuthConfigBuilder::default()
    }

    /// Session lifetime as Duration.
    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours * 3600)
    }

    /// `host[:port]` the login page lives on. The port is omitted when it
    /// is the HTTPS default.
    #[must_use]
    pub fn login_authority(&self) -> String {
        if self.public_port == 443 {
            self.hostname.clone()
        } else {
            format!("{}:{}", self.hostname, self.public_port)
        }
    }
}

impl From<&portcullis_core::Config> for AuthConfig {
    fn from(config: &portcullis_core::Config) -> Self {
        Self {
            hostname: config.gateway.hostname.clone(),
            public_port: config.gateway.public_port,
            admin_role: config.auth.admin_role.clone(),
            cookie_name: config.auth.cookie_name.clone(),
            session_ttl_hours: config.auth.session_ttl_hours,
            key_file: config.auth.key_file.clone(),
            users_file: config.auth.users_file.clone(),
            debug: config.gateway.debug,
        }
    }
}

/// Builder for `AuthConfig`.
#[derive(Debug, Default)]
pub struct AuthConfigBuilder {
    config: AuthConfig,
}

impl AuthConfigBuilder {
    /// Set the gateway host name.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    /// Set the public port.
    #[must_use]
    pub const fn public_port(mut self, port: u16) -> Self {
        self.config.public_port = port;
        self
    }

    /// Set the admin role.
    #[must_use]
    pub fn admin_role(mut self, role: impl Into<String>) -> Self {
        self.config.admin_role = role.into();
        self
    }

    /// Set the session cookie name.
    #[must_use]
    pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
        self.config.cookie_name = name.into();
        self
    }

    /// Set session lifetime in hours.
    #[must_use]
    pub const fn session_ttl_hours(mut self, hours: u64) -> Self {
        self.config.session_ttl_hours = hours;
        self
    }

    /// Set the key file.
    #[must_use]
    pub fn key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.key_file = path.into();
        self
    }

    /// Set the local accounts file.
    #[must_use]
    pub fn users_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.users_file = path.into();
        self
    }

    /// Set debug mode.
    #[must_use]
    pub const fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build the config.
    #[must_use]
    pub fn build(self) -> AuthConfig {
        self.config
    }
}
