//! # Portcullis Gateway
//!
//! Self-hosted access gateway: dispatches requests by host to reverse
//! proxied applications and file servers, and guards them with encrypted
//! session tokens issued after local or OAuth2 login.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Listing and administration endpoints.
pub mod api;
/// Authentication and authorization.
pub mod auth;
/// Host-based request dispatch.
pub mod dispatch;
/// Host name helpers.
pub mod host;
/// Live-reloadable backend registries.
pub mod registry;
/// CORS and security headers.
pub mod security;
mod server;
/// Static web front-end.
pub mod web;

pub use api::GatewayState;
pub use auth::{AuthConfig, AuthError, AuthState, TokenManager, UserStore};
pub use dispatch::HostDispatcher;
pub use registry::{AppEntry, DavEntry, Registry, RegistryError};
pub use server::{Gateway, GatewayBuilder, GatewayConfig};

/// Start the gateway server.
///
/// # Errors
///
/// Returns error if server fails to start.
pub async fn start(config: GatewayConfig) -> Result<(), GatewayError> {
    let gateway = Gateway::new(config).await?;
    gateway.run().await
}

/// Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Server error.
    #[error("Server error: {0}")]
    Server(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend registry error.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Authentication setup error.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),
}
