//! Authentication and authorization for the gateway.
//!
//! This module provides:
//! - Encrypted, expiring session tokens and their transports
//! - The authorization middleware that guards backends and API routes
//! - Local accounts with Argon2 password hashes
//! - The OAuth2 authorization-code login flow
//! - Scoped share tokens

mod config;
pub mod handlers;
mod middleware;
pub mod oauth2;
pub mod share;
pub mod tokens;
mod users;

pub use config::{
    AuthConfig, AuthConfigBuilder, OAUTH_STATE_COOKIE, OAUTH_STATE_TTL, REDIRECT_COOKIE,
    REDIRECT_COOKIE_TTL, XSRF_HEADER,
};
pub use middleware::{
    AccessPolicy, AuthState, Authenticated, Authorizer, LEGACY_CLIENT_SIGNATURES, TokenAuthorizer,
};
pub use tokens::{Clock, ManualClock, SystemClock, TokenError, TokenManager};
pub use users::{Account, CredentialVerifier, UserStore, hash_password};

use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token missing, invalid or expired.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Login or password did not match.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// None of the user's roles is allowed.
    #[error("no user role among {roles:?} is in allowed roles ({allowed:?})")]
    ForbiddenRole {
        /// Roles held by the user.
        roles: Vec<String>,
        /// Roles the resource accepts.
        allowed: Vec<String>,
    },

    /// Anti-forgery header missing or wrong.
    #[error("XSRF protection triggered")]
    XsrfMismatch,

    /// Token is bound to a different URL.
    #[error("token restricted to url: {0}")]
    ScopeMismatch(String),

    /// Token only permits safe methods.
    #[error("token is read only")]
    ReadOnly,

    /// OAuth2 state parameter did not match the state cookie.
    #[error("invalid oauth state")]
    InvalidState,

    /// Identity provider exchange failed.
    #[error("identity provider error: {0}")]
    ProviderExchange(String),

    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// Requested item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),
}
