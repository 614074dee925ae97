//! # Portcullis Core
//!
//! Core types and configuration for the Portcullis access gateway.
//!
//! This crate provides:
//! - Configuration loading and validation (JSON5 format)
//! - The token codec: AES-256-GCM sealing with deflate compression
//! - Identity types carried inside session tokens

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod types;

pub use codec::{CodecError, KeyOrigin, SessionKey};
pub use config::{Config, ConfigError};
pub use types::{SessionPrincipal, User};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::codec::SessionKey;
    pub use crate::config::Config;
    pub use crate::types::*;
}
