//! Token codec: authenticated encryption plus compression.
//!
//! - `SessionKey`: 32-byte AES key that never shows up in logs
//! - `encrypt` / `decrypt`: AES-256-GCM with the nonce prepended
//! - `compress` / `decompress`: raw deflate
//! - `seal` / `open`: both steps in the order tokens use them

use std::io::{Read, Write};
use std::path::Path;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

/// Key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes (96-bit GCM nonce).
pub const NONCE_LEN: usize = 12;

/// Errors from the token codec.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Ciphertext failed authentication or is too short.
    #[error("integrity check failed")]
    Integrity,

    /// Plaintext could not be decompressed.
    #[error("invalid token format: {0}")]
    Format(String),

    /// Encryption or compression failed.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// Key material is malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// IO error reading or writing the key file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Symmetric key used to seal tokens.
pub struct SessionKey(SecretBox<[u8; KEY_LEN]>);

/// Where a loaded key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    /// Read from an existing key file.
    Loaded,
    /// Freshly generated.
    Generated,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    key: String,
}

impl SessionKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(SecretBox::new(Box::new(bytes)))
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        key
    }

    /// Parse a hex-encoded key.
    ///
    /// # Errors
    ///
    /// Returns error if the string is not 64 hex characters.
    pub fn from_hex(hex_key: &str) -> Result<Self, CodecError> {
        let mut decoded =
            hex::decode(hex_key.trim()).map_err(|e| CodecError::InvalidKey(e.to_string()))?;
        if decoded.len() != KEY_LEN {
            decoded.zeroize();
            return Err(CodecError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                decoded.len()
            )));
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }

    /// Hex encoding of the key, for persistence only.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.expose_secret())
    }

    /// Read a key file.
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self, CodecError> {
        let content = std::fs::read_to_string(path)?;
        let file: KeyFile =
            serde_json::from_str(&content).map_err(|e| CodecError::InvalidKey(e.to_string()))?;
        Self::from_hex(&file.key)
    }

    /// Write the key file with restrictive permissions (0600 on Unix).
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), CodecError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string(&KeyFile { key: self.to_hex() })
            .map_err(|e| CodecError::Encoding(e.to_string()))?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Load the key file, or generate a key and try to persist it.
    ///
    /// A key that cannot be saved is still returned: tokens then only
    /// survive until the process exits.
    #[must_use]
    pub fn load_or_generate(path: &Path) -> (Self, KeyOrigin) {
        match Self::load(path) {
            Ok(key) => (key, KeyOrigin::Loaded),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "no usable key file");
                let key = Self::generate();
                if let Err(err) = key.save(path) {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "could not persist token key, sessions will not survive a restart"
                    );
                }
                (key, KeyOrigin::Generated)
            }
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(self.0.expose_secret().into())
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

/// Encrypt with AES-256-GCM, prepending a fresh random nonce.
///
/// # Errors
///
/// Returns `CodecError::Encoding` if the cipher rejects the input.
pub fn encrypt(plaintext: &[u8], key: &SessionKey) -> Result<Vec<u8>, CodecError> {
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext)
        .map_err(|e| CodecError::Encoding(e.to_string()))?;

    Ok([nonce_bytes.as_slice(), &ciphertext].concat())
}

/// Decrypt a nonce-prefixed AES-256-GCM message.
///
/// # Errors
///
/// Returns `CodecError::Integrity` if the input is not longer than the
/// nonce or fails authentication.
pub fn decrypt(ciphertext: &[u8], key: &SessionKey) -> Result<Vec<u8>, CodecError> {
    if ciphertext.len() <= NONCE_LEN {
        return Err(CodecError::Integrity);
    }

    let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| CodecError::Integrity)
}

/// Raw deflate at best compression.
///
/// # Errors
///
/// Returns `CodecError::Encoding` if the encoder fails.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Encoding(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CodecError::Encoding(e.to_string()))
}

/// Inflate raw deflate data.
///
/// # Errors
///
/// Returns `CodecError::Format` if the stream is not valid deflate.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Format(e.to_string()))?;
    Ok(out)
}

/// Compress then encrypt.
///
/// # Errors
///
/// Returns `CodecError::Encoding` on failure.
pub fn seal(plaintext: &[u8], key: &SessionKey) -> Result<Vec<u8>, CodecError> {
    encrypt(&compress(plaintext)?, key)
}

/// Decrypt then decompress.
///
/// # Errors
///
/// Returns `CodecError::Integrity` or `CodecError::Format`.
pub fn open(sealed: &[u8], key: &SessionKey) -> Result<Vec<u8>, CodecError> {
    decompress(&decrypt(sealed, key)?)
}
