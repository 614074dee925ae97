//! Local accounts and credential verification.
//!
//! Accounts live in a JSON array file. The file is re-read on every
//! lookup so edits made by the admin API or the CLI apply immediately.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use portcullis_core::User;
use serde::{Deserialize, Serialize};

use super::AuthError;

/// Verifies a login and password pair.
pub trait CredentialVerifier: Send + Sync {
    /// Return the matching user, or `AuthError::InvalidCredentials`.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` for unknown logins and wrong passwords alike,
    /// `Storage` when the account source is unreadable.
    fn verify(&self, login: &str, password: &str) -> Result<User, AuthError>;
}

/// A local account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Profile fields.
    #[serde(flatten)]
    pub user: User,

    /// Argon2 PHC hash.
    #[serde(default, rename = "passwordHash")]
    pub password_hash: String,

    /// Clear-text password, accepted on input only.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl Account {
    /// Create an account with a hashed password.
    ///
    /// # Errors
    ///
    /// Returns error if password hashing fails.
    pub fn new(user: User, password: &str) -> Result<Self, AuthError> {
        Ok(Self {
            user,
            password_hash: hash_password(password)?,
            password: None,
        })
    }

    /// Verify a password against this account's hash.
    ///
    /// # Errors
    ///
    /// Returns error if password doesn't match.
    pub fn verify_password(&self, password: &str) -> Result<(), AuthError> {
        verify_password(password, &self.password_hash)
    }

    /// Copy without any credential material.
    #[must_use]
    pub fn to_public(&self) -> Self {
        Self {
            user: self.user.clone(),
            password_hash: String::new(),
            password: None,
        }
    }
}

/// Account store backed by a JSON file.
///
/// Clones share one write lock, so concurrent updates through the same
/// store never overwrite each other.
#[derive(Debug, Clone)]
pub struct UserStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl UserStore {
    /// Use the accounts file at `path`. The file need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Path of the accounts file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all accounts. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn list(&self) -> Result<Vec<Account>, AuthError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AuthError::Storage(format!("Failed to read accounts: {e}"))),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| AuthError::Storage(format!("Failed to parse accounts: {e}")))
    }

    /// Find an account by login.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn get_by_login(&self, login: &str) -> Result<Option<Account>, AuthError> {
        Ok(self.list()?.into_iter().find(|a| a.user.login == login))
    }

    /// Insert or replace an account by id.
    ///
    /// A supplied clear-text `password` is hashed. A new account needs
    /// either a password or an existing hash; an update without either
    /// keeps the stored hash. An id of 0 or below picks the next free id.
    ///
    /// # Errors
    ///
    /// `BadRequest` for a missing login, missing password or duplicate
    /// login, `Storage` when the file cannot be written.
    pub fn upsert(&self, mut account: Account) -> Result<Account, AuthError> {
        if account.user.login.trim().is_empty() {
            return Err(AuthError::BadRequest("login cannot be empty".to_string()));
        }

        if let Some(password) = account.password.take().filter(|p| !p.is_empty()) {
            account.password_hash = hash_password(&password)?;
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut accounts = self.list()?;

        if accounts
            .iter()
            .any(|a| a.user.login == account.user.login && a.user.id != account.user.id)
        {
            return Err(AuthError::BadRequest(format!(
                "login already taken: {}",
                account.user.login
            )));
        }

        if account.user.id <= 0 {
            account.user.id = accounts.iter().map(|a| a.user.id).max().unwrap_or(0) + 1;
        }

        let existing = accounts.iter().position(|a| a.user.id == account.user.id);
        if account.password_hash.is_empty() {
            match existing {
                Some(index) => account.password_hash = accounts[index].password_hash.clone(),
                None => {
                    return Err(AuthError::BadRequest(
                        "password cannot be empty for a new account".to_string(),
                    ));
                }
            }
        }

        match existing {
            Some(index) => accounts[index] = account.clone(),
            None => accounts.push(account.clone()),
        }
        accounts.sort_by_key(|a| a.user.id);
        self.save(&accounts)?;

        Ok(account)
    }

    /// Delete an account by id.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn delete(&self, id: i64) -> Result<bool, AuthError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut accounts = self.list()?;
        let before = accounts.len();
        accounts.retain(|a| a.user.id != id);
        let removed = accounts.len() != before;
        if removed {
            self.save(&accounts)?;
        }
        Ok(removed)
    }

    fn save(&self, accounts: &[Account]) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AuthError::Storage(format!("Failed to create dir: {e}")))?;
            }
        }

        let content = serde_json::to_string_pretty(accounts)
            .map_err(|e| AuthError::Storage(format!("Serialization error: {e}")))?;
        // Readers do not take the lock; they see the old file or the new one.
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, content)
            .map_err(|e| AuthError::Storage(format!("Failed to write accounts: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| AuthError::Storage(format!("Failed to set permissions: {e}")))?;
        }

        std::fs::rename(&staging, &self.path)
            .map_err(|e| AuthError::Storage(format!("Failed to replace accounts: {e}")))
    }
}

impl CredentialVerifier for UserStore {
    fn verify(&self, login: &str, password: &str) -> Result<User, AuthError> {
        let account = self
            .get_by_login(login)?
            .ok_or(AuthError::InvalidCredentials)?;
        account.verify_password(password)?;
        Ok(account.user)
    }
}

/// Hash a password using Argon2id.
///
/// # Errors
///
/// Returns error if hashing fails.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Config(format!("Password hashing failed: {e}")))
}

/// Verify a password against a hash.
fn verify_password(password: &str, hash: &str) -> Result<(), AuthError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|_| AuthError::InvalidCredentials)?;

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|_| AuthError::InvalidCredentials)
}
