//! Live-reloadable backend registries.
//!
//! Each registry mirrors a JSON definition file. The file is checked on
//! use: when its modification time moves forward, every entry is parsed
//! and built into a handler again and the new snapshot replaces the old
//! one in a single pointer swap. Readers never wait for a rebuild.

mod apps;
mod davs;

pub use apps::{AppEntry, AppHandlerFactory};
pub use davs::{DavEntry, DavHandlerFactory};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use axum::Router;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::auth::{AccessPolicy, Authorizer};
use crate::host::{host_matches, strip_port};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Definition file cannot be read.
    #[error("cannot read {path}: {source}")]
    Unreadable {
        /// Definition file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Definition file is not a JSON array.
    #[error("invalid definition file {path}: {source}")]
    Parse {
        /// Definition file.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// An entry cannot be turned into a handler.
    #[error("invalid {kind} entry {id}: {reason}")]
    InvalidEntry {
        /// Entry kind.
        kind: &'static str,
        /// Entry id.
        id: i64,
        /// What is wrong.
        reason: String,
    },

    /// No backend serves the host.
    #[error("unrecognized host {0:?}")]
    UnrecognizedHost(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An entry of a definition file.
pub trait BackendEntry: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Entry kind, for messages.
    const KIND: &'static str;

    /// Whether secured entries of this kind need the XSRF header.
    const REQUIRES_XSRF: bool;

    /// Identifier.
    fn id(&self) -> i64;

    /// Assign the identifier.
    fn set_id(&mut self, id: i64);

    /// Host name or `*.domain` pattern.
    fn host(&self) -> &str;

    /// Whether requests must be authorized.
    fn secured(&self) -> bool;

    /// Roles admitted when secured.
    fn roles(&self) -> &[String];
}

/// Builds the handler that serves an entry.
pub trait HandlerFactory<E>: Send + Sync {
    /// Build the handler for `entry`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::InvalidEntry` when the entry cannot be served.
    fn build(&self, entry: &E) -> Result<Router, RegistryError>;

    /// Wrap the handler once authorization is in place. Layers added here
    /// see every response, refusals and pre-flights included.
    fn decorate(&self, _entry: &E, handler: Router) -> Router {
        handler
    }
}

/// A routable backend.
#[derive(Clone)]
pub struct Backend<E> {
    /// Its definition.
    pub entry: E,
    /// Its handler, already wrapped by the authorizer when secured.
    pub handler: Router,
}

/// Immutable view of a registry.
pub struct Snapshot<E> {
    modified: SystemTime,
    backends: Vec<Backend<E>>,
}

impl<E: BackendEntry> Snapshot<E> {
    /// First backend whose pattern matches `host` (port ignored).
    #[must_use]
    pub fn find(&self, host: &str) -> Option<&Backend<E>> {
        let host = strip_port(host);
        self.backends
            .iter()
            .find(|b| host_matches(b.entry.host(), host))
    }

    /// Routable entries, in file order.
    pub fn entries(&self) -> impl Iterator<Item = &E> {
        self.backends.iter().map(|b| &b.entry)
    }

    /// Number of routable backends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether no backend is routable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Modification time of the file this snapshot was built from.
    #[must_use]
    pub const fn modified(&self) -> SystemTime {
        self.modified
    }
}

/// A registry of one kind of backend.
pub struct Registry<E: BackendEntry> {
    source: PathBuf,
    factory: Arc<dyn HandlerFactory<E>>,
    authorizer: Arc<dyn Authorizer>,
    current: RwLock<Option<Arc<Snapshot<E>>>>,
    reload: Mutex<()>,
}

impl<E: BackendEntry> Registry<E> {
    /// Registry mirroring `source`. Nothing is read until first use.
    pub fn new(
        source: impl Into<PathBuf>,
        factory: Arc<dyn HandlerFactory<E>>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            source: source.into(),
            factory,
            authorizer,
            current: RwLock::new(None),
            reload: Mutex::new(()),
        }
    }

    /// Definition file.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Current snapshot without checking the file.
    pub async fn snapshot(&self) -> Option<Arc<Snapshot<E>>> {
        self.current.read().await.clone()
    }

    /// Rebuild if the definition file changed since the last load.
    ///
    /// An unchanged file returns the very same snapshot. While another
    /// task holds the reload lock the current snapshot is returned as is;
    /// only a registry that was never loaded waits for it.
    ///
    /// # Errors
    ///
    /// `Unreadable` or `Parse`; the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<Snapshot<E>>, RegistryError> {
        let modified = self.modified().await?;
        let current = self.snapshot().await;
        if let Some(current) = current.as_ref().filter(|c| modified <= c.modified) {
            return Ok(current.clone());
        }

        match (self.reload.try_lock(), current) {
            (Ok(_guard), _) => self.load(false).await,
            (Err(_), Some(current)) => {
                tracing::debug!(kind = E::KIND, "reload in progress, serving current snapshot");
                Ok(current)
            }
            (Err(_), None) => {
                let _guard = self.reload.lock().await;
                self.load(false).await
            }
        }
    }

    /// Rebuild unconditionally.
    ///
    /// # Errors
    ///
    /// `Unreadable` or `Parse`; the previous snapshot stays in place.
    pub async fn reload(&self) -> Result<Arc<Snapshot<E>>, RegistryError> {
        let _guard = self.reload.lock().await;
        self.load(true).await
    }

    /// Handler for `host`, refreshing first. A failed refresh is logged
    /// and the last good snapshot answers.
    pub async fn find(&self, host: &str) -> Option<Router> {
        let snapshot = match self.refresh().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(kind = E::KIND, error = %e, "registry refresh failed");
                self.snapshot().await
            }
        };
        snapshot.and_then(|s| s.find(host).map(|b| b.handler.clone()))
    }

    /// Entries as written in the definition file. Malformed entries are
    /// left out; a missing file reads as empty.
    ///
    /// # Errors
    ///
    /// `Unreadable` or `Parse`.
    pub async fn read_entries(&self) -> Result<Vec<E>, RegistryError> {
        match tokio::fs::read_to_string(&self.source).await {
            Ok(content) => Ok(self.parse_entries(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(RegistryError::Unreadable {
                path: self.source.clone(),
                source,
            }),
        }
    }

    /// Insert or replace an entry by id, save the file and reload.
    /// An id of 0 or below picks the next free id.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, written or parsed.
    pub async fn upsert(&self, mut entry: E) -> Result<E, RegistryError> {
        let _guard = self.reload.lock().await;
        let mut entries = self.read_entries().await?;

        if entry.id() <= 0 {
            entry.set_id(entries.iter().map(BackendEntry::id).max().unwrap_or(0) + 1);
        }
        match entries.iter().position(|e| e.id() == entry.id()) {
            Some(index) => entries[index] = entry.clone(),
            None => entries.push(entry.clone()),
        }
        entries.sort_by_key(BackendEntry::id);

        self.write_entries(&entries).await?;
        self.load(true).await?;
        Ok(entry)
    }

    /// Remove an entry by id, save the file and reload.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, written or parsed.
    pub async fn delete(&self, id: i64) -> Result<bool, RegistryError> {
        let _guard = self.reload.lock().await;
        let mut entries = self.read_entries().await?;
        let before = entries.len();
        entries.retain(|e| e.id() != id);
        if entries.len() == before {
            return Ok(false);
        }

        self.write_entries(&entries).await?;
        self.load(true).await?;
        Ok(true)
    }

    async fn modified(&self) -> Result<SystemTime, RegistryError> {
        tokio::fs::metadata(&self.source)
            .await
            .and_then(|m| m.modified())
            .map_err(|source| RegistryError::Unreadable {
                path: self.source.clone(),
                source,
            })
    }

    /// Caller holds the reload lock.
    async fn load(&self, force: bool) -> Result<Arc<Snapshot<E>>, RegistryError> {
        let modified = self.modified().await?;

        if !force {
            if let Some(current) = self.current.read().await.as_ref() {
                if modified <= current.modified {
                    return Ok(current.clone());
                }
            }
        }

        let content = tokio::fs::read_to_string(&self.source)
            .await
            .map_err(|source| RegistryError::Unreadable {
                path: self.source.clone(),
                source,
            })?;
        let snapshot = Arc::new(self.build(&content, modified)?);

        *self.current.write().await = Some(snapshot.clone());
        tracing::info!(
            kind = E::KIND,
            path = %self.source.display(),
            backends = snapshot.len(),
            "registry loaded"
        );
        Ok(snapshot)
    }

    fn build(&self, content: &str, modified: SystemTime) -> Result<Snapshot<E>, RegistryError> {
        let mut backends = Vec::new();
        for entry in self.parse_entries(content)? {
            let handler = match self.factory.build(&entry) {
                Ok(handler) => handler,
                Err(e) => {
                    tracing::warn!(kind = E::KIND, id = entry.id(), error = %e, "skipping entry");
                    continue;
                }
            };
            let handler = if entry.secured() {
                let policy = AccessPolicy::new(entry.roles().iter().cloned(), E::REQUIRES_XSRF);
                self.authorizer.wrap(handler, policy)
            } else {
                handler
            };
            let handler = self.factory.decorate(&entry, handler);
            backends.push(Backend { entry, handler });
        }
        Ok(Snapshot { modified, backends })
    }

    fn parse_entries(&self, content: &str) -> Result<Vec<E>, RegistryError> {
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<serde_json::Value> =
            serde_json::from_str(content).map_err(|source| RegistryError::Parse {
                path: self.source.clone(),
                source,
            })?;

        Ok(values
            .into_iter()
            .enumerate()
            .filter_map(|(index, value)| match serde_json::from_value(value) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(kind = E::KIND, index, error = %e, "skipping malformed entry");
                    None
                }
            })
            .collect())
    }

    async fn write_entries(&self, entries: &[E]) -> Result<(), RegistryError> {
        let content = serde_json::to_string_pretty(entries)?;
        if let Some(parent) = self.source.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.source, content).await?;
        Ok(())
    }
}

impl<E: BackendEntry> std::fmt::Debug for Registry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &E::KIND)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
