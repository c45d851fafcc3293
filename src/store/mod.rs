//! Secret store: namespaced key-value persistence with optimistic concurrency.
//!
//! The gateway keeps two objects here: the encryption key ring and the
//! session revocation list. Every mutation carries the `resource_version`
//! the writer last read; a stale version is rejected with
//! [`StoreError::Conflict`] and the writer re-reads and tries again.
//!
//! Two backends implement [`SecretStore`]:
//!
//! - [`InMemorySecretStore`]: single process, used by tests and `memory` mode.
//! - [`KubeSecretStore`]: core/v1 Secrets through the Kubernetes REST API.

pub mod kube;
pub mod memory;
pub mod retry;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};

pub use kube::KubeSecretStore;
pub use memory::InMemorySecretStore;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Stream of change notifications for a namespace
pub type WatchStream = BoxStream<'static, StoreResult<WatchEvent>>;

/// Errors returned by secret store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The secret does not exist
    #[error("secret {namespace}/{name} not found")]
    NotFound {
        /// Namespace
        namespace: String,
        /// Secret name
        name: String,
    },

    /// Create raced with another writer
    #[error("secret {namespace}/{name} already exists")]
    AlreadyExists {
        /// Namespace
        namespace: String,
        /// Secret name
        name: String,
    },

    /// Optimistic concurrency check failed
    #[error("secret {namespace}/{name} was modified concurrently")]
    Conflict {
        /// Namespace
        namespace: String,
        /// Secret name
        name: String,
    },

    /// The call exceeded its deadline
    #[error("store operation timed out: {0}")]
    Timeout(String),

    /// The backend could not be reached
    #[error("store connection error: {0}")]
    Connection(String),

    /// Stored bytes could not be decoded
    #[error("store serialization error: {0}")]
    Serialization(String),

    /// Backend-specific failure
    #[error("store internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Build a `NotFound` error
    pub fn not_found(namespace: &str, name: &str) -> Self {
        Self::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Build a `Conflict` error
    pub fn conflict(namespace: &str, name: &str) -> Self {
        Self::Conflict {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Build an `AlreadyExists` error
    pub fn already_exists(namespace: &str, name: &str) -> Self {
        Self::AlreadyExists {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Whether re-reading and trying again can succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::AlreadyExists { .. } | Self::Timeout(_) | Self::Connection(_)
        )
    }
}

/// A namespaced secret object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    /// Namespace
    pub namespace: String,
    /// Name, unique within the namespace
    pub name: String,
    /// Payload entries
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
    /// Version assigned by the store; `None` for objects not yet created.
    #[serde(default)]
    pub resource_version: Option<String>,
}

impl Secret {
    /// Create an empty, not-yet-persisted secret
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            data: BTreeMap::new(),
            resource_version: None,
        }
    }

    /// Builder-style data entry
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Look up a data entry
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }
}

/// Merge patch over a secret's data entries.
///
/// `Some(bytes)` sets an entry, `None` removes it. Entries not mentioned
/// are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretPatch {
    /// Entry changes
    pub entries: BTreeMap<String, Option<Vec<u8>>>,
}

impl SecretPatch {
    /// Empty patch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an entry
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(key.into(), Some(value.into()));
        self
    }

    /// Remove an entry
    #[must_use]
    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.entries.insert(key.into(), None);
        self
    }

    /// Whether the patch changes nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply to a data map
    pub fn apply_to(&self, data: &mut BTreeMap<String, Vec<u8>>) {
        for (key, value) in &self.entries {
            match value {
                Some(v) => {
                    data.insert(key.clone(), v.clone());
                }
                None => {
                    data.remove(key);
                }
            }
        }
    }
}

/// Kind of change reported by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventKind {
    /// Secret created
    Added,
    /// Secret updated or patched
    Modified,
    /// Secret deleted
    Deleted,
}

/// A change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened
    pub kind: WatchEventKind,
    /// Secret state after the change (last known state for deletions)
    pub secret: Secret,
}

/// Namespaced secret persistence.
///
/// Implementations must be `Send + Sync` because the store is shared
/// across request tasks and background sweepers.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync + 'static {
    /// Create a secret. Fails with `AlreadyExists` if the name is taken.
    async fn create(&self, secret: Secret) -> StoreResult<Secret>;

    /// Fetch a secret.
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Secret>;

    /// Replace a secret's data.
    ///
    /// When `resource_version` is set it must equal the stored version,
    /// otherwise the call fails with `Conflict`.
    async fn update(&self, secret: Secret) -> StoreResult<Secret>;

    /// List all secrets in a namespace.
    async fn list(&self, namespace: &str) -> StoreResult<Vec<Secret>>;

    /// Delete a secret.
    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()>;

    /// Merge-patch a secret's data entries.
    async fn patch(&self, namespace: &str, name: &str, patch: &SecretPatch) -> StoreResult<Secret>;

    /// Stream changes to secrets in a namespace.
    async fn watch(&self, namespace: &str) -> StoreResult<WatchStream>;
}

/// Run a store call under a deadline, mapping expiry to [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(timeout: Duration, operation: &str, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(format!(
            "{operation} exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}

/// `get` that maps `NotFound` to `None`.
pub async fn get_optional(
    store: &dyn SecretStore,
    namespace: &str,
    name: &str,
) -> StoreResult<Option<Secret>> {
    match store.get(namespace, name).await {
        Ok(secret) => Ok(Some(secret)),
        Err(StoreError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Open the configured backend.
pub fn connect(config: &StoreConfig) -> crate::Result<Arc<dyn SecretStore>> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory secret store; keys and revocations are not shared");
            Ok(Arc::new(InMemorySecretStore::new()))
        }
        StoreBackend::Kubernetes => {
            tracing::info!(
                api_server = %config.kubernetes.api_server,
                namespace = %config.namespace,
                "Using the Kubernetes secret store"
            );
            Ok(Arc::new(KubeSecretStore::new(&config.kubernetes, config.timeout)?))
        }
    }
}
