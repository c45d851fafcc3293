//! In-memory secret store.
//!
//! Versions come from a single monotonic counter, so every successful
//! mutation yields a version no other write has seen. Watchers subscribe to
//! a broadcast channel and filter by namespace.
//!
//! ```
//! use cluster_auth_gateway::store::{InMemorySecretStore, Secret, SecretStore, StoreError};
//!
//! # tokio_test::block_on(async {
//! let store = InMemorySecretStore::new();
//! let first = store
//!     .create(Secret::new("ns", "ring").with_data("keys", "v1"))
//!     .await
//!     .unwrap();
//!
//! // A writer holding the current version wins...
//! let second = store.update(first.clone().with_data("keys", "v2")).await.unwrap();
//! assert_ne!(second.resource_version, first.resource_version);
//!
//! // ...and one holding a stale version is told to re-read.
//! let stale = store.update(first.with_data("keys", "v3")).await;
//! assert!(matches!(stale, Err(StoreError::Conflict { .. })));
//! # });
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    Secret, SecretPatch, SecretStore, StoreError, StoreResult, WatchEvent, WatchEventKind,
    WatchStream,
};

const WATCH_CAPACITY: usize = 256;

/// Secret store held in process memory.
pub struct InMemorySecretStore {
    secrets: RwLock<BTreeMap<(String, String), Secret>>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
}

impl InMemorySecretStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            secrets: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            events,
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, kind: WatchEventKind, secret: &Secret) {
        // No receivers is fine
        let _ = self.events.send(WatchEvent {
            kind,
            secret: secret.clone(),
        });
    }

    fn key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }
}

impl Default for InMemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SecretStore for InMemorySecretStore {
    async fn create(&self, mut secret: Secret) -> StoreResult<Secret> {
        let stored = {
            let mut secrets = self.secrets.write();
            let key = Self::key(&secret.namespace, &secret.name);
            if secrets.contains_key(&key) {
                return Err(StoreError::already_exists(&secret.namespace, &secret.name));
            }
            secret.resource_version = Some(self.next_version());
            secrets.insert(key, secret.clone());
            secret
        };
        debug!(namespace = %stored.namespace, name = %stored.name, "Created secret");
        self.publish(WatchEventKind::Added, &stored);
        Ok(stored)
    }

    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Secret> {
        self.secrets
            .read()
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::not_found(namespace, name))
    }

    async fn update(&self, mut secret: Secret) -> StoreResult<Secret> {
        let stored = {
            let mut secrets = self.secrets.write();
            let key = Self::key(&secret.namespace, &secret.name);
            let Some(current) = secrets.get(&key) else {
                return Err(StoreError::not_found(&secret.namespace, &secret.name));
            };
            if secret.resource_version.is_some() && secret.resource_version != current.resource_version
            {
                return Err(StoreError::conflict(&secret.namespace, &secret.name));
            }
            secret.resource_version = Some(self.next_version());
            secrets.insert(key, secret.clone());
            secret
        };
        self.publish(WatchEventKind::Modified, &stored);
        Ok(stored)
    }

    async fn list(&self, namespace: &str) -> StoreResult<Vec<Secret>> {
        Ok(self
            .secrets
            .read()
            .values()
            .filter(|s| s.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let removed = self.secrets.write().remove(&Self::key(namespace, name));
        match removed {
            Some(secret) => {
                self.publish(WatchEventKind::Deleted, &secret);
                Ok(())
            }
            None => Err(StoreError::not_found(namespace, name)),
        }
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &SecretPatch) -> StoreResult<Secret> {
        let stored = {
            let mut secrets = self.secrets.write();
            let Some(current) = secrets.get_mut(&Self::key(namespace, name)) else {
                return Err(StoreError::not_found(namespace, name));
            };
            patch.apply_to(&mut current.data);
            current.resource_version = Some(self.next_version());
            current.clone()
        };
        self.publish(WatchEventKind::Modified, &stored);
        Ok(stored)
    }

    async fn watch(&self, namespace: &str) -> StoreResult<WatchStream> {
        let mut rx = self.events.subscribe();
        let namespace = namespace.to_string();

        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) if event.secret.namespace == namespace => yield Ok(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Secret watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
