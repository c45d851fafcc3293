//! Key ring: the set of token encryption keys shared by every gateway replica.
//!
//! The ring lives in one secret (`data["keys"]`, a JSON list ordered oldest
//! to newest). Exactly one key is active and issues tokens; retired keys
//! only decrypt, until their grace period ends and they are pruned.
//!
//! Reads go through a local cache guarded by a `parking_lot::RwLock`. The
//! cache is refreshed when older than `refresh_interval`, when a token names
//! a key it does not know, and when the watcher sees the secret change.
//!
//! Writes are read-modify-write cycles against the store's
//! `resource_version`. A cycle that loses a race re-reads and re-plans, so
//! a replica that finds a peer already rotated adopts the peer's key.

pub mod material;
pub mod sweeper;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use material::{KeyAlgorithm, KeyMaterial};
pub use sweeper::{spawn_sweeper, spawn_watcher};

use crate::Result;
use crate::config::{KeysConfig, StoreConfig};
use crate::store::retry::{RetryPolicy, with_retry};
use crate::store::{Secret, SecretStore, get_optional, with_timeout};
use material::{decode_ring, encode_ring};

/// Data entry holding the serialized ring
pub const KEYS_ENTRY: &str = "keys";

#[derive(Debug, Default)]
struct RingState {
    keys: Vec<KeyMaterial>,
    version: Option<String>,
    refreshed_at: Option<Instant>,
}

/// Outcome of planning one write cycle.
enum Plan<T> {
    /// Stored ring is already acceptable
    Keep(T),
    /// Persist this ring
    Replace(Vec<KeyMaterial>, T),
}

/// Shared, store-backed key ring.
pub struct KeyRing {
    store: Arc<dyn SecretStore>,
    namespace: String,
    config: KeysConfig,
    store_timeout: Duration,
    retry: RetryPolicy,
    state: RwLock<RingState>,
    write_lock: Mutex<()>,
}

impl KeyRing {
    /// Create a ring over `store`. Nothing is read until [`initialize`](Self::initialize).
    pub fn new(store: Arc<dyn SecretStore>, store_config: &StoreConfig, config: KeysConfig) -> Self {
        Self {
            store,
            namespace: store_config.namespace.clone(),
            config,
            store_timeout: store_config.timeout,
            retry: RetryPolicy::new(store_config),
            state: RwLock::new(RingState::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Key ring settings
    pub fn config(&self) -> &KeysConfig {
        &self.config
    }

    /// Namespace of the backing secret
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Load the ring and make sure an active key exists.
    ///
    /// Called once at startup; an error here should stop the process.
    pub async fn initialize(&self) -> Result<KeyMaterial> {
        self.refresh().await?;
        let key = self.ensure_active_key().await?;
        info!(
            key_id = %key.id,
            algorithm = %key.algorithm,
            keys = self.state.read().keys.len(),
            "Key ring initialized"
        );
        Ok(key)
    }

    /// Return the active key, rotating first if it is older than `rotation_age`.
    pub async fn ensure_active_key(&self) -> Result<KeyMaterial> {
        if self.is_stale() {
            self.refresh_or_keep_cache().await?;
        }
        let now = Utc::now();
        if let Some(key) = self.fresh_active(&self.state.read().keys, now) {
            return Ok(key);
        }

        self.mutate("ensure active key", |keys, now| {
            if let Some(key) = self.fresh_active(keys, now) {
                return Ok(Plan::Keep(key));
            }
            let (next, key) = self.rotated(keys, now)?;
            Ok(Plan::Replace(next, key))
        })
        .await
    }

    /// Retire the active key and install a new one.
    ///
    /// If another writer rotates between our read and our write, their key
    /// is adopted and no second rotation happens.
    pub async fn rotate(&self) -> Result<KeyMaterial> {
        self.refresh().await?;
        let observed = active_key(&self.state.read().keys).map(|k| k.id.clone());

        let key = self
            .mutate("rotate key ring", |keys, now| {
                let current = active_key(keys).map(|k| k.id.clone());
                if current != observed
                    && let Some(peer) = active_key(keys)
                {
                    debug!(key_id = %peer.id, "Adopting key installed by a concurrent rotation");
                    return Ok(Plan::Keep(peer.clone()));
                }
                let (next, key) = self.rotated(keys, now)?;
                Ok(Plan::Replace(next, key))
            })
            .await?;

        info!(key_id = %key.id, algorithm = %key.algorithm, "Key ring rotated");
        Ok(key)
    }

    /// Remove retired keys past their grace period. Returns how many were removed.
    pub async fn prune(&self) -> Result<usize> {
        let grace = self.config.grace_period;
        let removed = self
            .mutate("prune key ring", |keys, now| {
                let kept: Vec<KeyMaterial> = keys
                    .iter()
                    .filter(|k| !k.is_expired(now, grace))
                    .cloned()
                    .collect();
                let removed = keys.len() - kept.len();
                if removed == 0 {
                    Ok(Plan::Keep(0))
                } else {
                    Ok(Plan::Replace(kept, removed))
                }
            })
            .await?;

        if removed > 0 {
            info!(removed, "Pruned expired keys");
        }
        Ok(removed)
    }

    /// Find a key that may decrypt.
    ///
    /// A miss forces one re-read, so keys installed by peers are found
    /// without waiting for the refresh interval. Keys past their grace
    /// period are reported as absent even before they are pruned.
    pub async fn resolve(&self, id: &str) -> Result<Option<KeyMaterial>> {
        if self.is_stale() {
            self.refresh_or_keep_cache().await?;
        }
        if let Some(key) = self.lookup(id) {
            return Ok(Some(key));
        }

        debug!(key_id = %id, "Key not cached, re-reading key ring");
        self.refresh().await?;
        Ok(self.lookup(id))
    }

    /// Snapshot of the cached ring, oldest first
    pub fn keys(&self) -> Vec<KeyMaterial> {
        self.state.read().keys.clone()
    }

    /// Re-read the ring from the store.
    pub async fn refresh(&self) -> Result<()> {
        let (keys, version) = self.load().await?;
        self.install(keys, version);
        Ok(())
    }

    /// Mark the cache stale so the next read goes to the store.
    pub fn invalidate(&self) {
        self.state.write().refreshed_at = None;
    }

    async fn refresh_or_keep_cache(&self) -> Result<()> {
        match self.refresh().await {
            Ok(()) => Ok(()),
            Err(e) if !self.state.read().keys.is_empty() => {
                warn!(error = %e, "Key ring refresh failed, serving cached keys");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn is_stale(&self) -> bool {
        self.state
            .read()
            .refreshed_at
            .is_none_or(|at| at.elapsed() >= self.config.refresh_interval)
    }

    fn lookup(&self, id: &str) -> Option<KeyMaterial> {
        let now = Utc::now();
        self.state
            .read()
            .keys
            .iter()
            .find(|k| k.id == id && !k.is_expired(now, self.config.grace_period))
            .cloned()
    }

    fn fresh_active(&self, keys: &[KeyMaterial], now: DateTime<Utc>) -> Option<KeyMaterial> {
        active_key(keys)
            .filter(|k| k.age(now) < self.config.rotation_age)
            .cloned()
    }

    /// New ring with every active key retired, a fresh key appended and
    /// expired keys dropped.
    fn rotated(
        &self,
        keys: &[KeyMaterial],
        now: DateTime<Utc>,
    ) -> Result<(Vec<KeyMaterial>, KeyMaterial)> {
        let key = KeyMaterial::generate(self.config.algorithm)?;
        let mut next: Vec<KeyMaterial> = keys
            .iter()
            .filter(|k| !k.is_expired(now, self.config.grace_period))
            .cloned()
            .collect();
        for k in &mut next {
            k.retire(now);
        }
        next.push(key.clone());
        Ok((next, key))
    }

    async fn load(&self) -> Result<(Vec<KeyMaterial>, Option<String>)> {
        let secret = with_timeout(
            self.store_timeout,
            "get key ring",
            get_optional(self.store.as_ref(), &self.namespace, &self.config.secret_name),
        )
        .await?;

        let Some(secret) = secret else {
            return Ok((Vec::new(), None));
        };
        let keys = match secret.get(KEYS_ENTRY) {
            Some(bytes) => decode_ring(bytes)?,
            None => Vec::new(),
        };
        Ok((keys, secret.resource_version))
    }

    fn install(&self, keys: Vec<KeyMaterial>, version: Option<String>) {
        let mut state = self.state.write();
        state.keys = keys;
        state.version = version;
        state.refreshed_at = Some(Instant::now());
    }

    async fn mutate<T, F>(&self, operation: &str, plan: F) -> Result<T>
    where
        F: Fn(&[KeyMaterial], DateTime<Utc>) -> Result<Plan<T>>,
    {
        let _guard = self.write_lock.lock().await;
        let plan = &plan;
        with_retry(&self.retry, operation, move || self.write_cycle(plan)).await
    }

    async fn write_cycle<T, F>(&self, plan: &F) -> Result<T>
    where
        F: Fn(&[KeyMaterial], DateTime<Utc>) -> Result<Plan<T>>,
    {
        let (keys, version) = self.load().await?;

        match plan(&keys, Utc::now())? {
            Plan::Keep(value) => {
                self.install(keys, version);
                Ok(value)
            }
            Plan::Replace(next, value) => {
                let mut secret = Secret::new(&self.namespace, &self.config.secret_name)
                    .with_data(KEYS_ENTRY, encode_ring(&next)?);

                let stored = if let Some(version) = version {
                    secret.resource_version = Some(version);
                    with_timeout(self.store_timeout, "update key ring", self.store.update(secret))
                        .await?
                } else {
                    with_timeout(self.store_timeout, "create key ring", self.store.create(secret))
                        .await?
                };

                self.install(next, stored.resource_version);
                Ok(value)
            }
        }
    }
}

/// The newest unretired key
fn active_key(keys: &[KeyMaterial]) -> Option<&KeyMaterial> {
    keys.iter().rev().find(|k| k.is_active())
}
