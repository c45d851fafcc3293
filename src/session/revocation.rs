//! Denylist of logged-out sessions.
//!
//! One secret maps token fingerprints (hex SHA-256) to the Unix time after
//! which the entry is useless because the token itself has expired. Writes
//! are merge patches, so concurrent logouts on different replicas never
//! conflict; expired entries are removed in the same patches.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::Result;
use crate::config::StoreConfig;
use crate::store::retry::{RetryPolicy, with_retry};
use crate::store::{Secret, SecretPatch, SecretStore, StoreError, get_optional, with_timeout};

#[derive(Debug, Default)]
struct Cache {
    entries: HashMap<String, i64>,
    refreshed_at: Option<Instant>,
}

/// Store-backed set of revoked token fingerprints.
pub struct RevocationList {
    store: Arc<dyn SecretStore>,
    namespace: String,
    secret_name: String,
    refresh_after: Duration,
    store_timeout: Duration,
    retry: RetryPolicy,
    cache: RwLock<Cache>,
}

impl RevocationList {
    /// Create a list kept in `secret_name`.
    pub fn new(
        store: Arc<dyn SecretStore>,
        store_config: &StoreConfig,
        secret_name: impl Into<String>,
        refresh_after: Duration,
    ) -> Self {
        Self {
            store,
            namespace: store_config.namespace.clone(),
            secret_name: secret_name.into(),
            refresh_after,
            store_timeout: store_config.timeout,
            retry: RetryPolicy::new(store_config),
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Record a revocation that stays relevant until `until`.
    ///
    /// The local cache is updated before the write so this replica rejects
    /// the token immediately.
    pub async fn revoke(&self, fingerprint: &str, until: DateTime<Utc>) -> Result<()> {
        let until = until.timestamp();
        self.cache.write().entries.insert(fingerprint.to_string(), until);

        let now = Utc::now().timestamp();
        let mut patch = SecretPatch::new().set(fingerprint, until.to_string());
        for expired in self.expired_entries(now) {
            patch = patch.remove(expired);
        }

        let patch = &patch;
        let stored = with_retry(&self.retry, "revoke session", move || self.write(patch)).await?;
        self.install(&stored);
        Ok(())
    }

    /// Whether `fingerprint` is on the list and not yet expired.
    pub async fn is_revoked(&self, fingerprint: &str) -> Result<bool> {
        if self.is_stale() {
            match self.refresh().await {
                Ok(()) => {}
                Err(e) if self.cache.read().refreshed_at.is_some() => {
                    warn!(error = %e, "Revocation refresh failed, using cached list");
                }
                Err(e) => return Err(e),
            }
        }

        let now = Utc::now().timestamp();
        Ok(self
            .cache
            .read()
            .entries
            .get(fingerprint)
            .is_some_and(|until| *until > now))
    }

    /// Re-read the list from the store.
    pub async fn refresh(&self) -> Result<()> {
        let secret = with_timeout(
            self.store_timeout,
            "get revocations",
            get_optional(self.store.as_ref(), &self.namespace, &self.secret_name),
        )
        .await?;

        match secret {
            Some(secret) => self.install(&secret),
            None => {
                let mut cache = self.cache.write();
                cache.entries.clear();
                cache.refreshed_at = Some(Instant::now());
            }
        }
        Ok(())
    }

    /// Drop entries whose tokens have expired. Returns how many were removed.
    pub async fn prune(&self) -> Result<usize> {
        self.refresh().await?;
        let expired = self.expired_entries(Utc::now().timestamp());
        if expired.is_empty() {
            return Ok(0);
        }

        let removed = expired.len();
        let patch = expired
            .into_iter()
            .fold(SecretPatch::new(), SecretPatch::remove);
        let result = with_timeout(
            self.store_timeout,
            "prune revocations",
            self.store.patch(&self.namespace, &self.secret_name, &patch),
        )
        .await;

        match result {
            Ok(stored) => {
                self.install(&stored);
                Ok(removed)
            }
            Err(StoreError::NotFound { .. }) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Patch the secret, creating it on first use.
    async fn write(&self, patch: &SecretPatch) -> Result<Secret> {
        let patched = with_timeout(
            self.store_timeout,
            "patch revocations",
            self.store.patch(&self.namespace, &self.secret_name, patch),
        )
        .await;

        match patched {
            Ok(secret) => Ok(secret),
            Err(StoreError::NotFound { .. }) => {
                debug!(secret = %self.secret_name, "Creating revocation list");
                let mut secret = Secret::new(&self.namespace, &self.secret_name);
                patch.apply_to(&mut secret.data);
                Ok(with_timeout(
                    self.store_timeout,
                    "create revocations",
                    self.store.create(secret),
                )
                .await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn install(&self, secret: &Secret) {
        let entries = parse_entries(&secret.data);
        let mut cache = self.cache.write();
        cache.entries = entries;
        cache.refreshed_at = Some(Instant::now());
    }

    fn is_stale(&self) -> bool {
        self.cache
            .read()
            .refreshed_at
            .is_none_or(|at| at.elapsed() >= self.refresh_after)
    }

    fn expired_entries(&self, now: i64) -> Vec<String> {
        self.cache
            .read()
            .entries
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect()
    }
}

fn parse_entries(data: &BTreeMap<String, Vec<u8>>) -> HashMap<String, i64> {
    data.iter()
        .filter_map(|(fingerprint, value)| {
            let parsed = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.trim().parse::<i64>().ok());
            if parsed.is_none() {
                warn!(fingerprint = %fingerprint, "Ignoring unreadable revocation entry");
            }
            parsed.map(|until| (fingerprint.clone(), until))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::store::InMemorySecretStore;

    fn list(store: Arc<dyn SecretStore>) -> RevocationList {
        RevocationList::new(
            store,
            &StoreConfig::default(),
            "session-revocations",
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn revoke_creates_then_patches() {
        // GIVEN: no revocation secret yet
        let store: Arc<dyn SecretStore> = Arc::new(InMemorySecretStore::new());
        let revocations = list(store.clone());
        let until = Utc::now() + TimeDelta::hours(1);

        // WHEN: two sessions are revoked
        revocations.revoke("aaa", until).await.unwrap();
        revocations.revoke("bbb", until).await.unwrap();

        // THEN: both are listed and persisted
        assert!(revocations.is_revoked("aaa").await.unwrap());
        assert!(revocations.is_revoked("bbb").await.unwrap());
        assert!(!revocations.is_revoked("ccc").await.unwrap());
        let secret = store.get("auth-gateway", "session-revocations").await.unwrap();
        assert_eq!(secret.data.len(), 2);
    }

    #[tokio::test]
    async fn peers_see_revocations_after_refresh() {
        let store: Arc<dyn SecretStore> = Arc::new(InMemorySecretStore::new());
        let a = list(store.clone());
        let b = list(store.clone());
        assert!(!b.is_revoked("aaa").await.unwrap());

        a.revoke("aaa", Utc::now() + TimeDelta::hours(1)).await.unwrap();

        // b's cache is fresh; an explicit refresh picks up the peer write
        b.refresh().await.unwrap();
        assert!(b.is_revoked("aaa").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_pruned() {
        // GIVEN: one expired and one live entry
        let store: Arc<dyn SecretStore> = Arc::new(InMemorySecretStore::new());
        let revocations = list(store.clone());
        revocations.revoke("old", Utc::now() - TimeDelta::minutes(1)).await.unwrap();
        revocations.revoke("new", Utc::now() + TimeDelta::hours(1)).await.unwrap();

        // THEN: the expired entry is already gone (dropped by the second write)
        let secret = store.get("auth-gateway", "session-revocations").await.unwrap();
        assert!(secret.get("old").is_none());
        assert!(!revocations.is_revoked("old").await.unwrap());

        // WHEN: nothing else expired, pruning is a no-op
        assert_eq!(revocations.prune().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn prune_without_secret_is_noop() {
        let revocations = list(Arc::new(InMemorySecretStore::new()));
        assert_eq!(revocations.prune().await.unwrap(), 0);
    }

    #[test]
    fn unreadable_entries_are_skipped() {
        let data = BTreeMap::from([
            ("good".to_string(), b"1700000000".to_vec()),
            ("bad".to_string(), b"soon".to_vec()),
        ]);
        let entries = parse_entries(&data);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get("good"), Some(&1_700_000_000));
    }
}
