//! Encryption key material and its persisted form.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Length of every generated secret, in bytes
pub const SECRET_LEN: usize = 32;

/// Token encryption scheme bound to a key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// Symmetric AES-256-GCM with the stored secret as the key
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    /// X25519 agreement with a per-token ephemeral key, then AES-256-GCM
    #[serde(rename = "x25519-aes-256-gcm")]
    X25519Aes256Gcm,
}

impl KeyAlgorithm {
    /// Byte identifying the algorithm inside a token envelope
    #[must_use]
    pub fn wire_id(self) -> u8 {
        match self {
            Self::Aes256Gcm => 1,
            Self::X25519Aes256Gcm => 2,
        }
    }

    /// Inverse of [`wire_id`](Self::wire_id)
    #[must_use]
    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Aes256Gcm),
            2 => Some(Self::X25519Aes256Gcm),
            _ => None,
        }
    }

    /// Config/display name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::X25519Aes256Gcm => "x25519-aes-256-gcm",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One key in the ring.
///
/// A key is *active* until `retired_at` is set. Retired keys keep
/// decrypting until `retired_at + grace_period`, after which they are
/// expired and eligible for pruning.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    /// Opaque key identifier carried in every token
    pub id: String,
    /// Scheme this key encrypts with
    pub algorithm: KeyAlgorithm,
    #[serde(with = "base64_bytes")]
    secret: Vec<u8>,
    /// Generation time
    pub created_at: DateTime<Utc>,
    /// When a newer key replaced this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("secret", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .field("retired_at", &self.retired_at)
            .finish()
    }
}

impl KeyMaterial {
    /// Generate a fresh active key.
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self> {
        let mut secret = vec![0u8; SECRET_LEN];
        aws_lc_rs::rand::fill(&mut secret)
            .map_err(|_| Error::Crypto("random generator failure".to_string()))?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            algorithm,
            secret,
            created_at: Utc::now(),
            retired_at: None,
        })
    }

    /// Raw secret bytes (AES key or X25519 private scalar)
    #[must_use]
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Not yet retired
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.retired_at.is_none()
    }

    /// Past its grace period
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, grace_period: Duration) -> bool {
        let grace = TimeDelta::from_std(grace_period).unwrap_or(TimeDelta::MAX);
        self.retired_at
            .is_some_and(|retired| retired.checked_add_signed(grace).is_some_and(|end| end <= now))
    }

    /// Time since generation, zero if the clock went backwards
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Mark retired at `now` (no-op if already retired)
    pub fn retire(&mut self, now: DateTime<Utc>) {
        if self.retired_at.is_none() {
            self.retired_at = Some(now);
        }
    }
}

/// Serialize the ring, oldest key first.
pub fn encode_ring(keys: &[KeyMaterial]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(keys)?)
}

/// Parse a persisted ring.
pub fn decode_ring(bytes: &[u8]) -> Result<Vec<KeyMaterial>> {
    Ok(serde_json::from_slice(bytes)?)
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_unique_and_active() {
        let a = KeyMaterial::generate(KeyAlgorithm::Aes256Gcm).unwrap();
        let b = KeyMaterial::generate(KeyAlgorithm::Aes256Gcm).unwrap();

        assert_ne!(a.id, b.id);
        assert_ne!(a.secret(), b.secret());
        assert_eq!(a.secret().len(), SECRET_LEN);
        assert!(a.is_active());
    }

    #[test]
    fn debug_redacts_secret() {
        let key = KeyMaterial::generate(KeyAlgorithm::X25519Aes256Gcm).unwrap();
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains(&format!("{:?}", key.secret())));
    }

    #[test]
    fn expiry_follows_grace_period() {
        // GIVEN: a key retired an hour ago
        let now = Utc::now();
        let mut key = KeyMaterial::generate(KeyAlgorithm::Aes256Gcm).unwrap();
        key.retire(now - TimeDelta::hours(1));

        // THEN: it is expired under a 30 minute grace but not a 2 hour one
        assert!(!key.is_active());
        assert!(key.is_expired(now, Duration::from_secs(1800)));
        assert!(!key.is_expired(now, Duration::from_secs(7200)));
    }

    #[test]
    fn active_key_never_expires() {
        let key = KeyMaterial::generate(KeyAlgorithm::Aes256Gcm).unwrap();
        assert!(!key.is_expired(Utc::now() + TimeDelta::days(3650), Duration::ZERO));
    }

    #[test]
    fn ring_round_trips_through_json() {
        let mut old = KeyMaterial::generate(KeyAlgorithm::Aes256Gcm).unwrap();
        old.retire(Utc::now());
        let new = KeyMaterial::generate(KeyAlgorithm::X25519Aes256Gcm).unwrap();

        let bytes = encode_ring(&[old.clone(), new.clone()]).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("x25519-aes-256-gcm"));

        assert_eq!(decode_ring(&bytes).unwrap(), vec![old, new]);
    }

    #[test]
    fn wire_ids_are_stable() {
        for alg in [KeyAlgorithm::Aes256Gcm, KeyAlgorithm::X25519Aes256Gcm] {
            assert_eq!(KeyAlgorithm::from_wire_id(alg.wire_id()), Some(alg));
        }
        assert_eq!(KeyAlgorithm::from_wire_id(0), None);
    }
}
