//! Token codec: session claims to opaque, authenticated, encrypted strings.
//!
//! A token is the URL-safe base64 (no padding) encoding of an
//! [`envelope`]. Decryption runs in a fixed order so every failure has one
//! classification:
//!
//! 1. decode and parse the envelope, else [`TokenError::Malformed`]
//! 2. resolve the embedded key ID, else [`TokenError::UnknownKey`]
//! 3. authenticate and decrypt, else [`TokenError::Tampered`]
//! 4. parse the claims, else [`TokenError::Malformed`]
//! 5. check `expires_at` (with leeway), else [`TokenError::Expired`]

pub mod crypto;
pub mod envelope;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::Result;
use crate::keyring::{KeyMaterial, KeyRing};

/// Reasons a token is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Not a token this gateway could have produced
    #[error("malformed token")]
    Malformed,
    /// Authentication tag did not verify
    #[error("token failed authentication")]
    Tampered,
    /// Valid token past its expiry
    #[error("token expired")]
    Expired,
    /// Key ID not in the ring (never existed or already pruned)
    #[error("token key unknown")]
    UnknownKey,
}

/// How the session was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// External bearer token
    Token,
    /// Credentials from a kubeconfig
    Kubeconfig,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token => f.write_str("token"),
            Self::Kubeconfig => f.write_str("kubeconfig"),
        }
    }
}

/// Identity and lifetime facts sealed inside a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Unique session ID
    #[serde(rename = "jti")]
    pub id: String,
    /// Authenticated user name
    #[serde(rename = "sub")]
    pub subject: String,
    /// Issuance time
    #[serde(rename = "iat", with = "chrono::serde::ts_seconds")]
    pub issued_at: DateTime<Utc>,
    /// Expiry time
    #[serde(rename = "exp", with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
    /// Login strategy
    #[serde(rename = "amr")]
    pub method: AuthMethod,
    /// Group memberships reported upstream
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Additional identity attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl SessionClaims {
    /// Claims for a session starting at `now`, truncated to whole seconds.
    pub fn new(
        subject: impl Into<String>,
        method: AuthMethod,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let issued_at = now.trunc_subsecs(0);
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject: subject.into(),
            issued_at,
            expires_at: issued_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            method,
            groups: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Expired at `now`, allowing `leeway` of clock skew
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        let leeway = TimeDelta::from_std(leeway).unwrap_or(TimeDelta::MAX);
        // Overflow means the deadline is unreachable
        self.expires_at
            .checked_add_signed(leeway)
            .is_some_and(|deadline| now >= deadline)
    }
}

/// Encrypted token handed to clients. Opaque by contract.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OpaqueToken(String);

impl OpaqueToken {
    /// Wrap a presented token string
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The encoded token
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex SHA-256 of the token, safe to store and log
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()).as_slice())
    }
}

impl fmt::Debug for OpaqueToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OpaqueToken").field(&"[REDACTED]").finish()
    }
}

impl fmt::Display for OpaqueToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OpaqueToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Seal claims under `key`.
pub fn encrypt(claims: &SessionClaims, key: &KeyMaterial) -> Result<OpaqueToken> {
    let plaintext = serde_json::to_vec(claims)?;
    let sealed = crypto::seal(key, &plaintext)?;
    Ok(OpaqueToken(URL_SAFE_NO_PAD.encode(sealed)))
}

/// Decrypt and verify a token against the ring.
///
/// Store failures while resolving the key surface as [`crate::Error`];
/// everything about the token itself is a [`TokenError`].
pub async fn decrypt(token: &OpaqueToken, ring: &KeyRing, leeway: Duration) -> Result<SessionClaims> {
    let envelope = decode(token)?;
    let key = ring
        .resolve(&envelope.key_id)
        .await?
        .ok_or(TokenError::UnknownKey)?;
    Ok(open_with_key(&envelope, &key, Utc::now(), leeway)?)
}

/// Decode the transport encoding and parse the envelope.
pub fn decode(token: &OpaqueToken) -> std::result::Result<envelope::Envelope, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.0.as_bytes())
        .map_err(|_| TokenError::Malformed)?;
    envelope::parse(&bytes)
}

/// Authenticate, decrypt and expiry-check an envelope with a resolved key.
pub fn open_with_key(
    envelope: &envelope::Envelope,
    key: &KeyMaterial,
    now: DateTime<Utc>,
    leeway: Duration,
) -> std::result::Result<SessionClaims, TokenError> {
    let plaintext = crypto::open(key, envelope)?;
    let claims: SessionClaims =
        serde_json::from_slice(&plaintext).map_err(|_| TokenError::Malformed)?;
    if claims.is_expired(now, leeway) {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}
