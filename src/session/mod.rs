//! Session manager: issuing, validating and invalidating session tokens.
//!
//! Sessions are self-contained: the token carries the claims, and the only
//! server-side state is the key ring and a denylist of logged-out tokens.

pub mod audit;
pub mod revocation;

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tracing::debug;

use self::audit::AuditEvent;
use self::revocation::RevocationList;
use crate::auth::Identity;
use crate::config::{SessionConfig, StoreConfig};
use crate::error::AuthError;
use crate::keyring::KeyRing;
use crate::store::SecretStore;
use crate::token::{self, AuthMethod, OpaqueToken, SessionClaims};
use crate::{Error, Result};

/// Mints and checks session tokens.
pub struct SessionManager {
    ring: Arc<KeyRing>,
    config: SessionConfig,
    revocations: RevocationList,
}

impl SessionManager {
    /// Create a manager using `ring` for encryption and `store` for revocations.
    pub fn new(
        ring: Arc<KeyRing>,
        store: Arc<dyn SecretStore>,
        store_config: &StoreConfig,
        config: SessionConfig,
    ) -> Self {
        let revocations = RevocationList::new(
            store,
            store_config,
            config.revocation_secret.clone(),
            config.revocation_refresh,
        );
        Self {
            ring,
            config,
            revocations,
        }
    }

    /// The key ring tokens are sealed with
    pub fn key_ring(&self) -> &Arc<KeyRing> {
        &self.ring
    }

    /// Session settings
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a session for an authenticated identity.
    pub async fn issue(
        &self,
        identity: &Identity,
        method: AuthMethod,
    ) -> std::result::Result<(SessionClaims, OpaqueToken), AuthError> {
        let key = self.ring.ensure_active_key().await?;

        let mut claims = SessionClaims::new(&identity.subject, method, Utc::now(), self.config.ttl);
        claims.groups.clone_from(&identity.groups);
        claims.extra.clone_from(&identity.extra);

        let token = token::encrypt(&claims, &key)?;
        audit::emit(&AuditEvent::issued(&claims));
        debug!(session_id = %claims.id, key_id = %key.id, "Issued session token");
        Ok((claims, token))
    }

    /// Check a presented token. Every token problem is `Unauthorized`;
    /// store trouble is `Unavailable`.
    pub async fn validate(
        &self,
        token: &OpaqueToken,
    ) -> std::result::Result<SessionClaims, AuthError> {
        let claims = match token::decrypt(token, &self.ring, self.config.leeway).await {
            Ok(claims) => claims,
            Err(Error::Token(reason)) => {
                audit::emit(&AuditEvent::rejected(reason.to_string()));
                return Err(reason.into());
            }
            Err(e) => return Err(e.into()),
        };

        if self.revocations.is_revoked(&token.fingerprint()).await? {
            audit::emit(&AuditEvent::rejected("session revoked"));
            return Err(AuthError::Unauthorized("session revoked".to_string()));
        }

        Ok(claims)
    }

    /// End a session. Tokens that would not validate anyway are accepted
    /// silently, so logout is idempotent.
    pub async fn invalidate(
        &self,
        token: &OpaqueToken,
    ) -> std::result::Result<Option<SessionClaims>, AuthError> {
        let claims = match token::decrypt(token, &self.ring, self.config.leeway).await {
            Ok(claims) => claims,
            Err(Error::Token(reason)) => {
                debug!(%reason, "Logout with an invalid token, nothing to revoke");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let leeway = TimeDelta::from_std(self.config.leeway).unwrap_or(TimeDelta::zero());
        let until = claims.expires_at + leeway;
        self.revocations.revoke(&token.fingerprint(), until).await?;
        audit::emit(&AuditEvent::revoked(&claims));
        Ok(Some(claims))
    }

    /// Remove denylist entries for tokens that have expired.
    pub async fn prune_revocations(&self) -> Result<usize> {
        self.revocations.prune().await
    }
}
