//! Audit logging for session lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the serialized event in
//! the `audit` field, so log aggregators can extract it as JSON.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `session.issued` | A login succeeded and a token was minted |
//! | `session.revoked` | A valid session was logged out |
//! | `session.rejected` | A presented token failed validation |
//! | `login.denied` | A login credential was refused |

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::token::{AuthMethod, SessionClaims};

/// Structured audit record for one session transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"session.issued"`).
    pub event: &'static str,
    /// User the session belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Session ID (`jti`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Login strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<AuthMethod>,
    /// Session expiry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Client IP address (when available)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
    /// Why a login or token was refused
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn for_claims(event: &'static str, claims: &SessionClaims) -> Self {
        Self {
            event,
            subject: Some(claims.subject.clone()),
            session_id: Some(claims.id.clone()),
            method: Some(claims.method),
            expires_at: Some(claims.expires_at),
            client_ip: None,
            reason: None,
        }
    }

    /// Construct a `session.issued` event.
    #[must_use]
    pub fn issued(claims: &SessionClaims) -> Self {
        Self::for_claims("session.issued", claims)
    }

    /// Construct a `session.revoked` event.
    #[must_use]
    pub fn revoked(claims: &SessionClaims) -> Self {
        Self::for_claims("session.revoked", claims)
    }

    /// Construct a `session.rejected` event.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            event: "session.rejected",
            subject: None,
            session_id: None,
            method: None,
            expires_at: None,
            client_ip: None,
            reason: Some(reason.into()),
        }
    }

    /// Construct a `login.denied` event.
    #[must_use]
    pub fn denied(method: Option<AuthMethod>, reason: impl Into<String>) -> Self {
        Self {
            event: "login.denied",
            subject: None,
            session_id: None,
            method,
            expires_at: None,
            client_ip: None,
            reason: Some(reason.into()),
        }
    }

    /// Attach the caller's address.
    #[must_use]
    pub fn with_client_ip(mut self, client_ip: Option<IpAddr>) -> Self {
        self.client_ip = client_ip;
        self
    }
}

/// Emit an audit event via `tracing::info!`.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, event = event.event, "session audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn claims() -> SessionClaims {
        SessionClaims::new("alice", AuthMethod::Kubeconfig, Utc::now(), Duration::from_secs(60))
    }

    #[test]
    fn issued_event_carries_session() {
        // GIVEN: claims for a new session
        let claims = claims();

        // WHEN: build issued event
        let event = AuditEvent::issued(&claims);

        // THEN: subject, session and method are populated
        assert_eq!(event.event, "session.issued");
        assert_eq!(event.subject.as_deref(), Some("alice"));
        assert_eq!(event.session_id.as_deref(), Some(claims.id.as_str()));
        assert_eq!(event.method, Some(AuthMethod::Kubeconfig));
    }

    #[test]
    fn denied_event_contains_reason() {
        let event = AuditEvent::denied(Some(AuthMethod::Token), "upstream rejected credential");

        assert_eq!(event.event, "login.denied");
        assert_eq!(event.reason.as_deref(), Some("upstream rejected credential"));
        assert!(event.subject.is_none());
    }

    #[test]
    fn events_serialize_to_json() {
        let claims = claims();
        let events = vec![
            AuditEvent::issued(&claims),
            AuditEvent::revoked(&claims),
            AuditEvent::rejected("token expired"),
            AuditEvent::denied(None, "bad request").with_client_ip(Some("10.0.0.1".parse().unwrap())),
        ];

        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.event);
        }
    }
}
