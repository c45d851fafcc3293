//! Cluster API client used to verify presented credentials.
//!
//! Credentials are checked by asking the API server who they belong to
//! (`SelfSubjectReview`). The gateway never makes authorization decisions;
//! it only records the identity the cluster reports.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::AuthError;
use crate::Result;

const REVIEW_PATH: &str = "/apis/authentication.k8s.io/v1/selfsubjectreviews";

/// Errors from the credential review
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The API server refused the credential
    #[error("credential rejected with status {0}")]
    Rejected(u16),

    /// The credential could not even be presented
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The API server could not be reached or failed
    #[error("cluster API unreachable: {0}")]
    Unreachable(String),

    /// The API server answered with something unexpected
    #[error("invalid response from cluster API: {0}")]
    InvalidResponse(String),
}

impl From<UpstreamError> for AuthError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Unreachable(_) => Self::Unavailable(e.to_string()),
            _ => Self::Unauthorized(e.to_string()),
        }
    }
}

/// PEM client certificate and key
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    /// Certificate chain, PEM
    pub cert_pem: Vec<u8>,
    /// Private key, PEM
    pub key_pem: Vec<u8>,
}

/// Credentials presented on behalf of a caller
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ClusterCredentials {
    /// Bearer token
    pub bearer: Option<String>,
    /// Username and password
    pub basic: Option<(String, String)>,
    /// TLS client certificate
    pub client_cert: Option<ClientCertificate>,
    /// `Impersonate-User` header
    pub impersonate_user: Option<String>,
    /// `Impersonate-Group` headers
    pub impersonate_groups: Vec<String>,
}

impl ClusterCredentials {
    /// Bearer-token credentials
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer: Some(token.into()),
            ..Self::default()
        }
    }

    /// Short description without secret material
    #[must_use]
    pub fn kind(&self) -> &'static str {
        if self.bearer.is_some() {
            "bearer"
        } else if self.client_cert.is_some() {
            "client-certificate"
        } else if self.basic.is_some() {
            "basic"
        } else {
            "none"
        }
    }
}

impl fmt::Debug for ClusterCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCredentials")
            .field("kind", &self.kind())
            .field("impersonate_user", &self.impersonate_user)
            .field("impersonate_groups", &self.impersonate_groups)
            .finish_non_exhaustive()
    }
}

/// Identity reported by the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UpstreamIdentity {
    /// User name
    #[serde(default)]
    pub username: String,
    /// Stable user ID
    #[serde(default)]
    pub uid: Option<String>,
    /// Group memberships
    #[serde(default)]
    pub groups: Vec<String>,
    /// Authenticator-specific attributes
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Verifies credentials against the cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Ask the cluster who `credentials` belong to.
    async fn review(
        &self,
        credentials: &ClusterCredentials,
    ) -> std::result::Result<UpstreamIdentity, UpstreamError>;
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    #[serde(default)]
    status: ReviewStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewStatus {
    #[serde(default)]
    user_info: UpstreamIdentity,
}

/// [`ClusterApi`] over HTTPS.
pub struct HttpClusterApi {
    config: UpstreamConfig,
    client: reqwest::Client,
}

impl HttpClusterApi {
    /// Create a client for the configured API server
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let mut config = config.clone();
        config.endpoint = config.endpoint.or_in_cluster();
        let client = config.endpoint.http_client(Some(config.timeout))?;
        Ok(Self { config, client })
    }

    fn review_url(&self) -> String {
        format!(
            "{}{REVIEW_PATH}",
            self.config.endpoint.api_server.trim_end_matches('/')
        )
    }

    /// Client presenting the caller's certificate
    fn client_for(&self, cert: &ClientCertificate) -> std::result::Result<reqwest::Client, UpstreamError> {
        let mut pem = cert.cert_pem.clone();
        pem.push(b'\n');
        pem.extend_from_slice(&cert.key_pem);
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| UpstreamError::InvalidCredentials(format!("client certificate: {e}")))?;

        let builder = self
            .config
            .endpoint
            .client_builder(Some(self.config.timeout))
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;
        builder
            .identity(identity)
            .build()
            .map_err(|e| UpstreamError::InvalidCredentials(format!("client certificate: {e}")))
    }
}

#[async_trait]
impl ClusterApi for HttpClusterApi {
    async fn review(
        &self,
        credentials: &ClusterCredentials,
    ) -> std::result::Result<UpstreamIdentity, UpstreamError> {
        let client = match &credentials.client_cert {
            Some(cert) => self.client_for(cert)?,
            None => self.client.clone(),
        };

        let mut request = client.post(self.review_url()).json(&json!({
            "apiVersion": "authentication.k8s.io/v1",
            "kind": "SelfSubjectReview",
        }));

        if let Some(token) = &credentials.bearer {
            request = request.bearer_auth(token);
        } else if let Some((user, password)) = &credentials.basic {
            request = request.basic_auth(user, Some(password));
        } else if credentials.client_cert.is_none() {
            return Err(UpstreamError::InvalidCredentials(
                "no credential to present".to_string(),
            ));
        }

        if let Some(user) = &credentials.impersonate_user {
            request = request.header("Impersonate-User", user);
        }
        for group in &credentials.impersonate_groups {
            request = request.header("Impersonate-Group", group);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                UpstreamError::Unreachable(e.to_string())
            } else {
                UpstreamError::InvalidResponse(e.to_string())
            }
        })?;

        let status = response.status();
        debug!(status = %status, kind = credentials.kind(), "SelfSubjectReview answered");
        match status {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(UpstreamError::Rejected(status.as_u16()));
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                return Err(UpstreamError::Unreachable(format!("status {s}")));
            }
            s => return Err(UpstreamError::InvalidResponse(format!("status {s}"))),
        }

        let review: ReviewResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;

        if review.status.user_info.username.is_empty() {
            return Err(UpstreamError::InvalidResponse(
                "review returned no username".to_string(),
            ));
        }
        Ok(review.status.user_info)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode as HttpStatus;

    use super::*;

    #[test]
    fn review_response_parses_user_info() {
        let body = r#"{
            "apiVersion": "authentication.k8s.io/v1",
            "kind": "SelfSubjectReview",
            "status": {"userInfo": {
                "username": "alice",
                "uid": "42",
                "groups": ["dev", "system:authenticated"],
                "extra": {"scopes": ["a", "b"]}
            }}
        }"#;
        let review: ReviewResponse = serde_json::from_str(body).unwrap();
        let user = review.status.user_info;

        assert_eq!(user.username, "alice");
        assert_eq!(user.uid.as_deref(), Some("42"));
        assert_eq!(user.groups.len(), 2);
        assert_eq!(user.extra["scopes"], vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn unreachable_is_unavailable_and_rejection_is_unauthorized() {
        let err: AuthError = UpstreamError::Unreachable("timeout".into()).into();
        assert_eq!(err.status(), HttpStatus::SERVICE_UNAVAILABLE);

        let err: AuthError = UpstreamError::Rejected(401).into();
        assert_eq!(err.status(), HttpStatus::UNAUTHORIZED);

        let err: AuthError = UpstreamError::InvalidResponse("no username".into()).into();
        assert_eq!(err.status(), HttpStatus::UNAUTHORIZED);
    }

    #[test]
    fn debug_hides_secrets() {
        let creds = ClusterCredentials {
            basic: Some(("bob".into(), "hunter2".into())),
            ..ClusterCredentials::default()
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("basic"));
        assert!(!rendered.contains("hunter2"));
        assert!(!format!("{:?}", ClusterCredentials::bearer("sekrit")).contains("sekrit"));
    }

    #[test]
    fn review_url_joins_cleanly() {
        let mut config = UpstreamConfig::default();
        config.endpoint.api_server = "https://cluster.example:6443/".to_string();
        let api = HttpClusterApi::new(&config).unwrap();
        assert_eq!(
            api.review_url(),
            "https://cluster.example:6443/apis/authentication.k8s.io/v1/selfsubjectreviews"
        );
    }
}
