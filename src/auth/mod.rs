//! Login strategies.
//!
//! A login request carries exactly one credential source. [`LoginStrategy`]
//! is chosen from the request shape and then verified against the cluster:
//!
//! | Request field | Strategy | Presented upstream as |
//! |---------------|----------|-----------------------|
//! | `token` | [`LoginStrategy::Token`] | bearer token |
//! | `kubeConfig` | [`LoginStrategy::Kubeconfig`] | current user's inline credentials |

pub mod kubeconfig;

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use tracing::debug;

use crate::error::AuthError;
use crate::token::AuthMethod;
use crate::upstream::{ClusterApi, ClusterCredentials, UpstreamIdentity};
use kubeconfig::Kubeconfig;

/// Extra key recording the upstream user ID
pub const EXTRA_UID: &str = "uid";
/// Extra key recording an impersonated user
pub const EXTRA_IMPERSONATE_USER: &str = "impersonate-user";
/// Extra key recording impersonated groups (comma separated)
pub const EXTRA_IMPERSONATE_GROUPS: &str = "impersonate-groups";

/// Body of `POST ?action=login`
#[derive(Clone, Default, Deserialize)]
pub struct LoginRequest {
    /// External bearer token
    #[serde(default)]
    pub token: Option<String>,
    /// Kubeconfig YAML
    #[serde(default, rename = "kubeConfig")]
    pub kube_config: Option<String>,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("kube_config", &self.kube_config.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Authenticated caller, as confirmed by the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// User name
    pub subject: String,
    /// Group memberships
    pub groups: Vec<String>,
    /// UID, impersonation context and upstream extras
    pub extra: BTreeMap<String, String>,
}

impl Identity {
    fn from_review(review: UpstreamIdentity, credentials: &ClusterCredentials) -> Self {
        let mut extra: BTreeMap<String, String> = review
            .extra
            .into_iter()
            .map(|(key, values)| (key, values.join(",")))
            .collect();
        if let Some(uid) = review.uid.filter(|u| !u.is_empty()) {
            extra.insert(EXTRA_UID.to_string(), uid);
        }
        if let Some(user) = &credentials.impersonate_user {
            extra.insert(EXTRA_IMPERSONATE_USER.to_string(), user.clone());
        }
        if !credentials.impersonate_groups.is_empty() {
            extra.insert(
                EXTRA_IMPERSONATE_GROUPS.to_string(),
                credentials.impersonate_groups.join(","),
            );
        }

        Self {
            subject: review.username,
            groups: review.groups,
            extra,
        }
    }
}

/// One way of proving identity
#[derive(Clone)]
pub enum LoginStrategy {
    /// Bearer token passed through to the cluster
    Token(String),
    /// Kubeconfig YAML; its current user's credentials are passed through
    Kubeconfig(String),
}

impl fmt::Debug for LoginStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Token(_) => "LoginStrategy::Token",
            Self::Kubeconfig(_) => "LoginStrategy::Kubeconfig",
        })
    }
}

impl LoginStrategy {
    /// Choose the strategy for a request.
    ///
    /// Exactly one of `token` and `kubeConfig` must be non-empty.
    pub fn select(request: &LoginRequest) -> Result<Self, AuthError> {
        let token = non_empty(request.token.as_deref());
        let kube_config = non_empty(request.kube_config.as_deref());

        match (token, kube_config) {
            (Some(token), None) => Ok(Self::Token(token.to_string())),
            (None, Some(yaml)) => Ok(Self::Kubeconfig(yaml.to_string())),
            (Some(_), Some(_)) => Err(AuthError::BadRequest(
                "only one of token or kubeConfig may be set".to_string(),
            )),
            (None, None) => Err(AuthError::BadRequest(
                "one of token or kubeConfig is required".to_string(),
            )),
        }
    }

    /// Session method recorded for this strategy
    #[must_use]
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::Token(_) => AuthMethod::Token,
            Self::Kubeconfig(_) => AuthMethod::Kubeconfig,
        }
    }

    /// Verify the credential with the cluster.
    ///
    /// Every credential problem is `Unauthorized`; only an unreachable
    /// cluster is `Unavailable`.
    pub async fn authenticate(&self, api: &dyn ClusterApi) -> Result<Identity, AuthError> {
        let credentials = match self {
            Self::Token(token) => ClusterCredentials::bearer(token.clone()),
            Self::Kubeconfig(yaml) => Kubeconfig::parse(yaml)
                .and_then(|config| config.credentials())
                .map_err(|e| AuthError::Unauthorized(e.to_string()))?,
        };

        debug!(strategy = ?self, credential = credentials.kind(), "Reviewing credential");
        let review = api.review(&credentials).await?;
        Ok(Identity::from_review(review, &credentials))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
