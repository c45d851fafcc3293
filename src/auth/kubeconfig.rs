//! Kubeconfig credential extraction.
//!
//! Only inline credentials are honored. Anything that would make the
//! gateway read a local file or run a program on the caller's behalf is
//! refused, and the kubeconfig's cluster server URL is never used.

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Deserialize;
use thiserror::Error;

use crate::upstream::{ClientCertificate, ClusterCredentials};

/// Reasons a kubeconfig cannot be used to log in
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KubeconfigError {
    /// Not valid kubeconfig YAML
    #[error("kubeconfig parse error: {0}")]
    Parse(String),
    /// `current-context` unset
    #[error("kubeconfig has no current-context")]
    NoCurrentContext,
    /// `current-context` names a missing context
    #[error("context {0:?} not found")]
    MissingContext(String),
    /// The context names a missing user
    #[error("user {0:?} not found")]
    MissingUser(String),
    /// Credential given as a file path
    #[error("file references are not accepted ({0})")]
    FileReference(&'static str),
    /// Credential plugin or legacy provider
    #[error("unsupported credential source ({0})")]
    Unsupported(&'static str),
    /// The user entry has nothing to present
    #[error("user has no usable credentials")]
    NoCredentials,
    /// Inline data could not be decoded
    #[error("invalid credential data: {0}")]
    InvalidData(String),
}

/// The subset of a kubeconfig the gateway reads
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// Selected context name
    #[serde(default)]
    pub current_context: Option<String>,
    /// Named contexts
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    /// Named users
    #[serde(default)]
    pub users: Vec<NamedUser>,
}

/// `contexts[]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Context body
    pub context: Context,
}

/// Context body
#[derive(Debug, Clone, Deserialize)]
pub struct Context {
    /// User entry name
    pub user: String,
}

/// `users[]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// Credentials
    #[serde(default)]
    pub user: AuthInfo,
}

/// Credentials of a kubeconfig user
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthInfo {
    /// Inline bearer token
    pub token: Option<String>,
    /// Bearer token file
    #[serde(rename = "tokenFile")]
    pub token_file: Option<String>,
    /// Basic auth user
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
    /// Base64 PEM client certificate
    pub client_certificate_data: Option<String>,
    /// Base64 PEM client key
    pub client_key_data: Option<String>,
    /// Client certificate file
    pub client_certificate: Option<String>,
    /// Client key file
    pub client_key: Option<String>,
    /// User to impersonate
    #[serde(rename = "as")]
    pub impersonate: Option<String>,
    /// Groups to impersonate
    #[serde(default)]
    pub as_groups: Vec<String>,
    /// Credential plugin
    pub exec: Option<serde_yaml::Value>,
    /// Legacy auth provider
    pub auth_provider: Option<serde_yaml::Value>,
}

impl std::fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInfo")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("username", &self.username)
            .field("impersonate", &self.impersonate)
            .field("as_groups", &self.as_groups)
            .finish_non_exhaustive()
    }
}

impl Kubeconfig {
    /// Parse kubeconfig YAML
    pub fn parse(yaml: &str) -> Result<Self, KubeconfigError> {
        serde_yaml::from_str(yaml).map_err(|e| KubeconfigError::Parse(e.to_string()))
    }

    /// Credentials of the current context's user.
    ///
    /// Precedence: bearer token, then client certificate, then basic auth.
    pub fn credentials(&self) -> Result<ClusterCredentials, KubeconfigError> {
        let user = self.current_user()?;

        if user.token_file.is_some() {
            return Err(KubeconfigError::FileReference("tokenFile"));
        }
        if user.client_certificate.is_some() || user.client_key.is_some() {
            return Err(KubeconfigError::FileReference("client-certificate"));
        }
        if user.exec.is_some() {
            return Err(KubeconfigError::Unsupported("exec"));
        }
        if user.auth_provider.is_some() {
            return Err(KubeconfigError::Unsupported("auth-provider"));
        }

        let mut credentials = ClusterCredentials {
            impersonate_user: user.impersonate.clone().filter(|s| !s.is_empty()),
            impersonate_groups: user.as_groups.clone(),
            ..ClusterCredentials::default()
        };

        if let Some(token) = user.token.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            credentials.bearer = Some(token.to_string());
        } else if let Some(cert) = client_certificate(user)? {
            credentials.client_cert = Some(cert);
        } else if let (Some(name), Some(password)) = (&user.username, &user.password) {
            credentials.basic = Some((name.clone(), password.clone()));
        } else {
            return Err(KubeconfigError::NoCredentials);
        }

        Ok(credentials)
    }

    fn current_user(&self) -> Result<&AuthInfo, KubeconfigError> {
        let context_name = self
            .current_context
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(KubeconfigError::NoCurrentContext)?;
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .ok_or_else(|| KubeconfigError::MissingContext(context_name.to_string()))?;
        self.users
            .iter()
            .find(|u| u.name == context.context.user)
            .map(|u| &u.user)
            .ok_or_else(|| KubeconfigError::MissingUser(context.context.user.clone()))
    }
}

fn client_certificate(user: &AuthInfo) -> Result<Option<ClientCertificate>, KubeconfigError> {
    match (&user.client_certificate_data, &user.client_key_data) {
        (Some(cert), Some(key)) => Ok(Some(ClientCertificate {
            cert_pem: decode(cert, "client-certificate-data")?,
            key_pem: decode(key, "client-key-data")?,
        })),
        (None, None) => Ok(None),
        _ => Err(KubeconfigError::InvalidData(
            "client certificate and key must both be present".to_string(),
        )),
    }
}

fn decode(value: &str, field: &str) -> Result<Vec<u8>, KubeconfigError> {
    let compact: String = value.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|e| KubeconfigError::InvalidData(format!("{field}: {e}")))
}
