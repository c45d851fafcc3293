//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::keyring::KeyAlgorithm;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load after the config is parsed.
    /// Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP listener and cookie settings
    pub server: ServerConfig,
    /// Session lifetime and revocation
    pub session: SessionConfig,
    /// Encryption key ring
    pub keys: KeysConfig,
    /// Secret store backend
    pub store: StoreConfig,
    /// Cluster API used to verify credentials
    pub upstream: UpstreamConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Prefix for the public auth endpoint; the action path is `{base_path}/auth`
    pub base_path: String,
    /// Whole-request deadline
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Name of the session cookie
    pub cookie_name: String,
    /// Mark the session cookie `Secure`
    pub secure_cookie: bool,
    /// Login attempts per minute across all clients (0 = unlimited)
    pub login_rate_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9080,
            base_path: "/v1-public".to_string(),
            request_timeout: Duration::from_secs(30),
            cookie_name: "R_SESS".to_string(),
            secure_cookie: true,
            login_rate_limit: 60,
        }
    }
}

impl ServerConfig {
    /// Path the action dispatcher is mounted on
    #[must_use]
    pub fn auth_path(&self) -> String {
        format!("{}/auth", self.base_path.trim_end_matches('/'))
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session lifetime from issuance
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Clock skew tolerated when checking expiry
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
    /// Secret holding revoked session fingerprints
    pub revocation_secret: String,
    /// How long a cached revocation list is trusted
    #[serde(with = "humantime_serde")]
    pub revocation_refresh: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(12 * 3600),
            leeway: Duration::ZERO,
            revocation_secret: "session-revocations".to_string(),
            revocation_refresh: Duration::from_secs(10),
        }
    }
}

/// Key ring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Secret holding the key ring
    pub secret_name: String,
    /// Algorithm for newly generated keys
    pub algorithm: KeyAlgorithm,
    /// Active key age that triggers rotation
    #[serde(with = "humantime_serde")]
    pub rotation_age: Duration,
    /// How long a retired key keeps decrypting
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// How long the cached ring is trusted before re-reading
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Period of the background rotate-and-prune sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            secret_name: "session-keyring".to_string(),
            algorithm: KeyAlgorithm::default(),
            rotation_age: Duration::from_secs(7 * 24 * 3600),
            grace_period: Duration::from_secs(24 * 3600),
            refresh_interval: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Secret store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory; state is lost on restart
    #[default]
    Memory,
    /// Kubernetes core/v1 Secrets
    Kubernetes,
}

/// Secret store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selection
    pub backend: StoreBackend,
    /// Namespace for all gateway secrets
    pub namespace: String,
    /// Deadline for a single store call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Attempts for a conflicting read-modify-write, including the first
    pub max_write_attempts: u32,
    /// Backoff before the second attempt
    #[serde(with = "humantime_serde")]
    pub retry_min_delay: Duration,
    /// Backoff ceiling
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
    /// API server hosting the secrets (kubernetes backend)
    pub kubernetes: ClusterEndpoint,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            namespace: "auth-gateway".to_string(),
            timeout: Duration::from_secs(5),
            max_write_attempts: 5,
            retry_min_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(1),
            kubernetes: ClusterEndpoint::default(),
        }
    }
}

/// Upstream cluster API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// API server that reviews presented credentials
    pub endpoint: ClusterEndpoint,
    /// Deadline for one review call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: ClusterEndpoint::default(),
            timeout: Duration::from_secs(10),
        }
    }
}

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Connection details for a Kubernetes API server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterEndpoint {
    /// Base URL
    pub api_server: String,
    /// Bearer token; supports `env:VAR_NAME`
    pub token: Option<String>,
    /// File holding the bearer token, re-read on every call
    pub token_file: Option<String>,
    /// PEM bundle trusted for the API server certificate
    pub ca_file: Option<String>,
    /// Skip server certificate verification
    pub insecure_skip_tls_verify: bool,
}

impl Default for ClusterEndpoint {
    fn default() -> Self {
        Self {
            api_server: "https://kubernetes.default.svc".to_string(),
            token: None,
            token_file: None,
            ca_file: None,
            insecure_skip_tls_verify: false,
        }
    }
}

impl ClusterEndpoint {
    fn validate(&self, section: &str) -> Result<()> {
        let url = url::Url::parse(&self.api_server)
            .map_err(|e| Error::Config(format!("{section}.api_server: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "{section}.api_server must be http(s): {}",
                self.api_server
            )));
        }
        if let Some(var_name) = self.token.as_deref().and_then(|t| t.strip_prefix("env:"))
            && env::var_os(var_name).is_none()
        {
            return Err(Error::Config(format!(
                "{section}.token names unset variable {var_name}"
            )));
        }
        Ok(())
    }

    /// Fill in service account credentials when running in a pod and none
    /// are configured.
    #[must_use]
    pub fn or_in_cluster(mut self) -> Self {
        if self.token.is_none()
            && self.token_file.is_none()
            && Path::new(SERVICE_ACCOUNT_TOKEN).exists()
        {
            self.token_file = Some(SERVICE_ACCOUNT_TOKEN.to_string());
            if self.ca_file.is_none() && Path::new(SERVICE_ACCOUNT_CA).exists() {
                self.ca_file = Some(SERVICE_ACCOUNT_CA.to_string());
            }
        }
        self
    }

    /// Build a client trusting this endpoint's CA.
    ///
    /// `timeout` bounds whole requests; `None` leaves only the connect
    /// deadline so callers can set per-request limits.
    pub fn http_client(&self, timeout: Option<Duration>) -> Result<reqwest::Client> {
        self.client_builder(timeout)?
            .build()
            .map_err(|e| Error::Config(format!("HTTP client for {}: {e}", self.api_server)))
    }

    /// Client builder with TLS trust applied, for callers adding an identity.
    pub fn client_builder(&self, timeout: Option<Duration>) -> Result<reqwest::ClientBuilder> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(ca_file) = &self.ca_file {
            let pem = std::fs::read(ca_file)
                .map_err(|e| Error::Config(format!("Cannot read CA file {ca_file}: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Config(format!("Invalid CA file {ca_file}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        if self.insecure_skip_tls_verify {
            tracing::warn!(api_server = %self.api_server, "TLS verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(builder)
    }

    /// Resolve the bearer token (token file wins, then `env:` expansion)
    pub async fn resolve_token(&self) -> Result<Option<String>> {
        if let Some(path) = &self.token_file {
            let token = tokio::fs::read_to_string(path).await?;
            return Ok(Some(token.trim().to_string()));
        }

        match self.token.as_deref() {
            Some(token) => match token.strip_prefix("env:") {
                Some(var_name) => env::var(var_name).map(Some).map_err(|_| {
                    Error::Config(format!(
                        "token for {} names unset variable {var_name}",
                        self.api_server
                    ))
                }),
                None => Ok(Some(token.to_string())),
            },
            None => Ok(None),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("AUTH_GATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.validate()?;

        Ok(config)
    }

    /// Reject settings that would break session or key guarantees.
    pub fn validate(&self) -> Result<()> {
        if self.session.ttl.is_zero() {
            return Err(Error::Config("session.ttl must be positive".to_string()));
        }
        for (name, interval) in [
            ("keys.rotation_age", self.keys.rotation_age),
            ("keys.refresh_interval", self.keys.refresh_interval),
            ("keys.sweep_interval", self.keys.sweep_interval),
        ] {
            if interval.is_zero() {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        // A replica with a stale cache may still issue under a key retired
        // up to one refresh ago.
        let min_grace = self.session.ttl.saturating_add(self.keys.refresh_interval);
        if self.keys.grace_period < min_grace {
            return Err(Error::Config(format!(
                "keys.grace_period ({}s) must be at least session.ttl + keys.refresh_interval ({}s)",
                self.keys.grace_period.as_secs(),
                min_grace.as_secs()
            )));
        }
        if self.store.max_write_attempts == 0 {
            return Err(Error::Config("store.max_write_attempts must be at least 1".to_string()));
        }
        if !self.server.base_path.starts_with('/') {
            return Err(Error::Config(format!(
                "server.base_path must start with '/': {}",
                self.server.base_path
            )));
        }
        self.upstream.endpoint.validate("upstream.endpoint")?;
        if self.store.backend == StoreBackend::Kubernetes {
            self.store.kubernetes.validate("store.kubernetes")?;
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if !path.exists() {
                tracing::debug!("Env file not found (skipped): {path_str}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {path_str}"),
                Err(e) => tracing::warn!("Failed to load env file {path_str}: {e}"),
            }
        }
    }
}

/// Human-readable duration serialization
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms", "12h", "7d")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" before 's' and 'm'
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            days.parse::<u64>().map(|d| Duration::from_secs(d * 86_400))
        } else {
            // Assume seconds
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.server.auth_path(), "/v1-public/auth");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.keys.algorithm, KeyAlgorithm::Aes256Gcm);
    }

    #[test]
    fn grace_shorter_than_ttl_is_rejected() {
        let mut config = Config::default();
        config.session.ttl = Duration::from_secs(3600);
        config.keys.grace_period = Duration::from_secs(60);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("grace_period"));
    }

    #[test]
    fn grace_must_cover_ttl_plus_refresh() {
        // GIVEN: a grace period equal to the session ttl
        let mut config = Config::default();
        config.session.ttl = Duration::from_secs(3600);
        config.keys.refresh_interval = Duration::from_secs(300);
        config.keys.grace_period = Duration::from_secs(3600);

        // THEN: a token issued by a stale replica could outlive its key
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("refresh_interval"));

        config.keys.grace_period = Duration::from_secs(3900);
        config.validate().unwrap();
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut config = Config::default();
        config.keys.sweep_interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keys.sweep_interval"));

        let mut config = Config::default();
        config.keys.refresh_interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keys.refresh_interval"));
    }

    #[test]
    fn api_server_must_be_a_url() {
        let mut config = Config::default();
        config.upstream.endpoint.api_server = "not a url".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("upstream.endpoint"));

        config.upstream.endpoint.api_server = "ftp://cluster.example".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut config = Config::default();
        config.store.max_write_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn durations_parse_all_suffixes() {
        use humantime_serde::parse;

        assert_eq!(parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse("12h").unwrap(), Duration::from_secs(43_200));
        assert_eq!(parse("7d").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse("15").unwrap(), Duration::from_secs(15));
        assert!(parse("soon").is_err());
    }

    #[test]
    fn yaml_file_is_loaded_and_validated() {
        // GIVEN: a config file overriding a few fields
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
server:
  port: 8443
  base_path: /public
session:
  ttl: 2h
keys:
  algorithm: x25519-aes-256-gcm
  grace_period: 3h
store:
  backend: kubernetes
  namespace: cattle-system
  retry_min_delay: 25ms
"#
        )
        .unwrap();
        drop(f);

        // WHEN: it is loaded
        let config = Config::load(Some(&path)).unwrap();

        // THEN: overrides apply and everything else keeps its default
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.server.auth_path(), "/public/auth");
        assert_eq!(config.session.ttl, Duration::from_secs(7200));
        assert_eq!(config.keys.algorithm, KeyAlgorithm::X25519Aes256Gcm);
        assert_eq!(config.store.backend, StoreBackend::Kubernetes);
        assert_eq!(config.store.retry_min_delay, Duration::from_millis(25));
        assert_eq!(config.store.max_write_attempts, 5);
        assert_eq!(config.server.cookie_name, "R_SESS");
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/gateway.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "AUTH_GW_TEST_TOKEN=from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(env::var("AUTH_GW_TEST_TOKEN").unwrap(), "from_env_file");
    }

    #[tokio::test]
    async fn token_file_wins_over_literal() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token");
        std::fs::write(&token_path, "sa-token\n").unwrap();

        let endpoint = ClusterEndpoint {
            token: Some("literal".to_string()),
            token_file: Some(token_path.to_string_lossy().to_string()),
            ..ClusterEndpoint::default()
        };
        assert_eq!(endpoint.resolve_token().await.unwrap().as_deref(), Some("sa-token"));

        let literal = ClusterEndpoint {
            token: Some("literal".to_string()),
            ..ClusterEndpoint::default()
        };
        assert_eq!(literal.resolve_token().await.unwrap().as_deref(), Some("literal"));
    }

    #[tokio::test]
    async fn unset_env_token_is_a_config_error() {
        let endpoint = ClusterEndpoint {
            token: Some("env:AUTH_GW_TEST_UNSET_TOKEN_VAR".to_string()),
            ..ClusterEndpoint::default()
        };

        let err = endpoint.resolve_token().await.unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("AUTH_GW_TEST_UNSET_TOKEN_VAR"));
    }

    #[test]
    fn unset_env_token_fails_validation() {
        let mut config = Config::default();
        config.upstream.endpoint.token = Some("env:AUTH_GW_TEST_UNSET_TOKEN_VAR".to_string());

        let err = config.validate().unwrap_err();

        assert!(err.to_string().contains("upstream.endpoint.token"));
    }
}
