//! Cluster Authentication Gateway Library
//!
//! Exchanges cluster credentials for encrypted, self-contained session tokens.
//!
//! # Features
//!
//! - **Login strategies**: bearer token or inline kubeconfig credentials,
//!   verified upstream with a `SelfSubjectReview`
//! - **Opaque tokens**: AEAD-sealed claims (AES-256-GCM, or X25519 +
//!   AES-256-GCM), tagged with the id of the key that sealed them
//! - **Shared key ring**: keys live in a secret store with optimistic
//!   concurrency, so any replica can rotate and every replica converges
//! - **Logout**: a store-backed denylist of token fingerprints
//! - **Operations**: health/readiness probes, login rate limiting,
//!   structured audit events and graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod keyring;
pub mod session;
pub mod store;
pub mod token;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("Invalid log level {level:?}: {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("Tracing already initialized: {e}")))
}
