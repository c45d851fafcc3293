//! Error types for the authentication gateway
//!
//! Two layers:
//!
//! - [`Error`] is the internal error carried by the key ring, token codec,
//!   store plumbing and startup code.
//! - [`AuthError`] is the taxonomy rendered to HTTP clients by the action
//!   dispatcher. Its `Unauthorized` message is never sent verbatim.

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;
use crate::token::TokenError;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Secret store error that is not worth retrying
    #[error("Secret store error: {0}")]
    Store(#[from] StoreError),

    /// Secret store kept failing with retryable errors
    #[error("Secret store unavailable: {0}")]
    TransientStore(String),

    /// Token could not be decrypted or verified
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// Key generation or sealing failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is an infrastructure failure the caller may retry later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientStore(_) | Self::Http(_) => true,
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Error taxonomy of the login/logout contract.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Malformed or ambiguous request; the caller must fix the input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Credential or session rejected. The reason is for logs only.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Only `POST` is accepted on the auth path.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// Login attempts exceeded the configured rate.
    #[error("rate limited")]
    RateLimited,

    /// Secret store or upstream API trouble, distinct from a bad credential.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Anything else that is our fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// HTTP status for this error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::RateLimited => "rate_limited",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message safe to show to the client.
    ///
    /// Unauthorized and infrastructure failures collapse to fixed strings so
    /// the response never reveals which part of a credential was wrong.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::BadRequest(msg) => msg.clone(),
            Self::Unauthorized(_) => "unauthorized".to_string(),
            Self::MethodNotAllowed => "only POST is allowed".to_string(),
            Self::RateLimited => "too many login attempts, try again later".to_string(),
            Self::Unavailable(_) => "service temporarily unavailable".to_string(),
            Self::Internal(_) => "internal error".to_string(),
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(e: TokenError) -> Self {
        Self::Unauthorized(e.to_string())
    }
}

impl From<Error> for AuthError {
    fn from(e: Error) -> Self {
        match e {
            Error::Token(t) => Self::Unauthorized(t.to_string()),
            e if e.is_transient() => Self::Unavailable(e.to_string()),
            e => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.code(),
            "message": self.public_message(),
        }));

        match self {
            Self::Unauthorized(_) => (status, [("WWW-Authenticate", "Bearer")], body).into_response(),
            Self::MethodNotAllowed => (status, [("Allow", "POST")], body).into_response(),
            Self::RateLimited => (status, [("Retry-After", "60")], body).into_response(),
            _ => (status, body).into_response(),
        }
    }
}
