//! Session extraction and the middleware guarding protected routes.
//!
//! A session token is accepted from either:
//! - `Authorization: Bearer <token>`
//! - the session cookie (`server.cookie_name`)
//!
//! The header wins when both are present.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::router::AppState;
use crate::error::AuthError;
use crate::token::OpaqueToken;

/// Pull the session token out of the request headers.
#[must_use]
pub fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<OpaqueToken> {
    bearer_token(headers)
        .or_else(|| cookie_value(headers, cookie_name))
        .map(OpaqueToken::new)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Require a valid session. The decrypted claims are inserted into the
/// request extensions for downstream handlers.
pub async fn session_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = extract_token(request.headers(), &state.cookie_name) else {
        debug!(path = %request.uri().path(), "No session token presented");
        return AuthError::Unauthorized("missing session token".to_string()).into_response();
    };

    match state.sessions.validate(&token).await {
        Ok(claims) => {
            debug!(subject = %claims.subject, session_id = %claims.id, "Session accepted");
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) => {
            debug!(error = %e, "Session refused");
            e.into_response()
        }
    }
}
