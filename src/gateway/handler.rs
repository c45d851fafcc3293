//! Login/logout action dispatcher for `{base_path}/auth`.
//!
//! One pass per request: the method is checked, the `action` query
//! parameter picks login or logout, and the outcome is rendered. Nothing is
//! retried here; store retries happen below the session manager.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json,
    body::{Body, to_bytes},
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::auth::extract_token;
use super::router::AppState;
use crate::auth::{LoginRequest, LoginStrategy};
use crate::error::AuthError;
use crate::session::audit::{self, AuditEvent};

/// Largest accepted login body. Kubeconfigs with inline certificates fit
/// comfortably.
const MAX_LOGIN_BODY: usize = 1024 * 1024;

/// Tracked client count above which idle limiter buckets are dropped.
const LIMITER_PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Deserialize)]
struct ActionQuery {
    action: Option<String>,
}

/// Requested action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Exchange a credential for a session
    Login,
    /// End the presented session
    Logout,
}

impl FromStr for Action {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login" => Ok(Self::Login),
            "logout" => Ok(Self::Logout),
            other => Err(AuthError::BadRequest(format!("unknown action: {other}"))),
        }
    }
}

/// Result of a successfully dispatched action
enum AuthOutcome {
    LoggedIn { token: String, max_age: u64 },
    LoggedOut,
}

/// `{base_path}/auth` handler.
pub async fn auth_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    match dispatch(&state, request, client_ip).await {
        Ok(outcome) => render(&state, outcome),
        Err(e) => {
            if matches!(e, AuthError::Unavailable(_) | AuthError::Internal(_)) {
                warn!(error = %e, "Auth request failed");
            }
            e.into_response()
        }
    }
}

async fn dispatch(
    state: &AppState,
    request: Request<Body>,
    client_ip: Option<IpAddr>,
) -> Result<AuthOutcome, AuthError> {
    if request.method() != Method::POST {
        debug!(method = %request.method(), "Rejecting non-POST auth request");
        return Err(AuthError::MethodNotAllowed);
    }

    let Query(query) = Query::<ActionQuery>::try_from_uri(request.uri())
        .map_err(|e| AuthError::BadRequest(format!("invalid query: {e}")))?;
    let action: Action = query
        .action
        .as_deref()
        .ok_or_else(|| AuthError::BadRequest("missing action".to_string()))?
        .parse()?;

    match action {
        Action::Login => login(state, request, client_ip).await,
        Action::Logout => logout(state, request.headers()).await,
    }
}

async fn login(
    state: &AppState,
    request: Request<Body>,
    client_ip: Option<IpAddr>,
) -> Result<AuthOutcome, AuthError> {
    if let Some(limiter) = &state.login_limiter {
        // Requests without peer info (in-process callers) share one bucket.
        let key = client_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        if limiter.len() > LIMITER_PRUNE_THRESHOLD {
            limiter.retain_recent();
        }
        if limiter.check_key(&key).is_err() {
            audit::emit(&AuditEvent::denied(None, "rate limited").with_client_ip(client_ip));
            return Err(AuthError::RateLimited);
        }
    }

    let body = to_bytes(request.into_body(), MAX_LOGIN_BODY)
        .await
        .map_err(|e| AuthError::BadRequest(format!("unreadable body: {e}")))?;
    let login: LoginRequest = serde_json::from_slice(&body)
        .map_err(|e| AuthError::BadRequest(format!("invalid login body: {e}")))?;

    let strategy = LoginStrategy::select(&login)?;
    let method = strategy.method();

    let identity = match strategy.authenticate(state.upstream.as_ref()).await {
        Ok(identity) => identity,
        Err(e) => {
            audit::emit(&AuditEvent::denied(Some(method), e.to_string()).with_client_ip(client_ip));
            return Err(e);
        }
    };

    let (claims, token) = state.sessions.issue(&identity, method).await?;
    info!(subject = %claims.subject, %method, "Login succeeded");

    Ok(AuthOutcome::LoggedIn {
        token: token.as_str().to_string(),
        max_age: state.sessions.config().ttl.as_secs(),
    })
}

async fn logout(state: &AppState, headers: &HeaderMap) -> Result<AuthOutcome, AuthError> {
    match extract_token(headers, &state.cookie_name) {
        Some(token) => {
            if let Some(claims) = state.sessions.invalidate(&token).await? {
                info!(subject = %claims.subject, session_id = %claims.id, "Logout succeeded");
            }
        }
        None => debug!("Logout without a session token"),
    }
    Ok(AuthOutcome::LoggedOut)
}

fn render(state: &AppState, outcome: AuthOutcome) -> Response {
    let (cookie, response) = match outcome {
        AuthOutcome::LoggedIn { token, max_age } => (
            session_cookie(state, &token, max_age),
            (StatusCode::OK, Json(json!({ "token": token }))).into_response(),
        ),
        AuthOutcome::LoggedOut => (session_cookie(state, "", 0), StatusCode::OK.into_response()),
    };

    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            let mut response = response;
            response.headers_mut().insert(header::SET_COOKIE, value);
            response
        }
        Err(e) => AuthError::Internal(format!("invalid session cookie: {e}")).into_response(),
    }
}

/// `Set-Cookie` value for the session. `max_age` 0 clears it.
fn session_cookie(state: &AppState, value: &str, max_age: u64) -> String {
    let mut cookie = format!(
        "{}={value}; Path=/; HttpOnly; SameSite=Strict; Max-Age={max_age}",
        state.cookie_name
    );
    if state.secure_cookie {
        cookie.push_str("; Secure");
    }
    cookie
}
