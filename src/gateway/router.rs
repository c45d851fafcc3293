//! HTTP router and handlers

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{any, get},
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::warn;

use super::auth::session_middleware;
use super::handler::auth_handler;
use crate::config::ServerConfig;
use crate::session::SessionManager;
use crate::store::{SecretStore, with_timeout};
use crate::token::SessionClaims;
use crate::upstream::ClusterApi;

/// Shared application state
pub struct AppState {
    /// Session issuing and validation
    pub sessions: Arc<SessionManager>,
    /// Credential verification
    pub upstream: Arc<dyn ClusterApi>,
    /// Secret store, probed by `/ready`
    pub store: Arc<dyn SecretStore>,
    /// Namespace holding the gateway's secrets
    pub namespace: String,
    /// Per-call store deadline
    pub store_timeout: Duration,
    /// Per-client login limiter (`None` when unlimited)
    pub login_limiter: Option<Arc<DefaultKeyedRateLimiter<IpAddr>>>,
    /// Session cookie name
    pub cookie_name: String,
    /// Whether the session cookie is marked `Secure`
    pub secure_cookie: bool,
}

/// Build the login limiter, one bucket per client address;
/// `per_minute == 0` disables it.
#[must_use]
pub fn login_limiter(per_minute: u32) -> Option<Arc<DefaultKeyedRateLimiter<IpAddr>>> {
    NonZeroU32::new(per_minute).map(|quota| Arc::new(RateLimiter::keyed(Quota::per_minute(quota))))
}

/// Create the router
pub fn create_router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    let protected = Router::new()
        .route("/v1/session", get(session_handler).post(session_handler))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), session_middleware));

    Router::new()
        .route(&config.auth_path(), any(auth_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .merge(protected)
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Identity of the presented session
async fn session_handler(Extension(claims): Extension<SessionClaims>) -> impl IntoResponse {
    Json(json!({
        "subject": claims.subject,
        "groups": claims.groups,
        "extra": claims.extra,
        "method": claims.method,
        "session_id": claims.id,
        "issued_at": claims.issued_at,
        "expires_at": claims.expires_at,
    }))
}

/// Liveness
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness: the secret store answers a `list`.
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let probe = with_timeout(
        state.store_timeout,
        "readiness list",
        state.store.list(&state.namespace),
    )
    .await;

    match probe {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            warn!(error = %e, "Readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}
