//! End-to-end login/logout tests against the real router
//!
//! Covers:
//! - Token and kubeconfig login
//! - Error taxonomy (400/401/405/429/503)
//! - Per-client login rate limiting
//! - Session cookie handling
//! - Logout idempotency and revocation

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use pretty_assertions::assert_eq;
use serde_json::json;

use cluster_auth_gateway::config::Config;
use common::{ALICE_TOKEN, FakeCluster, Harness, read_body, read_json};

#[tokio::test]
async fn token_login_resolves_alice_on_protected_endpoint() {
    // GIVEN: a gateway whose cluster knows alice's token
    let harness = Harness::new().await;

    // WHEN: alice logs in
    let response = harness.login(json!({ "token": ALICE_TOKEN })).await;

    // THEN: a session token is returned and the cookie is set
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let body = read_json(response).await;
    let session = body["token"].as_str().unwrap();
    assert!(!session.is_empty());
    assert_ne!(session, ALICE_TOKEN);
    assert!(cookie.starts_with(&format!("R_SESS={session};")));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Strict"));
    assert!(cookie.contains("Secure"));
    assert!(cookie.contains("Max-Age=43200"));

    // AND: the protected endpoint resolves the identity
    let response = harness.whoami(session).await;
    assert_eq!(response.status(), StatusCode::OK);
    let identity = read_json(response).await;
    assert_eq!(identity["subject"], "alice");
    assert_eq!(identity["method"], "token");
    assert_eq!(identity["groups"][0], "developers");
    assert_eq!(identity["extra"]["uid"], "uid-alice");
}

#[tokio::test]
async fn session_cookie_is_accepted() {
    let harness = Harness::new().await;
    let session = harness.login_alice().await;

    let response = harness
        .send(
            Request::post("/v1/session")
                .header(header::COOKIE, format!("theme=dark; R_SESS={session}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["subject"], "alice");
}

#[tokio::test]
async fn rejected_credential_is_401_without_echo() {
    // GIVEN: a token the cluster does not know
    let harness = Harness::new().await;
    let secret = "very-secret-wrong-token";

    // WHEN: logging in with it
    let response = harness.login(json!({ "token": secret })).await;

    // THEN: 401 with a generic body that reveals neither token nor reason
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    let body = read_body(response).await;
    assert!(!body.contains(secret));
    assert!(!body.contains("401"));
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"], "unauthorized");
    assert_eq!(body["message"], "unauthorized");
}

#[tokio::test]
async fn get_on_auth_path_is_405_and_never_reaches_cluster() {
    let harness = Harness::new().await;

    let response = harness
        .send(
            Request::get(harness.auth_uri("login"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers().get(header::ALLOW).unwrap(), "POST");
    assert!(harness.cluster.calls.lock().is_empty());
}

#[tokio::test]
async fn ambiguous_or_empty_login_is_400() {
    let harness = Harness::new().await;

    for body in [
        json!({}),
        json!({ "token": "", "kubeConfig": "" }),
        json!({ "token": ALICE_TOKEN, "kubeConfig": "apiVersion: v1" }),
    ] {
        let response = harness.login(body.clone()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
    }

    let response = harness
        .send(
            Request::post(harness.auth_uri("login"))
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(harness.cluster.calls.lock().is_empty());
}

#[tokio::test]
async fn missing_or_unknown_action_is_400() {
    let harness = Harness::new().await;
    let path = harness.config.server.auth_path();

    for uri in [path.clone(), format!("{path}?action=refresh")] {
        let response = harness
            .send(Request::post(uri.as_str()).body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn kubeconfig_login_records_method() {
    let harness = Harness::new().await;
    let kubeconfig = format!(
        "current-context: dev\ncontexts:\n- name: dev\n  context:\n    user: alice\nusers:\n- name: alice\n  user:\n    token: {ALICE_TOKEN}\n"
    );

    let response = harness.login(json!({ "kubeConfig": kubeconfig })).await;
    assert_eq!(response.status(), StatusCode::OK);
    let session = read_json(response).await["token"].as_str().unwrap().to_string();

    let identity = read_json(harness.whoami(&session).await).await;
    assert_eq!(identity["subject"], "alice");
    assert_eq!(identity["method"], "kubeconfig");
}

#[tokio::test]
async fn kubeconfig_with_exec_plugin_is_401() {
    let harness = Harness::new().await;
    let kubeconfig = "current-context: dev\ncontexts:\n- name: dev\n  context:\n    user: alice\nusers:\n- name: alice\n  user:\n    exec:\n      command: /bin/sh\n";

    let response = harness.login(json!({ "kubeConfig": kubeconfig })).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(harness.cluster.calls.lock().is_empty());
}

#[tokio::test]
async fn double_logout_is_200_and_session_is_dead() {
    // GIVEN: a live session
    let harness = Harness::new().await;
    let session = harness.login_alice().await;
    assert_eq!(harness.whoami(&session).await.status(), StatusCode::OK);

    // WHEN: logging out twice
    let first = harness.logout(&session).await;
    let second = harness.logout(&session).await;

    // THEN: both succeed, clear the cookie, and the token no longer works
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    let cleared = first.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
    assert!(cleared.starts_with("R_SESS=;"));
    assert!(cleared.contains("Max-Age=0"));
    assert!(read_body(first).await.is_empty());

    let response = harness.whoami(&session).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_without_or_with_garbage_token_is_200() {
    let harness = Harness::new().await;

    let response = harness
        .send(
            Request::post(harness.auth_uri("logout"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(harness.logout("not-a-session").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn protected_endpoint_rejects_missing_and_forged_tokens() {
    let harness = Harness::new().await;

    let response = harness
        .send(Request::get("/v1/session").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers().get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");

    // A token passed straight through is not a session
    assert_eq!(harness.whoami(ALICE_TOKEN).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unreachable_cluster_is_503_not_401() {
    let harness = Harness::with(
        Config::default(),
        FakeCluster {
            down: true,
            ..FakeCluster::default()
        },
    )
    .await;

    let response = harness.login(json!({ "token": ALICE_TOKEN })).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn login_rate_limit_returns_429() {
    let mut config = Config::default();
    config.server.login_rate_limit = 2;
    let harness = Harness::with(config, FakeCluster::default()).await;

    for _ in 0..2 {
        let response = harness.login(json!({ "token": "wrong" })).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = harness.login(json!({ "token": ALICE_TOKEN })).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());
    assert_eq!(harness.cluster.calls.lock().len(), 2);
}

#[tokio::test]
async fn login_rate_limit_is_per_client_address() {
    // GIVEN: a limit of two logins per minute
    let mut config = Config::default();
    config.server.login_rate_limit = 2;
    let harness = Harness::with(config, FakeCluster::default()).await;

    // WHEN: one client exhausts its budget with bad credentials
    for _ in 0..2 {
        let response = harness.login_from("203.0.113.9:40000", json!({ "token": "wrong" })).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let response = harness.login_from("203.0.113.9:40001", json!({ "token": ALICE_TOKEN })).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // THEN: a different client still logs in
    let response = harness.login_from("198.51.100.7:50000", json!({ "token": ALICE_TOKEN })).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn insecure_cookie_omits_secure_flag() {
    let mut config = Config::default();
    config.server.secure_cookie = false;
    config.server.cookie_name = "gw_session".to_string();
    let harness = Harness::with(config, FakeCluster::default()).await;

    let response = harness.login(json!({ "token": ALICE_TOKEN })).await;
    let cookie = response.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();

    assert!(cookie.starts_with("gw_session="));
    assert!(!cookie.contains("Secure"));
}

#[tokio::test]
async fn health_and_ready() {
    let harness = Harness::new().await;

    let response = harness
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "healthy");

    let response = harness
        .send(Request::get("/ready").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_path_is_404_not_401() {
    let harness = Harness::new().await;

    let response = harness
        .send(Request::get("/v1/secrets").body(Body::empty()).unwrap())
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
