//! Shared harness: an in-memory store, a fake cluster and the real router.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::ConnectInfo;
use axum::http::{Request, Response, header};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tower::ServiceExt;

use cluster_auth_gateway::config::Config;
use cluster_auth_gateway::gateway::{AppState, Gateway, create_router};
use cluster_auth_gateway::store::{InMemorySecretStore, SecretStore};
use cluster_auth_gateway::upstream::{
    ClusterApi, ClusterCredentials, UpstreamError, UpstreamIdentity,
};

/// Token the fake cluster accepts as alice
pub const ALICE_TOKEN: &str = "alice-cluster-token";

/// Accepts [`ALICE_TOKEN`], rejects everything else, and counts calls.
#[derive(Default)]
pub struct FakeCluster {
    pub calls: Mutex<Vec<ClusterCredentials>>,
    pub down: bool,
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn review(
        &self,
        credentials: &ClusterCredentials,
    ) -> Result<UpstreamIdentity, UpstreamError> {
        self.calls.lock().push(credentials.clone());
        if self.down {
            return Err(UpstreamError::Unreachable("connection refused".to_string()));
        }
        match credentials.bearer.as_deref() {
            Some(ALICE_TOKEN) => Ok(UpstreamIdentity {
                username: credentials
                    .impersonate_user
                    .clone()
                    .unwrap_or_else(|| "alice".to_string()),
                uid: Some("uid-alice".to_string()),
                groups: vec!["developers".to_string(), "system:authenticated".to_string()],
                extra: BTreeMap::new(),
            }),
            _ => Err(UpstreamError::Rejected(401)),
        }
    }
}

/// A gateway wired to in-memory parts
pub struct Harness {
    pub router: Router,
    pub state: Arc<AppState>,
    pub store: Arc<dyn SecretStore>,
    pub cluster: Arc<FakeCluster>,
    pub config: Config,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(Config::default(), FakeCluster::default()).await
    }

    pub async fn with(config: Config, cluster: FakeCluster) -> Self {
        let store: Arc<dyn SecretStore> = Arc::new(InMemorySecretStore::new());
        Self::with_store(config, cluster, store).await
    }

    pub async fn with_store(
        config: Config,
        cluster: FakeCluster,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        let cluster = Arc::new(cluster);
        let upstream: Arc<dyn ClusterApi> = cluster.clone();
        let gateway = Gateway::with_parts(config.clone(), Arc::clone(&store), upstream)
            .await
            .unwrap();
        let state = gateway.state();
        let router = create_router(Arc::clone(&state), &config.server);
        Self {
            router,
            state,
            store,
            cluster,
            config,
        }
    }

    pub fn auth_uri(&self, action: &str) -> String {
        format!("{}?action={action}", self.config.server.auth_path())
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn login(&self, body: Value) -> Response<Body> {
        self.send(
            Request::post(self.auth_uri("login"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    /// Log in as if connected from `peer`.
    pub async fn login_from(&self, peer: &str, body: Value) -> Response<Body> {
        let mut request = Request::post(self.auth_uri("login"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let addr: SocketAddr = peer.parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        self.send(request).await
    }

    /// Log in with a token the cluster accepts and return the session token.
    pub async fn login_alice(&self) -> String {
        let response = self.login(json!({ "token": ALICE_TOKEN })).await;
        assert_eq!(response.status(), 200);
        read_json(response).await["token"].as_str().unwrap().to_string()
    }

    pub async fn logout(&self, session: &str) -> Response<Body> {
        self.send(
            Request::post(self.auth_uri("logout"))
                .header(header::AUTHORIZATION, format!("Bearer {session}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn whoami(&self, session: &str) -> Response<Body> {
        self.send(
            Request::get("/v1/session")
                .header(header::AUTHORIZATION, format!("Bearer {session}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }
}

pub async fn read_body(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn read_json(response: Response<Body>) -> Value {
    serde_json::from_str(&read_body(response).await).unwrap()
}
