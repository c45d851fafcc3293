//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::router::{AppState, create_router, login_limiter};
use crate::config::Config;
use crate::keyring::{KeyRing, spawn_sweeper, spawn_watcher};
use crate::session::SessionManager;
use crate::store::{self, SecretStore};
use crate::upstream::{ClusterApi, HttpClusterApi};
use crate::{Error, Result};

/// Authentication gateway server
pub struct Gateway {
    config: Config,
    store: Arc<dyn SecretStore>,
    sessions: Arc<SessionManager>,
    upstream: Arc<dyn ClusterApi>,
}

impl Gateway {
    /// Open the store, load (or create) the key ring and connect upstream.
    ///
    /// A key ring that cannot be initialized is fatal.
    pub async fn new(config: Config) -> Result<Self> {
        let store = store::connect(&config.store)?;
        let upstream: Arc<dyn ClusterApi> = Arc::new(HttpClusterApi::new(&config.upstream)?);
        Self::with_parts(config, store, upstream).await
    }

    /// Assemble a gateway from an already-open store and upstream client.
    pub async fn with_parts(
        config: Config,
        store: Arc<dyn SecretStore>,
        upstream: Arc<dyn ClusterApi>,
    ) -> Result<Self> {
        let ring = Arc::new(KeyRing::new(
            Arc::clone(&store),
            &config.store,
            config.keys.clone(),
        ));
        let active = ring.initialize().await?;
        info!(key_id = %active.id, algorithm = %active.algorithm, "Key ring ready");

        let sessions = Arc::new(SessionManager::new(
            ring,
            Arc::clone(&store),
            &config.store,
            config.session.clone(),
        ));

        Ok(Self {
            config,
            store,
            sessions,
            upstream,
        })
    }

    /// Shared state for the router
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            sessions: Arc::clone(&self.sessions),
            upstream: Arc::clone(&self.upstream),
            store: Arc::clone(&self.store),
            namespace: self.config.store.namespace.clone(),
            store_timeout: self.config.store.timeout,
            login_limiter: login_limiter(self.config.server.login_rate_limit),
            cookie_name: self.config.server.cookie_name.clone(),
            secure_cookie: self.config.server.secure_cookie,
        })
    }

    /// Run the gateway until SIGINT/SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let app = create_router(self.state(), &self.config.server);
        let listener = TcpListener::bind(addr).await?;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            %addr,
            auth_path = %self.config.server.auth_path(),
            store = ?self.config.store.backend,
            namespace = %self.config.store.namespace,
            "Auth gateway listening"
        );
        if !self.config.server.secure_cookie {
            warn!("Session cookie is not marked Secure");
        }
        if self.config.server.login_rate_limit == 0 {
            warn!("Login rate limiting disabled");
        }

        let sweeper = spawn_sweeper(
            Arc::clone(&self.sessions),
            self.config.keys.sweep_interval,
            shutdown_tx.subscribe(),
        );
        let watcher = spawn_watcher(Arc::clone(self.sessions.key_ring()), shutdown_tx.subscribe());

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        // The server may also stop on its own; make sure the tasks hear about it.
        let _ = shutdown_tx.send(());
        for (name, task) in [("sweeper", sweeper), ("watcher", watcher)] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }

        info!("Auth gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
