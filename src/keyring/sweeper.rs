//! Background maintenance for the key ring.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::KeyRing;
use crate::session::SessionManager;

/// Delay before re-opening a watch that ended or failed
const REWATCH_DELAY: Duration = Duration::from_secs(5);

/// Spawn a task that rotates an aged key and prunes expired keys and
/// revocations every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_sweeper(
    sessions: Arc<SessionManager>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; startup already did this work.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => sweep(&sessions).await,
                _ = shutdown.recv() => {
                    debug!("Key ring sweeper shutting down");
                    break;
                }
            }
        }
    })
}

async fn sweep(sessions: &SessionManager) {
    let ring = sessions.key_ring();
    if let Err(e) = ring.ensure_active_key().await {
        warn!(error = %e, "Scheduled key rotation failed");
    }
    match ring.prune().await {
        Ok(removed) if removed > 0 => debug!(removed, "Sweeper pruned keys"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Key pruning failed"),
    }
    match sessions.prune_revocations().await {
        Ok(removed) if removed > 0 => debug!(removed, "Sweeper pruned revocations"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Revocation pruning failed"),
    }
}

/// Spawn a task that invalidates the ring cache whenever the key ring
/// secret changes in the store.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_watcher(
    ring: Arc<KeyRing>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = watch_once(&ring) => {}
                _ = shutdown.recv() => {
                    debug!("Key ring watcher shutting down");
                    return;
                }
            }

            tokio::select! {
                () = tokio::time::sleep(REWATCH_DELAY) => {}
                _ = shutdown.recv() => {
                    debug!("Key ring watcher shutting down");
                    return;
                }
            }
        }
    })
}

/// Follow one watch stream until it ends or errors.
async fn watch_once(ring: &KeyRing) {
    let mut events = match ring.store.watch(&ring.namespace).await {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "Cannot watch key ring secret");
            return;
        }
    };

    while let Some(event) = events.next().await {
        match event {
            Ok(event) if event.secret.name == ring.config.secret_name => {
                debug!(kind = ?event.kind, "Key ring secret changed, invalidating cache");
                ring.invalidate();
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Key ring watch failed");
                break;
            }
        }
    }

    // Changes may have been missed while the watch was down.
    ring.invalidate();
}
