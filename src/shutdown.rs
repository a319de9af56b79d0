//! Server-initiated shutdown.
//!
//! Connections register with the coordinator and watch a boolean flag; when
//! it flips they send a close frame and exit. Sessions are drained from the
//! registry and killed, and the caller waits a bounded time for their shells.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::registry::SessionRegistry;
use crate::session::SessionState;

#[derive(Clone)]
pub struct ShutdownCoordinator {
    signal: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

/// Decrements the active connection count when dropped.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Track a connection. The receiver flips to `true` on shutdown.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        (
            ConnectionGuard {
                active: self.active.clone(),
            },
            self.signal.subscribe(),
        )
    }

    /// Tell every registered connection to close.
    pub fn shutdown(&self) {
        self.signal.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.signal.borrow()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Close connections, kill every registered session and wait up to
    /// `grace` for all of them to reach `Closed`.
    ///
    /// Returns `false` if some shell was still running when `grace` ran out.
    pub async fn drain(&self, registry: &SessionRegistry, grace: Duration) -> bool {
        self.shutdown();

        let sessions = registry.drain();
        if sessions.is_empty() {
            return true;
        }
        tracing::info!(count = sessions.len(), "terminating sessions");
        for session in &sessions {
            session.kill();
        }

        let closed = futures::future::join_all(sessions.iter().map(|s| s.closed()));
        match tokio::time::timeout(grace, closed).await {
            Ok(_) => {
                tracing::info!("all sessions closed");
                true
            }
            Err(_) => {
                let remaining = sessions
                    .iter()
                    .filter(|s| s.state() != SessionState::Closed)
                    .count();
                tracing::warn!(remaining, "sessions still running after shutdown grace period");
                false
            }
        }
    }
}

/// Resolve on SIGINT or SIGTERM, naming the signal received.
pub async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            Err(e) => {
                tracing::warn!(?e, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
