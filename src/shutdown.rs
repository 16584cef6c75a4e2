//! Process-wide shutdown: signal, cancel, drain, release.

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::worker::PoolReport;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the cancellation token every worker loop and correlator observes.
///
/// Cloning shares the same state. Triggering is idempotent: only the first
/// trigger starts shutdown.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    triggered: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token to hand to the worker pool, correlators and the HTTP server.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start shutdown. Returns `true` only for the call that started it.
    pub fn trigger(&self) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("shutdown started");
        self.token.cancel();
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown on SIGINT or SIGTERM. Runs until the process exits;
    /// later signals are logged and otherwise ignored.
    #[cfg(unix)]
    pub async fn listen_for_signals(&self) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        loop {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            self.on_signal(name);
        }
    }

    #[cfg(not(unix))]
    pub async fn listen_for_signals(&self) -> Result<()> {
        loop {
            tokio::signal::ctrl_c().await?;
            self.on_signal("ctrl-c");
        }
    }

    fn on_signal(&self, name: &str) {
        if self.trigger() {
            info!(signal = name, "termination signal received");
        } else {
            warn!(signal = name, "already shutting down, signal ignored");
        }
    }

    /// Wait for shutdown, then for every worker to stop, then close the
    /// broker connection.
    ///
    /// If the pool stops on its own first (e.g. a worker failed to start),
    /// shutdown is triggered so the rest of the process follows.
    pub async fn drain<B: Broker>(
        &self,
        mut pool: JoinHandle<Result<PoolReport>>,
        broker: &B,
    ) -> Result<PoolReport> {
        let joined = tokio::select! {
            joined = &mut pool => {
                self.trigger();
                joined
            }
            _ = self.token.cancelled() => {
                info!("waiting for workers to drain");
                pool.await
            }
        };
        let report = joined
            .map_err(|e| Error::Other(format!("worker pool task failed: {e}")))
            .and_then(|result| result);

        if let Err(e) = broker.close().await {
            warn!("closing broker connection: {e}");
        }
        info!("shutdown complete");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent() {
        let shutdown = ShutdownCoordinator::new();
        assert!(!shutdown.is_shutting_down());
        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(shutdown.is_shutting_down());
        assert!(shutdown.token().is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let shutdown = ShutdownCoordinator::new();
        let other = shutdown.clone();
        assert!(other.trigger());
        assert!(shutdown.is_shutting_down());
        assert!(!shutdown.trigger());
    }
}
