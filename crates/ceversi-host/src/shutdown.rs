//! Process-wide shutdown coordination
//!
//! One [`ShutdownCoordinator`] is shared by the signal listener, the backend
//! monitor and the host. Whoever triggers first records the reason; later
//! triggers are no-ops.

use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why the process is shutting down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Interrupt or termination signal (name of the signal)
    Signal(&'static str),
    /// The backend exited on its own
    BackendExited(String),
    /// Startup failed after part of the system was already running
    StartupFailed(String),
    /// Programmatic request
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "received {}", name),
            ShutdownReason::BackendExited(status) => write!(f, "backend exited ({})", status),
            ShutdownReason::StartupFailed(err) => write!(f, "startup failed: {}", err),
            ShutdownReason::Requested => write!(f, "shutdown requested"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start shutting down. Returns `false` if shutdown was already underway.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason.clone()).is_err() {
            return false;
        }
        info!("Shutting down: {}", reason);
        self.token.cancel();
        true
    }

    pub fn state(&self) -> ShutdownState {
        if self.token.is_cancelled() {
            ShutdownState::ShuttingDown
        } else {
            ShutdownState::Running
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() == ShutdownState::ShuttingDown
    }

    /// Reason recorded by the first trigger
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().cloned()
    }

    /// Resolves once shutdown has been triggered
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Spawn a task that triggers shutdown on SIGINT or SIGTERM
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                name = wait_for_signal() => {
                    coordinator.trigger(ShutdownReason::Signal(name));
                }
                _ = coordinator.cancelled() => {}
            }
        })
    }
}

/// Wait for an interrupt or termination signal and return its name
pub async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
    }
}
