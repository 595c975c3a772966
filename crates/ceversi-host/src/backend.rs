//! Backend child process
//!
//! The backend is started with `--no-certs` and `PORT=<backend port>` in its
//! environment, inheriting stdout and stderr. It is killed when the host stops
//! and, as a last resort, when its handle is dropped.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BackendConfig;
use crate::error::HostError;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};

/// Interval between readiness probes
const READY_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Argument passed to every backend
pub const BACKEND_ARGS: [&str; 1] = ["--no-certs"];

/// Environment variable carrying the backend port
pub const PORT_ENV: &str = "PORT";

#[derive(Debug)]
pub struct BackendProcess {
    child: Child,
    port: u16,
    exit: Option<ExitStatus>,
}

impl BackendProcess {
    pub fn spawn(config: &BackendConfig) -> Result<Self, HostError> {
        let child = Command::new(&config.executable)
            .args(BACKEND_ARGS)
            .env(PORT_ENV, config.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HostError::BackendSpawn {
                path: config.executable.display().to_string(),
                source,
            })?;

        info!(
            "Started backend {} (pid {:?}) on port {}",
            config.executable.display(),
            child.id(),
            config.port
        );

        Ok(Self {
            child,
            port: config.port,
            exit: None,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// OS process id, `None` once the process has been reaped
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Poll the backend port until it accepts TCP connections.
    ///
    /// Returns `false` if `timeout` elapses or the process exits first.
    pub async fn wait_ready(&mut self, timeout: Duration) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit = Some(status);
                return false;
            }
            if TcpStream::connect(addr).await.is_ok() {
                debug!("Backend is accepting connections on {}", addr);
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(READY_PROBE_INTERVAL).await;
        }
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }

    /// Kill the process if it is still running and reap it. Idempotent.
    pub async fn terminate(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        if let Some(status) = self.child.try_wait()? {
            self.exit = Some(status);
            return Ok(status);
        }

        debug!("Killing backend (pid {:?})", self.child.id());
        if let Err(e) = self.child.start_kill() {
            // Raced with a natural exit
            debug!("Kill failed: {}", e);
        }
        self.wait().await
    }

    /// Watch the backend until `stop` is cancelled, then terminate it.
    ///
    /// An exit before `stop` triggers a process-wide shutdown.
    pub async fn supervise(mut self, coordinator: ShutdownCoordinator, stop: CancellationToken) {
        tokio::select! {
            status = self.wait() => {
                let status = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => format!("wait failed: {}", e),
                };
                if stop.is_cancelled() {
                    debug!("Backend exited during shutdown: {}", status);
                } else {
                    error!("Backend exited unexpectedly: {}", status);
                    coordinator.trigger(ShutdownReason::BackendExited(status));
                }
            }
            _ = stop.cancelled() => {}
        }

        match self.terminate().await {
            Ok(status) => info!("Backend stopped ({})", status),
            Err(e) => warn!("Failed to stop backend: {}", e),
        }
    }
}
