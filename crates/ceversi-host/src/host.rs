//! Host lifecycle
//!
//! Startup runs strictly in order: spawn the backend, register the lease with
//! the relay, bind the optional local listener, then serve. Teardown is the
//! reverse: close the relay listener, close the relay client, stop the local
//! listener within the grace period, stop the backend.

use ceversi_relay::{RelayClient, RelayConnector, RelayListener};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::BackendProcess;
use crate::config::HostConfig;
use crate::error::HostError;
use crate::listener::{ListenerSet, TcpAcceptor};
use crate::proxy::ProxyHandler;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};

type Listener<R> = <<R as RelayConnector>::Client as RelayClient>::Listener;

/// Supervisor of the backend and both listeners
pub struct Host<R: RelayConnector> {
    config: HostConfig,
    connector: R,
    shutdown: ShutdownCoordinator,
}

impl<R: RelayConnector> Host<R> {
    pub fn new(config: HostConfig, connector: R, shutdown: ShutdownCoordinator) -> Self {
        Self {
            config,
            connector,
            shutdown,
        }
    }

    /// Start everything and serve until shutdown is triggered
    pub async fn run(self) -> Result<(), HostError> {
        self.start().await?.wait().await
    }

    /// Start the backend and listeners.
    ///
    /// Fails if the backend cannot be spawned or the lease cannot be
    /// registered; the backend is stopped before returning in the latter case.
    /// A shutdown triggered while starting yields [`HostError::Cancelled`].
    pub async fn start(self) -> Result<RunningHost<R>, HostError> {
        let Host {
            config,
            connector,
            shutdown,
        } = self;

        let mut backend = match BackendProcess::spawn(&config.backend) {
            Ok(backend) => backend,
            Err(e) => {
                shutdown.trigger(ShutdownReason::StartupFailed(e.to_string()));
                return Err(e);
            }
        };

        if let Some(timeout) = config.backend.ready_timeout {
            let ready = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                ready = backend.wait_ready(timeout) => Some(ready),
            };
            match ready {
                Some(true) => info!("Backend ready on port {}", backend.port()),
                Some(false) => warn!(
                    "Backend not accepting connections on port {} after {:?}, continuing",
                    backend.port(),
                    timeout
                ),
                None => {
                    if let Err(e) = backend.terminate().await {
                        warn!("Failed to stop backend: {}", e);
                    }
                    return Err(HostError::Cancelled);
                }
            }
        }

        let handler = Arc::new(ProxyHandler::new(config.proxy_target()));

        let (client, relay_listener) = match register(&connector, &config, &shutdown).await {
            Ok(registered) => registered,
            Err(e) => {
                if !matches!(e, HostError::Cancelled) {
                    shutdown.trigger(ShutdownReason::StartupFailed(e.to_string()));
                }
                if let Err(kill_err) = backend.terminate().await {
                    warn!("Failed to stop backend: {}", kill_err);
                }
                return Err(e);
            }
        };
        let relay_listener = Arc::new(relay_listener);
        info!(
            "Registered lease '{}' (id {})",
            config.lease.name,
            relay_listener.lease_id()
        );

        let local = match config.local_bind_addr() {
            Some(addr) => match TcpAcceptor::bind(addr).await {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    warn!("Failed to bind local listener on {}: {}", addr, e);
                    None
                }
            },
            None => {
                debug!("Local listener disabled");
                None
            }
        };
        let local_addr = local.as_ref().and_then(|a| a.local_addr().ok());

        let relay_stop = CancellationToken::new();
        let local_stop = CancellationToken::new();
        let backend_stop = CancellationToken::new();

        let mut listeners = ListenerSet::new(handler, config.shutdown_grace);
        listeners.serve_relay(relay_listener.clone(), relay_stop.clone(), shutdown.clone());
        if let Some(acceptor) = local {
            if let Some(addr) = local_addr {
                info!("Serving locally on http://{}", addr);
            }
            listeners.serve_local(acceptor, local_stop.clone());
        }

        let backend_task = tokio::spawn(backend.supervise(shutdown.clone(), backend_stop.clone()));

        Ok(RunningHost {
            shutdown,
            client,
            relay_listener,
            listeners,
            local_addr,
            relay_stop,
            local_stop,
            backend_stop,
            backend_task: Some(backend_task),
        })
    }
}

/// Connect to the relay and register the lease.
///
/// Bounded by the registration timeout when one is configured, and abandoned
/// with [`HostError::Cancelled`] if shutdown is triggered meanwhile.
async fn register<R: RelayConnector>(
    connector: &R,
    config: &HostConfig,
    shutdown: &ShutdownCoordinator,
) -> Result<(R::Client, Listener<R>), HostError> {
    let attempt = async {
        let client = connector
            .connect(&config.relay)
            .await
            .map_err(HostError::RelayConnect)?;
        match client.listen(config.lease.clone()).await {
            Ok(listener) => Ok((client, listener)),
            Err(e) => {
                if let Err(close_err) = client.close().await {
                    debug!("Failed to close relay client: {}", close_err);
                }
                Err(HostError::RelayListen(e))
            }
        }
    };

    let bounded = async {
        match config.register_timeout {
            Some(timeout) => tokio::time::timeout(timeout, attempt)
                .await
                .map_err(|_| HostError::RegistrationTimeout(timeout))?,
            None => attempt.await,
        }
    };

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(HostError::Cancelled),
        result = bounded => result,
    }
}

/// A started host
pub struct RunningHost<R: RelayConnector> {
    shutdown: ShutdownCoordinator,
    client: R::Client,
    relay_listener: Arc<Listener<R>>,
    listeners: ListenerSet,
    local_addr: Option<SocketAddr>,
    relay_stop: CancellationToken,
    local_stop: CancellationToken,
    backend_stop: CancellationToken,
    backend_task: Option<JoinHandle<()>>,
}

impl<R: RelayConnector> RunningHost<R> {
    /// Bound address of the local listener, if it is running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn lease_id(&self) -> &str {
        self.relay_listener.lease_id()
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Serve until shutdown is triggered, then tear down.
    ///
    /// Returns [`HostError::BackendExited`] if the backend ending was the
    /// reason for shutting down.
    pub async fn wait(mut self) -> Result<(), HostError> {
        self.shutdown.cancelled().await;
        self.teardown().await;

        match self.shutdown.reason() {
            Some(ShutdownReason::BackendExited(status)) => Err(HostError::BackendExited(status)),
            _ => Ok(()),
        }
    }

    /// Trigger shutdown and tear down. Idempotent.
    pub async fn shutdown(&mut self) {
        self.shutdown.trigger(ShutdownReason::Requested);
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        let Some(backend_task) = self.backend_task.take() else {
            return;
        };

        if let Err(e) = self.relay_listener.close().await {
            warn!("Failed to close relay listener: {}", e);
        }
        self.relay_stop.cancel();

        if let Err(e) = self.client.close().await {
            warn!("Failed to close relay client: {}", e);
        }

        self.local_stop.cancel();
        self.listeners.join().await;

        self.backend_stop.cancel();
        if let Err(e) = backend_task.await {
            error!("Backend monitor failed: {}", e);
        }

        match self.shutdown.reason() {
            Some(reason) => info!("Shutdown complete ({})", reason),
            None => info!("Shutdown complete"),
        }
    }
}

impl<R: RelayConnector> Drop for RunningHost<R> {
    fn drop(&mut self) {
        // Stops the backend if no teardown ran
        self.relay_stop.cancel();
        self.local_stop.cancel();
        self.backend_stop.cancel();
    }
}
