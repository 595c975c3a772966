//! HTTP listeners
//!
//! Both the relay listener and the local TCP listener run the same serve loop:
//! accept a byte stream, serve HTTP/1.1 on it with the shared [`ProxyHandler`],
//! and on stop drain in-flight connections for up to the grace period.

use async_trait::async_trait;
use ceversi_relay::RelayListener;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::proxy::ProxyHandler;
use crate::shutdown::ShutdownCoordinator;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The listener will never yield another connection
    #[error("listener closed")]
    Closed,

    #[error("accept failed: {0}")]
    Transient(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("{0} listener closed unexpectedly")]
    ListenerClosed(String),
}

/// Source of inbound connections for the serve loop
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&self) -> Result<(Self::Stream, Option<SocketAddr>), AcceptError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Plain TCP acceptor for the local listener
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&self) -> Result<(Self::Stream, Option<SocketAddr>), AcceptError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| AcceptError::Transient(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        Ok((stream, Some(peer)))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Acceptor over a registered relay lease
pub struct RelayAcceptor<L> {
    listener: Arc<L>,
}

impl<L: RelayListener> RelayAcceptor<L> {
    pub fn new(listener: Arc<L>) -> Self {
        Self { listener }
    }
}

#[async_trait]
impl<L: RelayListener> Acceptor for RelayAcceptor<L> {
    type Stream = L::Stream;

    async fn accept(&self) -> Result<(Self::Stream, Option<SocketAddr>), AcceptError> {
        match self.listener.accept().await {
            Ok(stream) => Ok((stream, None)),
            Err(e) if e.is_closed() || self.listener.is_closed() => Err(AcceptError::Closed),
            Err(e) => Err(AcceptError::Transient(e.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "relay"
    }
}

/// Serve one HTTP/1.1 connection, asking it to finish its current exchange
/// once `draining` is cancelled
async fn serve_connection<S>(
    stream: S,
    handler: Arc<ProxyHandler>,
    draining: CancellationToken,
    peer: Option<SocketAddr>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { handler.handle(req).await }
    });
    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    let mut stopping = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("Connection from {:?} ended with error: {}", peer, e);
                }
                break;
            }
            _ = draining.cancelled(), if !stopping => {
                stopping = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Accept and serve connections until `stop` is cancelled or the acceptor closes
pub async fn serve<A: Acceptor>(
    acceptor: A,
    handler: Arc<ProxyHandler>,
    stop: CancellationToken,
    grace: Duration,
) -> Result<(), ServeError> {
    let name = acceptor.name();
    let draining = stop.child_token();
    let mut connections = JoinSet::new();

    // Kept across iterations so reaping a finished connection never drops an
    // accept that is half way through
    let mut accept = acceptor.accept();
    let result = loop {
        tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = &mut accept => match accepted {
                Ok((stream, peer)) => {
                    accept = acceptor.accept();
                    debug!("Accepted {} connection from {:?}", name, peer);
                    connections.spawn(serve_connection(
                        stream,
                        handler.clone(),
                        draining.clone(),
                        peer,
                    ));
                }
                Err(AcceptError::Closed) => {
                    break if stop.is_cancelled() {
                        Ok(())
                    } else {
                        Err(ServeError::ListenerClosed(name.to_string()))
                    };
                }
                Err(AcceptError::Transient(e)) => {
                    warn!("Failed to accept {} connection: {}", name, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    accept = acceptor.accept();
                }
            }
        }
    };

    // Stop accepting before draining so the port or lease is released
    drop(accept);
    drop(acceptor);
    draining.cancel();

    let open = connections.len();
    if open > 0 {
        debug!("Draining {} {} connection(s)", open, name);
    }
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await
    .is_ok();
    if !drained {
        warn!(
            "Grace period elapsed with {} {} connection(s) still open",
            connections.len(),
            name
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    info!("{} listener stopped", name);
    result
}

/// Serve tasks of every active listener
pub struct ListenerSet {
    handler: Arc<ProxyHandler>,
    grace: Duration,
    tasks: JoinSet<()>,
}

impl ListenerSet {
    pub fn new(handler: Arc<ProxyHandler>, grace: Duration) -> Self {
        Self {
            handler,
            grace,
            tasks: JoinSet::new(),
        }
    }

    /// Serve HTTP on a relay lease until `stop` is cancelled
    pub fn serve_relay<L: RelayListener>(
        &mut self,
        listener: Arc<L>,
        stop: CancellationToken,
        coordinator: ShutdownCoordinator,
    ) {
        let lease_id = listener.lease_id().to_string();
        let acceptor = RelayAcceptor::new(listener);
        let handler = self.handler.clone();
        let grace = self.grace;

        self.tasks.spawn(async move {
            if let Err(e) = serve(acceptor, handler, stop, grace).await {
                if coordinator.is_shutting_down() {
                    debug!("Relay lease {} closed during shutdown", lease_id);
                } else {
                    error!("Relay lease {}: {}", lease_id, e);
                }
            }
        });
    }

    /// Serve HTTP on the local TCP listener until `stop` is cancelled
    pub fn serve_local(&mut self, acceptor: TcpAcceptor, stop: CancellationToken) {
        let handler = self.handler.clone();
        let grace = self.grace;

        self.tasks.spawn(async move {
            if let Err(e) = serve(acceptor, handler, stop, grace).await {
                warn!("{}", e);
            }
        });
    }

    /// Wait for every serve task to finish
    pub async fn join(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Listener task panicked: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyTarget;
    use ceversi_relay::{Lease, MemoryRelay, RelayClient, RelayConfig, RelayConnector};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn handler() -> Arc<ProxyHandler> {
        // Nothing listens on port 1, so every request yields a 502
        Arc::new(ProxyHandler::new(ProxyTarget::local(1)))
    }

    async fn get_status_line<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> String {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: ceversi\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response).to_string();
        response.lines().next().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_local_listener_serves_and_releases_port() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let stop = CancellationToken::new();
        let task = tokio::spawn(serve(acceptor, handler(), stop.clone(), Duration::from_secs(1)));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_eq!(get_status_line(&mut stream).await, "HTTP/1.1 502 Bad Gateway");

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_relay_close_without_stop_is_an_error() {
        let relay = MemoryRelay::new();
        let config = RelayConfig::from_urls(["ws://memory.invalid"]).unwrap();
        let client = relay.connect(&config).await.unwrap();
        let listener = Arc::new(client.listen(Lease::new("t", ["http/1.1"])).await.unwrap());

        let task = tokio::spawn(serve(
            RelayAcceptor::new(listener.clone()),
            handler(),
            CancellationToken::new(),
            Duration::from_secs(1),
        ));

        let mut stream = relay.dial("t").await.unwrap();
        assert_eq!(get_status_line(&mut stream).await, "HTTP/1.1 502 Bad Gateway");

        listener.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ServeError::ListenerClosed(_))));
    }

    #[tokio::test]
    async fn test_grace_period_bounds_drain() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let stop = CancellationToken::new();
        let task = tokio::spawn(serve(
            acceptor,
            handler(),
            stop.clone(),
            Duration::from_millis(200),
        ));

        // Half a request head keeps the connection busy
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_keep_alive_connection_drains_promptly() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let stop = CancellationToken::new();
        let task = tokio::spawn(serve(acceptor, handler(), stop.clone(), Duration::from_secs(10)));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: ceversi\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 12];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 502");

        // Well inside the grace period: the idle connection is closed, not waited on
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
