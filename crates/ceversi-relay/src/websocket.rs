//! WebSocket relay client
//!
//! One control WebSocket per client carries [`ControlMessage`] frames. Leases are
//! registered over it, and the relay announces each waiting remote peer with an
//! `Incoming` message. Each lease has a dispatcher that dials a dedicated data
//! WebSocket per announced peer, concurrently and under the connect timeout,
//! and queues the ones that connect for [`RelayListener::accept`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::endpoint;
use crate::{
    ControlMessage, Lease, RelayClient, RelayConfig, RelayConnector, RelayError, RelayListener,
    RelayResult, WsByteStream,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Time allowed for the control tasks to wind down on close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pending `Register` awaiting `Registered`/`Rejected`, answered in order
type PendingRegistration = (oneshot::Sender<RelayResult<String>>, mpsc::Sender<String>);

/// Lease id → channel of announced connection ids
type LeaseTable = Arc<RwLock<HashMap<String, mpsc::Sender<String>>>>;

/// Connector for WebSocket relays
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketRelayConnector;

#[async_trait]
impl RelayConnector for WebSocketRelayConnector {
    type Client = WebSocketRelayClient;

    async fn connect(&self, config: &RelayConfig) -> RelayResult<Self::Client> {
        WebSocketRelayClient::connect(config).await
    }
}

/// Client holding the control connection to one relay
pub struct WebSocketRelayClient {
    server: Url,
    connect_timeout: Duration,
    control_tx: mpsc::Sender<ControlMessage>,
    pending: Arc<Mutex<VecDeque<PendingRegistration>>>,
    leases: LeaseTable,
    shutdown: CancellationToken,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketRelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRelayClient")
            .field("server", &self.server.as_str())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl WebSocketRelayClient {
    /// Connect to the first bootstrap server that accepts a control connection
    pub async fn connect(config: &RelayConfig) -> RelayResult<Self> {
        if config.bootstrap_servers.is_empty() {
            return Err(RelayError::NoBootstrapServers);
        }

        let mut failures = Vec::new();

        for server in &config.bootstrap_servers {
            let url = endpoint(server, &["lease"])?;
            debug!("Dialing relay control endpoint {}", url);

            match tokio::time::timeout(config.connect_timeout, connect_async(url.as_str())).await
            {
                Ok(Ok((ws, _response))) => {
                    info!(server = %server, "Connected to relay");
                    return Ok(Self::start(server.clone(), config.connect_timeout, ws));
                }
                Ok(Err(e)) => {
                    warn!(server = %server, "Relay unreachable: {}", e);
                    failures.push(format!("{}: {}", server, e));
                }
                Err(_) => {
                    warn!(
                        server = %server,
                        "Relay dial timed out after {:?}", config.connect_timeout
                    );
                    failures.push(format!("{}: timed out", server));
                }
            }
        }

        Err(RelayError::ConnectionFailed(failures.join("; ")))
    }

    fn start(server: Url, connect_timeout: Duration, ws: WsStream) -> Self {
        let (sink, source) = ws.split();
        let (control_tx, control_rx) = mpsc::channel(64);
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let leases: LeaseTable = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let writer = tokio::spawn(Self::writer_task(sink, control_rx, shutdown.clone()));
        let reader = tokio::spawn(Self::reader_task(
            source,
            pending.clone(),
            leases.clone(),
            shutdown.clone(),
        ));

        Self {
            server,
            connect_timeout,
            control_tx,
            pending,
            leases,
            shutdown,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(vec![writer, reader]),
        }
    }

    /// Bootstrap server this client is connected to
    pub fn server(&self) -> &Url {
        &self.server
    }

    async fn writer_task(
        mut sink: futures_util::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::Receiver<ControlMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                // Queued deregistrations go out before the close frame
                biased;
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let text = match msg.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode control message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!("Relay control send failed: {}", e);
                        break;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
        debug!("Relay control writer stopped");
    }

    async fn reader_task(
        mut source: futures_util::stream::SplitStream<WsStream>,
        pending: Arc<Mutex<VecDeque<PendingRegistration>>>,
        leases: LeaseTable,
        shutdown: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                frame = source.next() => frame,
                _ = shutdown.cancelled() => break,
            };

            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => {
                    info!("Relay closed the control connection");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("Relay control connection error: {}", e);
                    break;
                }
            };

            let msg = match ControlMessage::decode(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Ignoring malformed control message: {}", e);
                    continue;
                }
            };

            match msg {
                ControlMessage::Registered { lease_id } => {
                    let Some((reply, incoming)) = pending.lock().await.pop_front() else {
                        warn!(lease_id = %lease_id, "Unsolicited registration");
                        continue;
                    };
                    leases.write().await.insert(lease_id.clone(), incoming);
                    let _ = reply.send(Ok(lease_id));
                }
                ControlMessage::Rejected { reason } => {
                    if let Some((reply, _)) = pending.lock().await.pop_front() {
                        let _ = reply.send(Err(RelayError::Rejected(reason)));
                    }
                }
                ControlMessage::Incoming {
                    lease_id,
                    connection_id,
                } => {
                    let tx = leases.read().await.get(&lease_id).cloned();
                    match tx {
                        Some(tx) => {
                            if tx.send(connection_id).await.is_err() {
                                debug!(lease_id = %lease_id, "Listener gone, dropping connection");
                            }
                        }
                        None => debug!(lease_id = %lease_id, "Connection for unknown lease"),
                    }
                }
                other => warn!("Unexpected control message from relay: {:?}", other),
            }
        }

        // Listeners observe the lost registration as a closed channel
        leases.write().await.clear();
        for (reply, _) in pending.lock().await.drain(..) {
            let _ = reply.send(Err(RelayError::Closed));
        }
        shutdown.cancel();
        debug!("Relay control reader stopped");
    }
}

#[async_trait]
impl RelayClient for WebSocketRelayClient {
    type Listener = WebSocketRelayListener;

    async fn listen(&self, lease: Lease) -> RelayResult<Self::Listener> {
        if self.closed.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return Err(RelayError::Closed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(64);

        // Queue the reply slot before the frame leaves so the reader can't miss it
        self.pending.lock().await.push_back((reply_tx, incoming_tx));
        self.control_tx
            .send(ControlMessage::Register {
                lease: lease.clone(),
            })
            .await
            .map_err(|_| RelayError::Closed)?;

        let lease_id = reply_rx.await.map_err(|_| RelayError::Closed)??;
        info!(lease = %lease.name, lease_id = %lease_id, "Lease registered");

        let shutdown = self.shutdown.child_token();
        let (ready_tx, ready_rx) = mpsc::channel(16);
        tokio::spawn(dispatch_incoming(
            Dialer {
                server: self.server.clone(),
                lease_id: lease_id.clone(),
                timeout: self.connect_timeout,
                ready: ready_tx,
            },
            incoming_rx,
            shutdown.clone(),
        ));

        Ok(WebSocketRelayListener {
            lease_id,
            lease,
            ready: Mutex::new(ready_rx),
            control_tx: self.control_tx.clone(),
            leases: self.leases.clone(),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    async fn close(&self) -> RelayResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        info!(server = %self.server, "Relay client closed");
        Ok(())
    }
}

impl Drop for WebSocketRelayClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Dials data sockets for one lease
#[derive(Clone)]
struct Dialer {
    server: Url,
    lease_id: String,
    timeout: Duration,
    ready: mpsc::Sender<WsByteStream>,
}

impl Dialer {
    async fn dial(self, connection_id: String) {
        let url = match endpoint(&self.server, &["lease", &self.lease_id, &connection_id]) {
            Ok(url) => url,
            Err(e) => {
                warn!(connection_id = %connection_id, "Bad data endpoint: {}", e);
                return;
            }
        };

        match tokio::time::timeout(self.timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => {
                debug!(
                    lease_id = %self.lease_id,
                    connection_id = %connection_id,
                    "Relayed connection established"
                );
                if self.ready.send(WsByteStream::new(ws)).await.is_err() {
                    debug!(connection_id = %connection_id, "Listener gone, dropping connection");
                }
            }
            Ok(Err(e)) => {
                warn!(connection_id = %connection_id, "Failed to dial relayed connection: {}", e);
            }
            Err(_) => {
                warn!(
                    connection_id = %connection_id,
                    "Relayed connection not established after {:?}", self.timeout
                );
            }
        }
    }
}

/// Dial every announced connection until the lease goes away
async fn dispatch_incoming(
    dialer: Dialer,
    mut incoming: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    let mut dials = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = dials.join_next(), if !dials.is_empty() => {}
            next = incoming.recv() => match next {
                Some(connection_id) => {
                    dials.spawn(dialer.clone().dial(connection_id));
                }
                None => break,
            },
        }
    }
    dials.abort_all();
    debug!(lease_id = %dialer.lease_id, "Relay dispatcher stopped");
}

/// Listener for one lease registered through a [`WebSocketRelayClient`]
pub struct WebSocketRelayListener {
    lease_id: String,
    lease: Lease,
    ready: Mutex<mpsc::Receiver<WsByteStream>>,
    control_tx: mpsc::Sender<ControlMessage>,
    leases: LeaseTable,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for WebSocketRelayListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRelayListener")
            .field("lease_id", &self.lease_id)
            .field("lease", &self.lease.name)
            .finish()
    }
}

#[async_trait]
impl RelayListener for WebSocketRelayListener {
    type Stream = WsByteStream;

    async fn accept(&self) -> RelayResult<Self::Stream> {
        let mut ready = self.ready.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(RelayError::Closed),
            next = ready.recv() => next.ok_or(RelayError::Closed),
        }
    }

    async fn close(&self) -> RelayResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();
        self.leases.write().await.remove(&self.lease_id);

        // The client may already be gone; the relay drops the lease with it
        let _ = self
            .control_tx
            .send(ControlMessage::Deregister {
                lease_id: self.lease_id.clone(),
            })
            .await;

        info!(lease_id = %self.lease_id, "Lease released");
        Ok(())
    }

    fn lease_id(&self) -> &str {
        &self.lease_id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.shutdown.is_cancelled()
    }
}

impl Drop for WebSocketRelayListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
