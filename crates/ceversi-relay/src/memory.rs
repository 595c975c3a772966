//! In-process relay
//!
//! Leases live in a shared table keyed by name. [`MemoryRelay::dial`] plays the
//! part of a remote peer: it opens a duplex pipe and queues the far end on the
//! lease's listener.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    Lease, RelayClient, RelayConfig, RelayConnector, RelayError, RelayListener, RelayResult,
};

/// Buffer size of each relayed pipe
const PIPE_CAPACITY: usize = 64 * 1024;

struct Registration {
    lease_id: String,
    lease: Lease,
    incoming: mpsc::Sender<DuplexStream>,
}

/// Shared in-process relay
#[derive(Clone, Default)]
pub struct MemoryRelay {
    leases: Arc<Mutex<HashMap<String, Registration>>>,
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay")
            .field("leases", &self.leases().len())
            .finish()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the registered leases
    pub fn leases(&self) -> Vec<Lease> {
        match self.leases.lock() {
            Ok(leases) => leases.values().map(|r| r.lease.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.leases
            .lock()
            .map(|leases| leases.contains_key(name))
            .unwrap_or(false)
    }

    /// Open a connection to the lease registered under `name`
    pub async fn dial(&self, name: &str) -> RelayResult<DuplexStream> {
        let incoming = {
            let leases = self.leases.lock().map_err(|_| RelayError::Closed)?;
            leases
                .get(name)
                .map(|r| r.incoming.clone())
                .ok_or_else(|| RelayError::LeaseNotFound(name.to_string()))?
        };

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        incoming
            .send(far)
            .await
            .map_err(|_| RelayError::LeaseNotFound(name.to_string()))?;
        Ok(near)
    }

    fn register(&self, lease: Lease) -> RelayResult<(String, mpsc::Receiver<DuplexStream>)> {
        let mut leases = self.leases.lock().map_err(|_| RelayError::Closed)?;
        if leases.contains_key(&lease.name) {
            return Err(RelayError::Rejected(format!(
                "lease name '{}' already registered",
                lease.name
            )));
        }

        let lease_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(64);
        leases.insert(
            lease.name.clone(),
            Registration {
                lease_id: lease_id.clone(),
                lease,
                incoming: tx,
            },
        );
        Ok((lease_id, rx))
    }

    fn deregister(&self, name: &str, lease_id: &str) {
        if let Ok(mut leases) = self.leases.lock() {
            if leases.get(name).is_some_and(|r| r.lease_id == lease_id) {
                leases.remove(name);
                debug!(lease = %name, "Memory lease removed");
            }
        }
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    type Client = MemoryRelayClient;

    async fn connect(&self, _config: &RelayConfig) -> RelayResult<Self::Client> {
        Ok(MemoryRelayClient {
            relay: self.clone(),
            owned: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Client of a [`MemoryRelay`]
#[derive(Debug)]
pub struct MemoryRelayClient {
    relay: MemoryRelay,
    /// (name, lease id) of every lease registered through this client
    owned: Mutex<Vec<(String, String)>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl MemoryRelayClient {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayClient for MemoryRelayClient {
    type Listener = MemoryRelayListener;

    async fn listen(&self, lease: Lease) -> RelayResult<Self::Listener> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }

        let name = lease.name.clone();
        let (lease_id, incoming) = self.relay.register(lease)?;
        if let Ok(mut owned) = self.owned.lock() {
            owned.push((name.clone(), lease_id.clone()));
        }

        Ok(MemoryRelayListener {
            relay: self.relay.clone(),
            name,
            lease_id,
            incoming: tokio::sync::Mutex::new(incoming),
            shutdown: self.shutdown.child_token(),
            closed: AtomicBool::new(false),
        })
    }

    async fn close(&self) -> RelayResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();
        let owned = match self.owned.lock() {
            Ok(mut owned) => std::mem::take(&mut *owned),
            Err(_) => Vec::new(),
        };
        for (name, lease_id) in owned {
            self.relay.deregister(&name, &lease_id);
        }
        Ok(())
    }
}

/// Listener for a lease held in a [`MemoryRelay`]
#[derive(Debug)]
pub struct MemoryRelayListener {
    relay: MemoryRelay,
    name: String,
    lease_id: String,
    incoming: tokio::sync::Mutex<mpsc::Receiver<DuplexStream>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

#[async_trait]
impl RelayListener for MemoryRelayListener {
    type Stream = DuplexStream;

    async fn accept(&self) -> RelayResult<Self::Stream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(RelayError::Closed),
            next = incoming.recv() => next.ok_or(RelayError::Closed),
        }
    }

    async fn close(&self) -> RelayResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.relay.deregister(&self.name, &self.lease_id);
        Ok(())
    }

    fn lease_id(&self) -> &str {
        &self.lease_id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config() -> RelayConfig {
        RelayConfig::from_urls(["ws://memory.invalid"]).unwrap()
    }

    #[tokio::test]
    async fn test_dial_reaches_listener() {
        let relay = MemoryRelay::new();
        let client = relay.connect(&config()).await.unwrap();
        let listener = client
            .listen(Lease::new("ceversi", ["http/1.1"]))
            .await
            .unwrap();

        let mut remote = relay.dial("ceversi").await.unwrap();
        let mut local = listener.accept().await.unwrap();

        remote.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let relay = MemoryRelay::new();
        let client = relay.connect(&config()).await.unwrap();
        let _first = client.listen(Lease::new("dup", ["http/1.1"])).await.unwrap();

        let err = client
            .listen(Lease::new("dup", ["http/1.1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_close_unblocks_accept_and_is_idempotent() {
        let relay = MemoryRelay::new();
        let client = relay.connect(&config()).await.unwrap();
        let listener = Arc::new(client.listen(Lease::new("x", ["http/1.1"])).await.unwrap());

        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::task::yield_now().await;

        listener.close().await.unwrap();
        listener.close().await.unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(RelayError::Closed)));
        assert!(listener.is_closed());
        assert!(!relay.is_registered("x"));
    }

    #[tokio::test]
    async fn test_client_close_releases_leases() {
        let relay = MemoryRelay::new();
        let client = relay.connect(&config()).await.unwrap();
        let listener = client.listen(Lease::new("a", ["http/1.1"])).await.unwrap();
        assert!(relay.is_registered("a"));

        client.close().await.unwrap();
        client.close().await.unwrap();

        assert!(!relay.is_registered("a"));
        assert!(listener.is_closed());
        assert!(matches!(listener.accept().await, Err(RelayError::Closed)));
        assert!(matches!(
            client.listen(Lease::new("b", ["http/1.1"])).await,
            Err(RelayError::Closed)
        ));
        assert!(matches!(
            relay.dial("a").await,
            Err(RelayError::LeaseNotFound(_))
        ));
    }
}
