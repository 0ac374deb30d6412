//! In-process sessions over tokio channels.
//!
//! Used by tests and by embedded deployments where the relay runs in the
//! same process. A [`MemoryNetwork`] maps URLs to listeners and implements
//! [`Connector`], so code written against sessions runs unchanged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Result, TransportError};
use crate::protocol::Frame;
use crate::session::{Activity, CloseSignal, Connector, Session};

/// Frames buffered per direction before `publish` waits.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// One end of an in-process session.
pub struct MemorySession {
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    rx: Mutex<mpsc::Receiver<Frame>>,
    local_addr: String,
    remote_addr: String,
    activity: Activity,
    close: CloseSignal,
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.close.is_closed())
            .finish()
    }
}

impl MemorySession {
    /// Create a connected pair of sessions. Returns (a, b).
    pub fn pair(a_addr: &str, b_addr: &str, capacity: usize) -> (Arc<Self>, Arc<Self>) {
        let (tx_ab, rx_ab) = mpsc::channel(capacity);
        let (tx_ba, rx_ba) = mpsc::channel(capacity);
        let a = Self::new(tx_ab, rx_ba, a_addr, b_addr);
        let b = Self::new(tx_ba, rx_ab, b_addr, a_addr);
        (Arc::new(a), Arc::new(b))
    }

    fn new(
        tx: mpsc::Sender<Frame>,
        rx: mpsc::Receiver<Frame>,
        local_addr: &str,
        remote_addr: &str,
    ) -> Self {
        let activity = Activity::new();
        activity.received();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            local_addr: local_addr.to_string(),
            remote_addr: remote_addr.to_string(),
            activity,
            close: CloseSignal::default(),
        }
    }

    async fn next_frame(&self) -> Result<Frame> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionReset)
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn publish(&self, frame: &Frame) -> Result<()> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        let tx = self.tx.lock().await.clone();
        match tx {
            Some(tx) => {
                tx.send(frame.clone())
                    .await
                    .map_err(|_| TransportError::ConnectionReset)?;
                self.activity.published();
                Ok(())
            }
            None => Err(TransportError::Closed),
        }
    }

    async fn receive(&self, timeout: Option<Duration>) -> Result<Frame> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        let read = async {
            match timeout {
                Some(t) => tokio::time::timeout(t, self.next_frame())
                    .await
                    .map_err(|_| TransportError::ReceiveTimeout {
                        timeout_ms: t.as_millis() as u64,
                    })?,
                None => self.next_frame().await,
            }
        };
        let frame = tokio::select! {
            _ = self.close.closed() => return Err(TransportError::Closed),
            res = read => res?,
        };
        self.activity.received();
        Ok(frame)
    }

    async fn close(&self) {
        if self.close.close() {
            self.tx.lock().await.take();
            self.rx.lock().await.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    fn local_addr(&self) -> &str {
        &self.local_addr
    }

    fn last_receive_elapsed(&self) -> Duration {
        self.activity.since_receive()
    }

    fn last_publish_elapsed(&self) -> Duration {
        self.activity.since_publish()
    }
}

/// Receives the server ends of sessions opened to one URL.
#[derive(Debug)]
pub struct MemoryListener {
    url: String,
    rx: mpsc::UnboundedReceiver<Arc<MemorySession>>,
}

impl MemoryListener {
    /// Waits for the next inbound session. `None` once the URL was unbound.
    pub async fn accept(&mut self) -> Option<Arc<MemorySession>> {
        self.rx.recv().await
    }

    /// The URL this listener serves.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Registry of in-process listeners keyed by URL.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<Arc<MemorySession>>>>>,
    connections: Arc<std::sync::atomic::AtomicU64>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts serving `url`, replacing any previous listener.
    pub fn listen(&self, url: &str) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(url.to_string(), tx);
        }
        MemoryListener {
            url: url.to_string(),
            rx,
        }
    }

    /// Stops serving `url`. Later connects are refused.
    pub fn unbind(&self, url: &str) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(url);
        }
    }

    /// Number of sessions handed to listeners so far.
    pub fn connection_count(&self) -> u64 {
        self.connections.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, url: &str, _timeout: Duration) -> Result<Arc<dyn Session>> {
        let acceptor = self
            .listeners
            .lock()
            .ok()
            .and_then(|listeners| listeners.get(url).cloned())
            .ok_or_else(|| TransportError::ConnectionRefused {
                addr: url.to_string(),
            })?;
        let id = self
            .connections
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let client_addr = format!("memory-client-{}", id);
        let (client, server) = MemorySession::pair(&client_addr, url, DEFAULT_CHANNEL_CAPACITY);
        acceptor
            .send(server)
            .map_err(|_| TransportError::ConnectionRefused {
                addr: url.to_string(),
            })?;
        tracing::debug!(addr = url, "memory session connected");
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_exchange() {
        let (a, b) = MemorySession::pair("a", "b", 8);
        a.publish(&Frame::new(1, b"hello".to_vec())).await.unwrap();
        let frame = b.receive(None).await.unwrap();
        assert_eq!(frame.payload, b"hello");
        assert_eq!(b.remote_addr(), "a");
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let (a, _b) = MemorySession::pair("a", "b", 8);
        let err = a.receive(Some(Duration::from_millis(5))).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_close_resets_peer() {
        let (a, b) = MemorySession::pair("a", "b", 8);
        a.close().await;
        assert!(a.is_closed());
        assert!(matches!(
            b.receive(Some(Duration::from_secs(1))).await,
            Err(TransportError::ConnectionReset)
        ));
        assert!(b.publish(&Frame::new(1, vec![])).await.is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_local_receiver() {
        let (a, _b) = MemorySession::pair("a", "b", 8);
        let reader = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.receive(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.close().await;
        assert!(matches!(reader.await.unwrap(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_network_connect_and_refuse() {
        let network = MemoryNetwork::new();
        let mut listener = network.listen("relay-1:8989");

        let client = network
            .connect("relay-1:8989", Duration::from_secs(1))
            .await
            .unwrap();
        let server = listener.accept().await.unwrap();
        client.publish(&Frame::new(9, vec![1])).await.unwrap();
        assert_eq!(server.receive(None).await.unwrap().tag(), 9);
        assert_eq!(network.connection_count(), 1);

        network.unbind("relay-1:8989");
        assert!(matches!(
            network.connect("relay-1:8989", Duration::from_secs(1)).await,
            Err(TransportError::ConnectionRefused { .. })
        ));
    }
}
