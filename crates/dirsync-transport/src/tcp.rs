//! TCP session implementation

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE};
use crate::session::{Activity, CloseSignal, Connector, Session};

/// TCP session configuration
#[derive(Debug, Clone)]
pub struct TcpSessionConfig {
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
    /// Initial capacity of the per-session read buffer.
    pub read_buffer_bytes: usize,
    /// Upper bound on the write-side shutdown done by `close`.
    pub shutdown_timeout: Duration,
}

impl Default for TcpSessionConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            read_buffer_bytes: 64 * 1024,
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

/// Opens TCP sessions to relays.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpSessionConfig,
}

impl TcpConnector {
    /// Creates a connector with the given configuration.
    pub fn new(config: TcpSessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Arc<dyn Session>> {
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(url))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                    addr: url.to_string(),
                },
                _ => TransportError::IoError(e),
            })?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr = url, "TCP session connected");
        Ok(Arc::new(TcpSession::from_stream(stream, &self.config)))
    }
}

/// Accepts inbound TCP sessions.
#[derive(Debug)]
pub struct TcpSessionListener {
    inner: tokio::net::TcpListener,
    config: TcpSessionConfig,
}

impl TcpSessionListener {
    /// Binds to the specified address.
    pub async fn bind(addr: &str, config: TcpSessionConfig) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self { inner, config })
    }

    /// Accepts the next inbound session.
    pub async fn accept(&self) -> Result<Arc<TcpSession>> {
        let (stream, _) = self.inner.accept().await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(Arc::new(TcpSession::from_stream(stream, &self.config)))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}

struct ReadState {
    half: OwnedReadHalf,
    buf: BytesMut,
}

/// A single TCP session with concurrent read/write support
pub struct TcpSession {
    read: Mutex<ReadState>,
    write: Mutex<OwnedWriteHalf>,
    peer_addr: String,
    local_addr: String,
    activity: Activity,
    close: CloseSignal,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSession")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.close.is_closed())
            .finish()
    }
}

impl TcpSession {
    fn from_stream(stream: tokio::net::TcpStream, config: &TcpSessionConfig) -> Self {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read, write) = stream.into_split();
        let activity = Activity::new();
        activity.received();
        Self {
            read: Mutex::new(ReadState {
                half: read,
                buf: BytesMut::with_capacity(config.read_buffer_bytes),
            }),
            write: Mutex::new(write),
            peer_addr,
            local_addr,
            activity,
            close: CloseSignal::default(),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    // Reads into a buffer kept across calls, so a receive cancelled by its
    // timeout never loses part of a frame.
    async fn read_frame(&self) -> Result<Frame> {
        let mut state = self.read.lock().await;
        let ReadState { half, buf } = &mut *state;
        loop {
            if let Some(frame) = take_frame(buf)? {
                return Ok(frame);
            }
            let n = half.read_buf(buf).await?;
            if n == 0 {
                return Err(TransportError::ConnectionReset);
            }
        }
    }
}

fn take_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let header = FrameHeader::decode(&buf[..FRAME_HEADER_SIZE])?;
    let total = FRAME_HEADER_SIZE + header.payload_length as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    let bytes = buf.split_to(total);
    Frame::decode(&bytes).map(Some)
}

#[async_trait]
impl Session for TcpSession {
    async fn publish(&self, frame: &Frame) -> Result<()> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        let encoded = frame.encode();
        // A peer that stopped reading leaves the write parked; close wakes it.
        let write = async {
            let mut write = self.write.lock().await;
            write.write_all(&encoded).await?;
            write.flush().await?;
            Ok::<(), TransportError>(())
        };
        tokio::select! {
            _ = self.close.closed() => return Err(TransportError::Closed),
            res = write => res?,
        }
        self.activity.published();
        Ok(())
    }

    async fn receive(&self, timeout: Option<Duration>) -> Result<Frame> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        let read = async {
            match timeout {
                Some(t) => tokio::time::timeout(t, self.read_frame())
                    .await
                    .map_err(|_| TransportError::ReceiveTimeout {
                        timeout_ms: t.as_millis() as u64,
                    })?,
                None => self.read_frame().await,
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
            let shutdown = async { self.write.lock().await.shutdown().await };
            match tokio::time::timeout(self.shutdown_timeout, shutdown).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(peer = %self.peer_addr, error = %e, "TCP shutdown failed")
                }
                Err(_) => tracing::debug!(peer = %self.peer_addr, "TCP shutdown timed out"),
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    fn remote_addr(&self) -> &str {
        &self.peer_addr
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

#[cfg(test)]
mod tests {
    use super::*;

    async fn listener() -> (TcpSessionListener, String) {
        let listener = TcpSessionListener::bind("127.0.0.1:0", TcpSessionConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_publish_receive_frame() {
        let (listener, addr) = listener().await;

        let server = tokio::spawn(async move {
            let session = listener.accept().await.unwrap();
            let frame = session.receive(None).await.unwrap();
            assert_eq!(frame.tag(), 0x30);
            session.publish(&Frame::new(0x31, b"pong".to_vec())).await.unwrap();
        });

        let connector = TcpConnector::default();
        let session = connector
            .connect(&addr, Duration::from_secs(5))
            .await
            .unwrap();
        session.publish(&Frame::new(0x30, b"ping".to_vec())).await.unwrap();
        let response = session.receive(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(response.tag(), 0x31);
        assert_eq!(response.payload, b"pong");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_timeout_keeps_session_usable() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move {
            let session = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            session.publish(&Frame::new(1, vec![7; 32])).await.unwrap();
            session
        });

        let session = TcpConnector::default()
            .connect(&addr, Duration::from_secs(5))
            .await
            .unwrap();
        let err = session
            .receive(Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        let frame = session.receive(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(frame.payload, vec![7; 32]);
        let _server_session = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_receiver() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let session = TcpConnector::default()
            .connect(&addr, Duration::from_secs(5))
            .await
            .unwrap();
        let _server_session = server.await.unwrap();

        let reader = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.receive(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close().await;
        assert!(matches!(reader.await.unwrap(), Err(TransportError::Closed)));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_close_unblocks_publisher_when_peer_stops_reading() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });
        let session = TcpConnector::default()
            .connect(&addr, Duration::from_secs(5))
            .await
            .unwrap();
        // Held open but never read, so the socket buffers fill up.
        let _server_session = server.await.unwrap();

        let publisher = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let frame = Frame::new(3, vec![0; 1024 * 1024]);
                loop {
                    if let Err(e) = session.publish(&frame).await {
                        return e;
                    }
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!publisher.is_finished());

        tokio::time::timeout(Duration::from_secs(5), session.close())
            .await
            .expect("close blocked by a stuck publisher");
        let err = tokio::time::timeout(Duration::from_secs(5), publisher)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_peer_close_is_reset() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move {
            let session = listener.accept().await.unwrap();
            session.close().await;
        });
        let session = TcpConnector::default()
            .connect(&addr, Duration::from_secs(5))
            .await
            .unwrap();
        server.await.unwrap();
        assert!(matches!(
            session.receive(Some(Duration::from_secs(5))).await,
            Err(TransportError::ConnectionReset)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, addr) = listener().await;
        drop(listener);
        let result = TcpConnector::default()
            .connect(&addr, Duration::from_secs(5))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_take_frame_partial() {
        let encoded = Frame::new(2, b"abcdef".to_vec()).encode();
        let mut buf = BytesMut::from(&encoded[..FRAME_HEADER_SIZE + 2]);
        assert!(take_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[FRAME_HEADER_SIZE + 2..]);
        let frame = take_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, b"abcdef");
        assert!(buf.is_empty());
    }
}
