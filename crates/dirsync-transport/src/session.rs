//! Abstract session layer between a replica and a relay.
//!
//! A session is one bidirectional framed channel. The replication core only
//! needs publish, receive (with an optional timeout), close and liveness
//! timestamps; TCP and in-process channels both implement it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::Result;
use crate::protocol::Frame;

/// An established session for sending and receiving frames.
///
/// `publish` may be called from several tasks at once. `receive` is meant
/// for a single reader.
#[async_trait]
pub trait Session: Send + Sync {
    /// Send a frame to the peer.
    async fn publish(&self, frame: &Frame) -> Result<()>;

    /// Receive the next frame.
    ///
    /// With a timeout, an elapsed wait returns
    /// [`TransportError::ReceiveTimeout`](crate::TransportError::ReceiveTimeout)
    /// and leaves the session usable.
    async fn receive(&self, timeout: Option<Duration>) -> Result<Frame>;

    /// Close the session. Pending and later receives fail with `Closed`.
    async fn close(&self);

    /// True once `close` was called on this side.
    fn is_closed(&self) -> bool;

    /// Address of the peer.
    fn remote_addr(&self) -> &str;

    /// Local address.
    fn local_addr(&self) -> &str;

    /// Time since a frame was last received.
    fn last_receive_elapsed(&self) -> Duration;

    /// Time since a frame was last published.
    fn last_publish_elapsed(&self) -> Duration;

    /// Whether the channel is encrypted.
    fn is_encrypted(&self) -> bool {
        false
    }
}

/// Opens sessions to relays by URL (`host:port`).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `url`, giving up after `timeout`.
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Arc<dyn Session>>;
}

/// Last-activity timestamps shared by session implementations.
#[derive(Debug)]
pub(crate) struct Activity {
    origin: Instant,
    last_receive_ms: AtomicU64,
    last_publish_ms: AtomicU64,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_receive_ms: AtomicU64::new(0),
            last_publish_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub(crate) fn received(&self) {
        self.last_receive_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn published(&self) {
        self.last_publish_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn since_receive(&self) -> Duration {
        let last = self.last_receive_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    pub(crate) fn since_publish(&self) -> Duration {
        let last = self.last_publish_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }
}

/// Local close flag that also wakes a pending receive.
#[derive(Debug, Default)]
pub(crate) struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub(crate) fn close(&self) -> bool {
        let was_closed = self.closed.swap(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        !was_closed
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once `close` has been called.
    pub(crate) async fn closed(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_signal_wakes_waiter() {
        let signal = Arc::new(CloseSignal::default());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.closed().await })
        };
        tokio::task::yield_now().await;
        assert!(signal.close());
        assert!(!signal.close());
        waiter.await.unwrap();
        assert!(signal.is_closed());
    }

    #[test]
    fn test_activity_starts_fresh() {
        let activity = Activity::new();
        activity.received();
        activity.published();
        assert!(activity.since_receive() < Duration::from_secs(1));
        assert!(activity.since_publish() < Duration::from_secs(1));
    }
}
