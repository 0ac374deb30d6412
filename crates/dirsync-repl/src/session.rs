//! Replication messages over a transport session.

use crate::error::ReplError;
use crate::protocol::ReplicationMsg;
use dirsync_transport::Session;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// A transport session that speaks [`ReplicationMsg`].
///
/// Cloning the inner `Arc` is cheap; the broker hands the same session to
/// its heartbeat tasks and compares sessions by pointer to detect that a
/// reconnection happened in between.
#[derive(Clone)]
pub struct ReplSession {
    inner: Arc<dyn Session>,
}

impl std::fmt::Debug for ReplSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplSession")
            .field("remote", &self.inner.remote_addr())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl ReplSession {
    /// Wrap a connected transport session.
    pub fn new(inner: Arc<dyn Session>) -> Self {
        Self { inner }
    }

    /// Encode and send one message.
    pub async fn publish(&self, msg: &ReplicationMsg) -> Result<(), ReplError> {
        let frame = msg.to_frame()?;
        trace!(remote = %self.inner.remote_addr(), kind = ?msg.message_type(), "publish");
        self.inner.publish(&frame).await?;
        Ok(())
    }

    /// Receive and decode one message.
    ///
    /// A timeout surfaces as `ReplError::Transport` with a timeout cause.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<ReplicationMsg, ReplError> {
        let frame = self.inner.receive(timeout).await?;
        ReplicationMsg::from_frame(&frame)
    }

    /// Close the session; pending receives fail.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// True once closed locally.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Address of the relay.
    pub fn remote_addr(&self) -> &str {
        self.inner.remote_addr()
    }

    /// Time since the last inbound frame.
    pub fn last_receive_elapsed(&self) -> Duration {
        self.inner.last_receive_elapsed()
    }

    /// Time since the last outbound frame.
    pub fn last_publish_elapsed(&self) -> Duration {
        self.inner.last_publish_elapsed()
    }

    /// Whether both handles wrap the same transport session.
    pub fn same_session(&self, other: &ReplSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// True if `err` is a receive timeout rather than a session failure.
pub fn is_timeout(err: &ReplError) -> bool {
    matches!(err, ReplError::Transport(t) if t.is_timeout())
}
