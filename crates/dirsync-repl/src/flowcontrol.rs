//! Windowed flow control between a replica and its relay.
//!
//! Each side grants the other a number of update messages it may send. The
//! sender spends one credit per update and waits when it has none left; the
//! receiver hands credits back in `Window` messages once it has replayed
//! half of its window.
//!
//! # Architecture
//!
//! 1. **[`SendWindow`]**: credits for outgoing updates, backed by a
//!    semaphore whose permits are consumed rather than returned.
//! 2. **[`ReceiveWindow`]**: counters for incoming updates and the credit
//!    to return.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Outcome of waiting for a send credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// One credit was spent.
    Acquired,
    /// The wait expired. `probe` is true when no credit is left at all and
    /// the relay should be asked for its window.
    TimedOut {
        /// Whether to send a window probe.
        probe: bool,
    },
    /// The window was closed because its session went away.
    Closed,
}

/// Send credits for one session.
///
/// A new session gets a new window; closing the old one wakes every
/// publisher still waiting on it.
#[derive(Debug, Clone)]
pub struct SendWindow {
    permits: Arc<Semaphore>,
    max: u32,
}

impl SendWindow {
    /// Window holding `max` credits.
    pub fn new(max: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max as usize)),
            max,
        }
    }

    /// Window with no credit that is already closed.
    pub fn closed() -> Self {
        let window = Self::new(0);
        window.close();
        window
    }

    /// Spend one credit, waiting at most `wait`.
    pub async fn acquire(&self, wait: Duration) -> Acquire {
        match tokio::time::timeout(wait, self.permits.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Acquire::Acquired
            }
            Ok(Err(_)) => Acquire::Closed,
            Err(_) if self.permits.is_closed() => Acquire::Closed,
            Err(_) => Acquire::TimedOut {
                probe: self.permits.available_permits() == 0,
            },
        }
    }

    /// Return `n` credits granted by the peer.
    pub fn add_credit(&self, n: u32) {
        let room = Semaphore::MAX_PERMITS.saturating_sub(self.permits.available_permits());
        self.permits.add_permits((n as usize).min(room));
    }

    /// Credits left.
    pub fn available(&self) -> u32 {
        u32::try_from(self.permits.available_permits()).unwrap_or(u32::MAX)
    }

    /// Credits the window started with.
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Close the window, failing all current and future waits.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Whether the window was closed.
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Whether both handles refer to the same window.
    pub fn same_window(&self, other: &SendWindow) -> bool {
        Arc::ptr_eq(&self.permits, &other.permits)
    }
}

/// Receive-side accounting.
#[derive(Debug)]
pub struct ReceiveWindow {
    max: AtomicU32,
    current: AtomicU32,
    replayed: AtomicU32,
    credits_sent: AtomicU64,
}

impl ReceiveWindow {
    /// Window of `max` updates.
    pub fn new(max: u32) -> Self {
        Self {
            max: AtomicU32::new(max),
            current: AtomicU32::new(max),
            replayed: AtomicU32::new(0),
            credits_sent: AtomicU64::new(0),
        }
    }

    /// Start over with a full window of `max` updates.
    pub fn reset(&self, max: u32) {
        self.max.store(max, Ordering::SeqCst);
        self.current.store(max, Ordering::SeqCst);
        self.replayed.store(0, Ordering::SeqCst);
    }

    /// Count one received update.
    ///
    /// Returns false if the relay sent it with no credit left; the window
    /// stays at zero.
    pub fn on_update(&self) -> bool {
        self.current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
            .is_ok()
    }

    /// Count one replayed update.
    ///
    /// Returns the credit to send to the relay once half of the window has
    /// been replayed.
    pub fn on_replayed(&self) -> Option<u32> {
        let half = (self.max.load(Ordering::SeqCst) / 2).max(1);
        let count = self.replayed.fetch_add(1, Ordering::SeqCst) + 1;
        if count < half {
            return None;
        }
        self.replayed
            .compare_exchange(count, 0, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.current.fetch_add(count, Ordering::SeqCst);
        self.credits_sent.fetch_add(u64::from(count), Ordering::Relaxed);
        Some(count)
    }

    /// Answer to a window probe: the credit still open, if any.
    pub fn probe_reply(&self) -> Option<u32> {
        let current = self.current();
        (current > 0).then_some(current)
    }

    /// Updates the relay may still send.
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::SeqCst)
    }

    /// Configured window.
    pub fn max(&self) -> u32 {
        self.max.load(Ordering::SeqCst)
    }

    /// Total credit handed back so far.
    pub fn credits_sent(&self) -> u64 {
        self.credits_sent.load(Ordering::Relaxed)
    }
}
