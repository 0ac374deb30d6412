//! Session liveness.
//!
//! Two tasks run per session. The heartbeat monitor keeps the relay from
//! timing the replica out and closes the session when the relay goes quiet
//! for too long. The change-time publisher tells the relay how far the
//! replica's clock has moved even when it has nothing to replicate.

use crate::cancel::CancelToken;
use crate::clock::{system_time_ms, LogicalClock};
use crate::protocol::ReplicationMsg;
use crate::session::ReplSession;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Missed heartbeat intervals after which a silent relay is given up.
const DEAD_AFTER_INTERVALS: u32 = 2;

/// Counters shared by every session's heartbeat tasks.
#[derive(Debug, Default)]
pub struct HeartbeatCounters {
    heartbeats_sent: AtomicU64,
    change_time_sent: AtomicU64,
    silent_sessions: AtomicU64,
}

impl HeartbeatCounters {
    /// Heartbeats published.
    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    /// Change-time heartbeats published.
    pub fn change_time_sent(&self) -> u64 {
        self.change_time_sent.load(Ordering::Relaxed)
    }

    /// Sessions closed because the relay stopped talking.
    pub fn silent_sessions(&self) -> u64 {
        self.silent_sessions.load(Ordering::Relaxed)
    }
}

/// What to run for one session.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSettings {
    /// Local replica id, stamped into change-time heartbeats.
    pub server_id: u32,
    /// Heartbeat interval; `None` disables the monitor.
    pub interval: Option<Duration>,
    /// Change-time heartbeat interval; `None` disables the publisher.
    pub change_time_interval: Option<Duration>,
}

/// Heartbeat tasks bound to one session.
#[derive(Debug)]
pub struct HeartbeatTasks {
    cancel: CancelToken,
    handles: Vec<JoinHandle<()>>,
}

impl HeartbeatTasks {
    /// Spawn the tasks enabled in `settings`. They end when `parent` is
    /// cancelled, when [`stop`](Self::stop) is called or when the session
    /// fails.
    pub fn start(
        session: &ReplSession,
        settings: HeartbeatSettings,
        parent: &CancelToken,
        counters: Arc<HeartbeatCounters>,
    ) -> Self {
        let cancel = parent.child();
        let mut handles = Vec::new();
        if let Some(interval) = settings.interval.filter(|d| !d.is_zero()) {
            handles.push(tokio::spawn(monitor_session(
                session.clone(),
                interval,
                cancel.clone(),
                counters.clone(),
            )));
        }
        if let Some(interval) = settings.change_time_interval.filter(|d| !d.is_zero()) {
            handles.push(tokio::spawn(publish_change_time(
                session.clone(),
                settings.server_id,
                interval,
                cancel.clone(),
                counters,
            )));
        }
        Self { cancel, handles }
    }

    /// Number of running tasks.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True if no task was started.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel the tasks and wait for them to finish.
    ///
    /// A task stuck in a publish on a congested session is aborted.
    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn monitor_session(
    session: ReplSession,
    interval: Duration,
    cancel: CancelToken,
    counters: Arc<HeartbeatCounters>,
) {
    let tick = (interval / 2).max(Duration::from_millis(1));
    let dead_after = interval * DEAD_AFTER_INTERVALS;
    loop {
        if !cancel.sleep(tick).await || session.is_closed() {
            return;
        }
        let silent = session.last_receive_elapsed();
        if silent > dead_after {
            warn!(
                relay = %session.remote_addr(),
                silent_ms = silent.as_millis() as u64,
                "no heartbeat from replication server, closing session"
            );
            counters.silent_sessions.fetch_add(1, Ordering::Relaxed);
            session.close().await;
            return;
        }
        if session.last_publish_elapsed() >= interval {
            if let Err(e) = session.publish(&ReplicationMsg::Heartbeat).await {
                debug!(relay = %session.remote_addr(), error = %e, "heartbeat publish failed");
                return;
            }
            counters.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn publish_change_time(
    session: ReplSession,
    server_id: u32,
    interval: Duration,
    cancel: CancelToken,
    counters: Arc<HeartbeatCounters>,
) {
    while cancel.sleep(interval).await && !session.is_closed() {
        let clock = LogicalClock::new(system_time_ms(), 0, server_id);
        if let Err(e) = session
            .publish(&ReplicationMsg::ChangeTimeHeartbeat(clock))
            .await
        {
            debug!(relay = %session.remote_addr(), error = %e, "change-time heartbeat failed");
            return;
        }
        counters.change_time_sent.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_transport::MemorySession;

    fn pair() -> (ReplSession, ReplSession) {
        let (a, b) = MemorySession::pair("replica", "relay", 64);
        (ReplSession::new(a), ReplSession::new(b))
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_gets_heartbeats() {
        let (replica, relay) = pair();
        let counters = Arc::new(HeartbeatCounters::default());
        let settings = HeartbeatSettings {
            server_id: 1,
            interval: Some(Duration::from_millis(100)),
            change_time_interval: None,
        };
        let tasks = HeartbeatTasks::start(&replica, settings, &CancelToken::new(), counters.clone());
        assert_eq!(tasks.len(), 1);

        let msg = relay.receive(Some(Duration::from_millis(150))).await.unwrap();
        assert_eq!(msg, ReplicationMsg::Heartbeat);
        tasks.stop().await;
        assert!(counters.heartbeats_sent() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_relay_closes_session() {
        let (replica, _relay) = pair();
        let counters = Arc::new(HeartbeatCounters::default());
        let settings = HeartbeatSettings {
            server_id: 1,
            interval: Some(Duration::from_millis(100)),
            change_time_interval: None,
        };
        let _tasks = HeartbeatTasks::start(&replica, settings, &CancelToken::new(), counters.clone());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(replica.is_closed());
        assert_eq!(counters.silent_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_time_heartbeat_carries_local_id() {
        let (replica, relay) = pair();
        let counters = Arc::new(HeartbeatCounters::default());
        let settings = HeartbeatSettings {
            server_id: 42,
            interval: None,
            change_time_interval: Some(Duration::from_millis(50)),
        };
        let tasks = HeartbeatTasks::start(&replica, settings, &CancelToken::new(), counters.clone());
        match relay.receive(Some(Duration::from_millis(100))).await.unwrap() {
            ReplicationMsg::ChangeTimeHeartbeat(clock) => {
                assert_eq!(clock.replica_id(), 42);
                assert_eq!(clock.seq(), 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        tasks.stop().await;
        assert!(counters.change_time_sent() >= 1);
    }

    #[tokio::test]
    async fn test_disabled_settings_start_nothing() {
        let (replica, _relay) = pair();
        let settings = HeartbeatSettings {
            server_id: 1,
            interval: Some(Duration::ZERO),
            change_time_interval: None,
        };
        let tasks = HeartbeatTasks::start(
            &replica,
            settings,
            &CancelToken::new(),
            Arc::new(HeartbeatCounters::default()),
        );
        assert!(tasks.is_empty());
        tasks.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancel_ends_tasks() {
        let (replica, _relay) = pair();
        let parent = CancelToken::new();
        let settings = HeartbeatSettings {
            server_id: 1,
            interval: Some(Duration::from_secs(10)),
            change_time_interval: Some(Duration::from_secs(1)),
        };
        let tasks = HeartbeatTasks::start(
            &replica,
            settings,
            &parent,
            Arc::new(HeartbeatCounters::default()),
        );
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), tasks.stop())
            .await
            .unwrap();
    }
}
