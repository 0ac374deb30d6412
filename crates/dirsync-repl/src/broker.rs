//! Replication broker: the replica end of a relay session.
//!
//! The broker finds a relay, runs the two-phase handshake, keeps the session
//! alive and reconnects when it fails. Publishers share the session; a single
//! reader drives [`ReplicationBroker::receive`], which handles control
//! messages in place and hands data messages back to the caller.
//!
//! # Locking
//!
//! `connect_phase` serializes connection attempts and session swaps and owns
//! the heartbeat tasks of the current session. `start_stop` serializes
//! restarts against `stop`. `link` is a plain lock holding the current
//! session and its send window; it is never held across an await, so
//! publishers and monitoring getters read it without waiting on a
//! handshake in progress.

use crate::cancel::CancelToken;
use crate::clock::{system_time_ms, LogicalClock};
use crate::config::BrokerConfig;
use crate::election::{
    compute_best_replication_server, compute_initial_server_status, HostLocality, LocalReplica,
};
use crate::error::{BrokerError, ReplError};
use crate::flowcontrol::{Acquire, ReceiveWindow, SendWindow};
use crate::heartbeat::{HeartbeatCounters, HeartbeatSettings, HeartbeatTasks};
use crate::protocol::{
    ChangeStatusMsg, DsInfo, MonitorRequestMsg, ReplicationMsg, ServerStartMsg, ServerStatus,
    StartSessionMsg, TopologyMsg, WindowMsg, CHANGE_TIME_HEARTBEAT_MIN_VERSION, NO_GENERATION_ID,
    PROTOCOL_VERSION,
};
use crate::session::{is_timeout, ReplSession};
use crate::state::ServerState;
use crate::topology::{ReplicationServerInfo, Topology};
use dirsync_transport::{Connector, TransportError};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// Monitor replies between two best-relay elections.
const MONITORS_PER_ELECTION: u32 = 2;

/// Reply shown by [`ReplicationBroker::replication_server`] without a session.
pub const NOT_CONNECTED: &str = "Not connected";

/// Handshake inputs the broker pulls from the replicated domain.
pub trait DomainState: Send + Sync {
    /// Generation id of the local data.
    fn generation_id(&self) -> i64;

    /// Latest clock seen per replica.
    fn server_state(&self) -> ServerState;
}

/// Where the broker is in its connection life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// No session.
    Disconnected,
    /// Looking for a relay.
    Connecting,
    /// Exchanging start messages.
    HandshakePhase1,
    /// Exchanging session start and topology.
    HandshakePhase2,
    /// Session established.
    Connected,
    /// Stopped for good.
    Shutdown,
}

/// Session changes, observed through [`ReplicationBroker::subscribe_sessions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// No session.
    Disconnected,
    /// A session was established.
    Connected {
        /// Relay id.
        relay_id: u32,
        /// Relay URL.
        relay_url: String,
        /// Generation id of the relay.
        generation_id: i64,
        /// Status the session started with.
        status: ServerStatus,
        /// Whether the relay misses local changes that must be resent first.
        recovery_required: bool,
    },
}

/// How [`ReplicationBroker::receive`] reacts to session events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Move to a better relay when the periodic election says so.
    pub reconnect_to_best_relay: bool,
    /// Reconnect instead of returning when the session fails.
    pub reconnect_on_failure: bool,
    /// Return topology messages to the caller.
    pub return_on_topology_change: bool,
}

impl ReceiveOptions {
    /// Options taken from the broker configuration.
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            reconnect_to_best_relay: config.reconnect_to_best_relay,
            reconnect_on_failure: config.reconnect_on_failure,
            return_on_topology_change: false,
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Updates published.
    pub updates_sent: u64,
    /// Updates received.
    pub updates_received: u64,
    /// Window probes published.
    pub window_probes_sent: u64,
    /// Window credit handed back to relays.
    pub window_credits_sent: u64,
    /// Heartbeats published.
    pub heartbeats_sent: u64,
    /// Change-time heartbeats published.
    pub change_time_heartbeats_sent: u64,
    /// Sessions established after the first.
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct Counters {
    updates_sent: AtomicU64,
    updates_received: AtomicU64,
    window_probes_sent: AtomicU64,
    sessions_opened: AtomicU64,
}

struct Link {
    session: Option<ReplSession>,
    send_window: SendWindow,
    relay: Option<ReplicationServerInfo>,
    status: ServerStatus,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            session: None,
            send_window: SendWindow::closed(),
            relay: None,
            status: ServerStatus::NotConnected,
        }
    }
}

/// Result of a phase-1 exchange with one relay.
struct Phase1 {
    session: ReplSession,
    info: ReplicationServerInfo,
    degraded_threshold: u32,
}

/// The replica side of replication for one base DN.
pub struct ReplicationBroker {
    config: RwLock<BrokerConfig>,
    connector: Arc<dyn Connector>,
    domain: Arc<dyn DomainState>,
    connect_phase: Mutex<Option<HeartbeatTasks>>,
    start_stop: Mutex<()>,
    link: RwLock<Link>,
    state: StdMutex<BrokerState>,
    topology: RwLock<Arc<Topology>>,
    rcv_window: ReceiveWindow,
    connected: AtomicBool,
    connection_error: AtomicBool,
    failure_streak: AtomicBool,
    recovery_required: AtomicBool,
    lost_connections: AtomicU64,
    best_server_counter: AtomicU32,
    shutdown: CancelToken,
    replica_states: StdMutex<BTreeMap<u32, ServerState>>,
    monitor_received: Notify,
    counters: Counters,
    heartbeat_counters: Arc<HeartbeatCounters>,
    events: watch::Sender<SessionEvent>,
}

impl std::fmt::Debug for ReplicationBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationBroker")
            .field("state", &self.state())
            .field("relay", &self.replication_server())
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn session_error(err: ReplError) -> BrokerError {
    match err {
        ReplError::Transport(e) => BrokerError::Transport(e),
        other => BrokerError::Transport(TransportError::InvalidFrame {
            reason: other.to_string(),
        }),
    }
}

/// Base DNs compare case-insensitively and ignore spaces around separators.
fn same_base_dn(a: &str, b: &str) -> bool {
    fn normalize(dn: &str) -> String {
        dn.split(',')
            .map(|rdn| {
                rdn.split('=')
                    .map(|part| part.trim().to_ascii_lowercase())
                    .collect::<Vec<_>>()
                    .join("=")
            })
            .collect::<Vec<_>>()
            .join(",")
    }
    normalize(a) == normalize(b)
}

fn own_clock(state: &ServerState, server_id: u32) -> LogicalClock {
    state
        .max_clock(server_id)
        .unwrap_or(LogicalClock::zero(server_id))
}

impl ReplicationBroker {
    /// Broker for `config`, reaching relays through `connector`.
    ///
    /// Nothing happens until [`start`](Self::start) or the first
    /// [`receive`](Self::receive).
    pub fn new(
        config: BrokerConfig,
        connector: Arc<dyn Connector>,
        domain: Arc<dyn DomainState>,
    ) -> Self {
        let rcv_window = ReceiveWindow::new(config.window_size);
        let (events, _) = watch::channel(SessionEvent::Disconnected);
        Self {
            config: RwLock::new(config),
            connector,
            domain,
            connect_phase: Mutex::new(None),
            start_stop: Mutex::new(()),
            link: RwLock::new(Link::default()),
            state: StdMutex::new(BrokerState::Disconnected),
            topology: RwLock::new(Arc::new(Topology::default())),
            rcv_window,
            connected: AtomicBool::new(false),
            connection_error: AtomicBool::new(false),
            failure_streak: AtomicBool::new(false),
            recovery_required: AtomicBool::new(false),
            lost_connections: AtomicU64::new(0),
            best_server_counter: AtomicU32::new(0),
            shutdown: CancelToken::new(),
            replica_states: StdMutex::new(BTreeMap::new()),
            monitor_received: Notify::new(),
            counters: Counters::default(),
            heartbeat_counters: Arc::new(HeartbeatCounters::default()),
            events,
        }
    }

    /// Current configuration.
    pub fn config(&self) -> BrokerConfig {
        read(&self.config).clone()
    }

    /// Connect, retrying until a session is up or the broker is stopped.
    pub async fn start(&self) {
        self.restart(None, true).await;
    }

    fn set_state(&self, state: BrokerState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != BrokerState::Shutdown {
            *current = state;
        }
    }

    /// Life-cycle state.
    pub fn state(&self) -> BrokerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn until_shutdown<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            out = fut => Some(out),
        }
    }

    // Warn on the first failure of a streak, stay quiet for the rest.
    fn report_failure(&self, config: &BrokerConfig, reason: &str) {
        self.connection_error.store(true, Ordering::SeqCst);
        if self.failure_streak.swap(true, Ordering::SeqCst) {
            debug!(server_id = config.server_id, base_dn = %config.base_dn, "{}", reason);
        } else {
            warn!(server_id = config.server_id, base_dn = %config.base_dn, "{}", reason);
        }
    }

    fn report_unreachable(&self, config: &BrokerConfig, url: &str, err: &ReplError) {
        if self.failure_streak.load(Ordering::SeqCst) {
            debug!(server_id = config.server_id, url, error = %err, "replication server unreachable");
        } else {
            warn!(server_id = config.server_id, url, error = %err, "replication server unreachable");
        }
    }

    /// One connection attempt over every configured relay.
    async fn connect(&self) {
        let mut heartbeats = self.connect_phase.lock().await;
        if self.connected.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return;
        }
        let config = self.config();
        self.set_state(BrokerState::Connecting);
        if config.relay_urls.is_empty() {
            self.report_failure(&config, "no relays configured");
            self.set_state(BrokerState::Disconnected);
            return;
        }

        let local_state = self.domain.server_state();
        let generation_id = self.domain.generation_id();

        self.set_state(BrokerState::HandshakePhase1);
        let mut found = Vec::new();
        for url in &config.relay_urls {
            let attempt = self.phase1(&config, url, &local_state, generation_id);
            match self.until_shutdown(attempt).await {
                None => return,
                Some(Ok(reply)) => {
                    reply.session.close().await;
                    found.push(reply.info);
                }
                Some(Err(e)) => self.report_unreachable(&config, url, &e),
            }
        }
        if found.is_empty() {
            self.report_failure(&config, "could not find a relay for base DN");
            self.set_state(BrokerState::Disconnected);
            return;
        }

        let candidates = Topology::from_relays(found);
        let locality = HostLocality::new(config.local_hosts.clone(), config.in_process_ports.clone());
        let local = LocalReplica {
            server_id: config.server_id,
            group_id: config.group_id,
            generation_id,
            state: &local_state,
            locality: &locality,
        };
        let best = compute_best_replication_server(true, None, &local, candidates.relays())
            .map(|relay| relay.server_url.clone());
        let Some(best_url) = best else {
            self.report_failure(&config, "could not find a relay for base DN");
            self.set_state(BrokerState::Disconnected);
            return;
        };

        let attempt = self.phase1(&config, &best_url, &local_state, generation_id);
        let phase1 = match self.until_shutdown(attempt).await {
            None => return,
            Some(Ok(reply)) => reply,
            Some(Err(e)) => {
                self.report_unreachable(&config, &best_url, &e);
                self.report_failure(&config, "could not find a relay for base DN");
                self.set_state(BrokerState::Disconnected);
                return;
            }
        };

        self.set_state(BrokerState::HandshakePhase2);
        let status = compute_initial_server_status(
            phase1.info.generation_id,
            &phase1.info.server_state,
            phase1.degraded_threshold,
            generation_id,
            &local_state,
        );
        let topology = match self
            .until_shutdown(self.phase2(&config, &phase1.session, status))
            .await
        {
            Some(Ok(topology)) => topology,
            Some(Err(e)) => {
                warn!(
                    server_id = config.server_id,
                    relay = %best_url,
                    error = %e,
                    "session start with replication server failed"
                );
                phase1.session.close().await;
                self.report_failure(&config, "could not find a relay for base DN");
                self.set_state(BrokerState::Disconnected);
                return;
            }
            None => {
                phase1.session.close().await;
                return;
            }
        };

        let candidates = Topology::from_relays(candidates.relays().values().map(|relay| {
            if relay.relay_id == phase1.info.relay_id {
                phase1.info.clone()
            } else {
                relay.clone()
            }
        }));
        if let Some(old) = heartbeats.take() {
            old.stop().await;
        }
        *heartbeats = Some(self.install_session(
            &config,
            phase1,
            status,
            &topology,
            &candidates,
            &local_state,
            generation_id,
        ));
    }

    async fn phase1(
        &self,
        config: &BrokerConfig,
        url: &str,
        local_state: &ServerState,
        generation_id: i64,
    ) -> Result<Phase1, ReplError> {
        let timeout = config.connect_timeout();
        let session = ReplSession::new(self.connector.connect(url, timeout).await?);
        let start = ServerStartMsg {
            server_id: config.server_id,
            base_dn: config.base_dn.clone(),
            server_url: config.local_url.clone(),
            window_size: config.window_size,
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            server_state: local_state.clone(),
            generation_id,
            group_id: config.group_id,
            protocol_version: PROTOCOL_VERSION,
            ssl_encryption: false,
        };
        let exchange = async {
            session.publish(&ReplicationMsg::ServerStart(start)).await?;
            match session.receive(Some(timeout)).await? {
                ReplicationMsg::ReplServerStart(reply) => {
                    if !same_base_dn(&reply.base_dn, &config.base_dn) {
                        return Err(ReplError::BaseDnMismatch {
                            local: config.base_dn.clone(),
                            relay: reply.base_dn,
                        });
                    }
                    let mut info = ReplicationServerInfo::from_start_msg(&reply, &config.relay_urls);
                    info.server_url = url.to_string();
                    info.locally_configured = true;
                    info.protocol_version = info.protocol_version.min(PROTOCOL_VERSION);
                    Ok((info, reply.degraded_status_threshold))
                }
                other => Err(ReplError::Protocol {
                    msg: format!("expected replication server start, got {:?}", other.message_type()),
                }),
            }
        };
        match exchange.await {
            Ok((info, degraded_threshold)) => Ok(Phase1 {
                session,
                info,
                degraded_threshold,
            }),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn phase2(
        &self,
        config: &BrokerConfig,
        session: &ReplSession,
        status: ServerStatus,
    ) -> Result<TopologyMsg, ReplError> {
        let start = StartSessionMsg {
            status,
            referral_urls: config.referral_urls.clone(),
            assured: config.assured,
            assured_mode: config.assured_mode,
            safe_data_level: config.safe_data_level,
        };
        session.publish(&ReplicationMsg::StartSession(start)).await?;
        match session.receive(Some(config.connect_timeout())).await? {
            ReplicationMsg::Topology(topology) => Ok(topology),
            other => Err(ReplError::Protocol {
                msg: format!("expected topology, got {:?}", other.message_type()),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn install_session(
        &self,
        config: &BrokerConfig,
        phase1: Phase1,
        status: ServerStatus,
        topology: &TopologyMsg,
        candidates: &Topology,
        local_state: &ServerState,
        generation_id: i64,
    ) -> HeartbeatTasks {
        let Phase1 { session, info, .. } = phase1;
        let server_id = config.server_id;

        self.rcv_window.reset(config.window_size);
        let snapshot = candidates.with_message(topology, server_id, info.relay_id, &config.relay_urls);
        *write(&self.topology) = Arc::new(snapshot);

        if info.group_id != config.group_id {
            warn!(
                server_id,
                relay = %info.server_url,
                local_group = config.group_id,
                relay_group = info.group_id,
                "connected to a replication server of another group"
            );
        }

        let change_time_interval = if info.protocol_version >= CHANGE_TIME_HEARTBEAT_MIN_VERSION {
            config.change_time_heartbeat_interval()
        } else {
            None
        };
        let heartbeats = HeartbeatTasks::start(
            &session,
            HeartbeatSettings {
                server_id,
                interval: config.heartbeat_interval(),
                change_time_interval,
            },
            &self.shutdown,
            self.heartbeat_counters.clone(),
        );

        let recovery_required =
            own_clock(&info.server_state, server_id) < own_clock(local_state, server_id);
        if recovery_required {
            self.recovery_required.store(true, Ordering::SeqCst);
        }

        if info.generation_id == generation_id || info.generation_id == NO_GENERATION_ID {
            info!(
                server_id,
                relay = %info.server_url,
                generation_id,
                "generation id matches the replication server"
            );
        } else {
            warn!(
                server_id,
                relay = %info.server_url,
                generation_id,
                relay_generation_id = info.generation_id,
                "generation id differs from the replication server, changes will not be \
                 replicated until the data is reinitialized"
            );
        }

        let event = SessionEvent::Connected {
            relay_id: info.relay_id,
            relay_url: info.server_url.clone(),
            generation_id: info.generation_id,
            status,
            recovery_required: self.recovery_required.load(Ordering::SeqCst),
        };
        {
            let mut link = write(&self.link);
            link.send_window.close();
            link.send_window = SendWindow::new(info.window_size);
            link.session = Some(session);
            link.relay = Some(info.clone());
            link.status = status;
        }
        self.connected.store(true, Ordering::SeqCst);
        self.connection_error.store(false, Ordering::SeqCst);
        self.failure_streak.store(false, Ordering::SeqCst);
        self.best_server_counter.store(0, Ordering::SeqCst);
        self.counters.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.set_state(BrokerState::Connected);
        info!(
            server_id,
            base_dn = %config.base_dn,
            relay = %info.server_url,
            relay_id = info.relay_id,
            ?status,
            "connected to replication server"
        );
        self.events.send_replace(event);
        heartbeats
    }

    // Caller holds `connect_phase`.
    async fn drop_session(&self, heartbeats: &mut Option<HeartbeatTasks>) {
        if let Some(tasks) = heartbeats.take() {
            tasks.stop().await;
        }
        let session = {
            let mut link = write(&self.link);
            link.send_window.close();
            link.relay = None;
            link.status = ServerStatus::NotConnected;
            link.session.take()
        };
        if let Some(session) = session {
            session.close().await;
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            self.events.send_replace(SessionEvent::Disconnected);
        }
        self.set_state(BrokerState::Disconnected);
    }

    // Close `failing` and forget it if it is still the current session.
    async fn lose_session(&self, failing: &ReplSession) {
        failing.close().await;
        self.lost_connections.fetch_add(1, Ordering::SeqCst);
        let mut heartbeats = self.connect_phase.lock().await;
        let is_current = read(&self.link)
            .session
            .as_ref()
            .is_some_and(|s| s.same_session(failing));
        if is_current {
            self.drop_session(&mut heartbeats).await;
        }
    }

    /// Replace a failed session.
    ///
    /// `failing` is closed and counted as a lost connection. With
    /// `infinite`, connection attempts repeat every reconnect backoff until
    /// one succeeds or the broker stops; otherwise one attempt is made.
    pub async fn restart(&self, failing: Option<&ReplSession>, infinite: bool) {
        let _guard = self.start_stop.lock().await;
        if let Some(session) = failing {
            self.lose_session(session).await;
        }
        while !self.connected.load(Ordering::SeqCst) && !self.shutdown.is_cancelled() {
            self.connect().await;
            if !infinite || self.connected.load(Ordering::SeqCst) {
                break;
            }
            if !self.shutdown.sleep(self.config().reconnect_backoff()).await {
                break;
            }
        }
    }

    /// Restart the current session, typically after
    /// [`change_config`](Self::change_config) returned true.
    pub async fn restart_now(&self) {
        let session = self.current_session();
        self.restart(session.as_ref(), true).await;
    }

    /// Current session, if any.
    pub fn current_session(&self) -> Option<ReplSession> {
        read(&self.link).session.clone()
    }

    async fn publish_inner(
        &self,
        msg: &ReplicationMsg,
        recovery: bool,
        retry: bool,
    ) -> Result<(), BrokerError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(BrokerError::Shutdown);
            }
            if self.connection_error.load(Ordering::SeqCst) {
                return Err(BrokerError::NotConnected);
            }
            let (session, window) = {
                let link = read(&self.link);
                (link.session.clone(), link.send_window.clone())
            };
            if !recovery && self.recovery_required.load(Ordering::SeqCst) {
                return Err(BrokerError::RecoveryPending);
            }
            let config = self.config();
            let Some(session) = session else {
                if !retry {
                    return Err(BrokerError::NotConnected);
                }
                if !self.shutdown.sleep(config.publish_retry_delay()).await {
                    return Err(BrokerError::Shutdown);
                }
                continue;
            };

            if msg.is_update() {
                match window.acquire(config.send_window_wait()).await {
                    Acquire::Acquired => {}
                    Acquire::TimedOut { probe } => {
                        if probe && session.publish(&ReplicationMsg::WindowProbe).await.is_ok() {
                            self.counters.window_probes_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        continue;
                    }
                    Acquire::Closed => {
                        if !retry {
                            return Err(BrokerError::WindowClosed);
                        }
                        continue;
                    }
                }
            }

            // The session may have been replaced while waiting for credit.
            let still_current = read(&self.link)
                .session
                .as_ref()
                .is_some_and(|s| s.same_session(&session));
            if !still_current {
                continue;
            }

            match session.publish(msg).await {
                Ok(()) => {
                    if msg.is_update() {
                        self.counters.updates_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(e) => {
                    debug!(relay = %session.remote_addr(), error = %e, "publish failed");
                    if !retry {
                        return Err(session_error(e));
                    }
                    if !self.shutdown.sleep(config.publish_retry_delay()).await {
                        return Err(BrokerError::Shutdown);
                    }
                }
            }
        }
    }

    /// Publish, retrying until a session takes the message.
    pub async fn publish(&self, msg: &ReplicationMsg) -> Result<(), BrokerError> {
        self.publish_inner(msg, false, true).await
    }

    /// Publish once; session failures are returned.
    pub async fn publish_once(&self, msg: &ReplicationMsg) -> Result<(), BrokerError> {
        self.publish_inner(msg, false, false).await
    }

    /// Publish a change missed by the relay; allowed while recovery is
    /// pending.
    pub async fn publish_recovery(&self, msg: &ReplicationMsg) -> Result<(), BrokerError> {
        self.publish_inner(msg, true, true).await
    }

    /// Publish a control message once; not held back by recovery.
    pub async fn publish_control(&self, msg: &ReplicationMsg) -> Result<(), BrokerError> {
        self.publish_inner(msg, true, false).await
    }

    /// Receive the next message for the caller.
    ///
    /// Only one task may call this. Control messages are handled here and
    /// never returned. `Ok(None)` means the broker was stopped or the session
    /// failed without `reconnect_on_failure`.
    pub async fn receive(
        &self,
        options: ReceiveOptions,
    ) -> Result<Option<ReplicationMsg>, BrokerError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }
            let Some(session) = self.current_session() else {
                if !options.reconnect_on_failure {
                    return Ok(None);
                }
                self.restart(None, true).await;
                continue;
            };
            let timeout = self.config().receive_timeout();
            let Some(received) = self.until_shutdown(session.receive(Some(timeout))).await else {
                return Ok(None);
            };
            match received {
                Ok(msg) => {
                    if let Some(msg) = self.handle_message(&session, msg, options).await {
                        return Ok(Some(msg));
                    }
                }
                Err(e) if is_timeout(&e) => return Err(BrokerError::Timeout),
                Err(e) => {
                    if self.shutdown.is_cancelled() {
                        return Ok(None);
                    }
                    if !session.is_closed() {
                        let config = self.config();
                        warn!(
                            server_id = config.server_id,
                            base_dn = %config.base_dn,
                            relay = %session.remote_addr(),
                            error = %e,
                            "badly disconnected from replication server"
                        );
                    }
                    if !options.reconnect_on_failure {
                        self.lose_session(&session).await;
                        return Ok(None);
                    }
                    self.restart(Some(&session), true).await;
                }
            }
        }
    }

    async fn handle_message(
        &self,
        session: &ReplSession,
        msg: ReplicationMsg,
        options: ReceiveOptions,
    ) -> Option<ReplicationMsg> {
        match msg {
            ReplicationMsg::Update(update) => {
                if !self.rcv_window.on_update() {
                    debug!(relay = %session.remote_addr(), clock = %update.clock, "update received past the receive window");
                }
                self.counters.updates_received.fetch_add(1, Ordering::Relaxed);
                Some(ReplicationMsg::Update(update))
            }
            ReplicationMsg::Window(credit) => {
                let link = read(&self.link);
                if link.session.as_ref().is_some_and(|s| s.same_session(session)) {
                    link.send_window.add_credit(credit.num_ack);
                }
                None
            }
            ReplicationMsg::WindowProbe => {
                if let Some(num_ack) = self.rcv_window.probe_reply() {
                    let reply = ReplicationMsg::Window(WindowMsg { num_ack });
                    if let Err(e) = session.publish(&reply).await {
                        debug!(relay = %session.remote_addr(), error = %e, "window probe reply failed");
                    }
                }
                None
            }
            ReplicationMsg::Topology(topology) => {
                self.apply_topology(&topology);
                options
                    .return_on_topology_change
                    .then_some(ReplicationMsg::Topology(topology))
            }
            ReplicationMsg::Stop => {
                warn!(
                    relay = %session.remote_addr(),
                    "replication server closed the session, reconnecting"
                );
                self.restart(Some(session), true).await;
                None
            }
            ReplicationMsg::Monitor(monitor) => {
                {
                    let mut topology = write(&self.topology);
                    *topology = Arc::new(topology.with_relay_states(&monitor.relay_states));
                }
                *self
                    .replica_states
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = monitor.replica_states;
                self.monitor_received.notify_waiters();
                if options.reconnect_to_best_relay {
                    self.maybe_switch_relay(session).await;
                }
                None
            }
            ReplicationMsg::Heartbeat => None,
            other => Some(other),
        }
    }

    fn apply_topology(&self, msg: &TopologyMsg) {
        let config = self.config();
        let relay_id = read(&self.link).relay.as_ref().map(|r| r.relay_id);
        let mut topology = write(&self.topology);
        let relay_id = relay_id.or(topology.connected_relay()).unwrap_or_default();
        *topology = Arc::new(topology.with_message(msg, config.server_id, relay_id, &config.relay_urls));
        self.best_server_counter.store(0, Ordering::SeqCst);
    }

    // Rerun the election every few monitor replies and move if it says so.
    async fn maybe_switch_relay(&self, session: &ReplSession) {
        let count = self.best_server_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if count < MONITORS_PER_ELECTION {
            return;
        }
        self.best_server_counter.store(0, Ordering::SeqCst);
        let Some(current) = self.connected_relay_id() else {
            return;
        };

        let config = self.config();
        let topology = self.topology();
        let local_state = self.domain.server_state();
        let locality = HostLocality::new(config.local_hosts.clone(), config.in_process_ports.clone());
        let local = LocalReplica {
            server_id: config.server_id,
            group_id: config.group_id,
            generation_id: self.domain.generation_id(),
            state: &local_state,
            locality: &locality,
        };
        let best = compute_best_replication_server(false, Some(current), &local, topology.relays())
            .map(|relay| (relay.relay_id, relay.server_url.clone()));
        match best {
            Some((id, _)) if id == current => return,
            None => info!(
                server_id = config.server_id,
                relay_id = current,
                "disconnecting from replication server for load balance"
            ),
            Some((id, url)) => info!(
                server_id = config.server_id,
                relay_id = current,
                new_relay_id = id,
                new_relay = %url,
                "new best relay found, reconnecting"
            ),
        }
        self.restart(Some(session), true).await;
    }

    /// Stop replicating.
    ///
    /// Tells the relay the replica goes offline, cancels every sleeper and
    /// background task and closes the session. The broker cannot be
    /// restarted.
    pub async fn stop(&self) {
        let config = self.config();
        if self.is_connected() {
            let clock = LogicalClock::new(system_time_ms(), 0, config.server_id);
            if let Err(e) = self
                .publish_inner(&ReplicationMsg::ReplicaOffline(clock), true, false)
                .await
            {
                debug!(server_id = config.server_id, error = %e, "replica offline notice not sent");
            }
        }
        // Cancel before taking the lock so a reconnect loop holding it ends.
        self.shutdown.cancel();
        let _guard = self.start_stop.lock().await;
        let mut heartbeats = self.connect_phase.lock().await;
        self.drop_session(&mut heartbeats).await;
        self.set_state(BrokerState::Shutdown);
        info!(server_id = config.server_id, base_dn = %config.base_dn, "replication broker stopped");
    }

    /// Whether [`stop`](Self::stop) was called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled when the broker stops.
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    /// Ask the relay for the state of every replica.
    ///
    /// The map is empty when no answer arrives within the monitor response
    /// timeout.
    pub async fn get_replica_states(&self) -> BTreeMap<u32, ServerState> {
        let config = self.config();
        let Some(destination) = self.connected_relay_id() else {
            return BTreeMap::new();
        };
        let notified = self.monitor_received.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let request = ReplicationMsg::MonitorRequest(MonitorRequestMsg {
            sender_id: config.server_id,
            destination,
        });
        if let Err(e) = self.publish_inner(&request, true, false).await {
            debug!(server_id = config.server_id, error = %e, "monitor request not sent");
            return BTreeMap::new();
        }
        let wait = tokio::time::timeout(config.monitor_response_timeout(), notified);
        match self.until_shutdown(wait).await {
            Some(Ok(())) => self
                .replica_states
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            _ => {
                debug!(server_id = config.server_id, "no monitoring response from replication server");
                BTreeMap::new()
            }
        }
    }

    /// Apply a new configuration.
    ///
    /// Returns true when the change only takes effect on a new session; the
    /// caller should then call [`restart_now`](Self::restart_now).
    pub fn change_config(&self, new: BrokerConfig) -> bool {
        let mut config = write(&self.config);
        let restart = config.requires_restart(&new);
        *config = new;
        restart
    }

    /// Tell the relay the replica moved to `status`.
    pub async fn signal_status_change(&self, status: ServerStatus) -> Result<(), BrokerError> {
        let msg = ReplicationMsg::ChangeStatus(ChangeStatusMsg {
            requested_status: ServerStatus::NotConnected,
            new_status: status,
        });
        self.publish_inner(&msg, true, false).await?;
        write(&self.link).status = status;
        Ok(())
    }

    /// Hand credit back after a replayed update.
    pub async fn update_window_after_replay(&self) {
        if let Some(num_ack) = self.rcv_window.on_replayed() {
            let msg = ReplicationMsg::Window(WindowMsg { num_ack });
            if let Err(e) = self.publish_inner(&msg, true, false).await {
                debug!(error = %e, num_ack, "window credit not sent");
            }
        }
    }

    /// Set or clear the recovery gate on new publishes.
    pub fn set_recovery_required(&self, required: bool) {
        self.recovery_required.store(required, Ordering::SeqCst);
    }

    /// Whether new publishes wait for recovery.
    pub fn recovery_required(&self) -> bool {
        self.recovery_required.load(Ordering::SeqCst)
    }

    /// Session changes.
    pub fn subscribe_sessions(&self) -> watch::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// URL of the relay in use, or `"Not connected"`.
    pub fn replication_server(&self) -> String {
        read(&self.link)
            .relay
            .as_ref()
            .map_or_else(|| NOT_CONNECTED.to_string(), |r| r.server_url.clone())
    }

    /// Relay in use.
    pub fn connected_relay(&self) -> Option<ReplicationServerInfo> {
        read(&self.link).relay.clone()
    }

    /// Id of the relay in use.
    pub fn connected_relay_id(&self) -> Option<u32> {
        read(&self.link).relay.as_ref().map(|r| r.relay_id)
    }

    /// Status announced to the relay.
    pub fn status(&self) -> ServerStatus {
        read(&self.link).status
    }

    /// Send window granted by the relay.
    pub fn max_send_window(&self) -> u32 {
        read(&self.link).send_window.max()
    }

    /// Send credit left; 0 without a session.
    pub fn current_send_window(&self) -> u32 {
        let link = read(&self.link);
        if link.session.is_some() {
            link.send_window.available()
        } else {
            0
        }
    }

    /// Configured receive window.
    pub fn max_rcv_window(&self) -> u32 {
        self.rcv_window.max()
    }

    /// Updates the relay may still send.
    pub fn current_rcv_window(&self) -> u32 {
        self.rcv_window.current()
    }

    /// Sessions lost so far.
    pub fn num_lost_connections(&self) -> u64 {
        self.lost_connections.load(Ordering::SeqCst)
    }

    /// Whether a session is up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Current topology snapshot.
    pub fn topology(&self) -> Arc<Topology> {
        read(&self.topology).clone()
    }

    /// Known relays.
    pub fn relays(&self) -> BTreeMap<u32, ReplicationServerInfo> {
        self.topology().relays().clone()
    }

    /// Other replicas.
    pub fn replicas(&self) -> BTreeMap<u32, DsInfo> {
        self.topology().replicas().clone()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            updates_sent: self.counters.updates_sent.load(Ordering::Relaxed),
            updates_received: self.counters.updates_received.load(Ordering::Relaxed),
            window_probes_sent: self.counters.window_probes_sent.load(Ordering::Relaxed),
            window_credits_sent: self.rcv_window.credits_sent(),
            heartbeats_sent: self.heartbeat_counters.heartbeats_sent(),
            change_time_heartbeats_sent: self.heartbeat_counters.change_time_sent(),
            reconnects: self
                .counters
                .sessions_opened
                .load(Ordering::Relaxed)
                .saturating_sub(1),
        }
    }
}
