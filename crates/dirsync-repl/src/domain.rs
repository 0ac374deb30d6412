//! A replicated domain: local changes out, replayed changes in.
//!
//! The domain owns the broker for its base DN and keeps the local server
//! state. Local writers hand their changes to
//! [`ReplicationDomain::deliver_local_change`] (and its add, rename and delete
//! siblings) to get the history recorded and an update to publish. The
//! listener hands every received update to
//! [`ReplicationDomain::process_update`], which resolves conflicts against
//! the entry history before storing the result.

use crate::backend::{ReplayedOperation, ReplicaBackend};
use crate::broker::{DomainState, ReplicationBroker, SessionEvent};
use crate::clock::{system_time_ms, ClockGenerator, LogicalClock};
use crate::config::ReplicationConfig;
use crate::entry::{AttrDescription, Entry, Modification};
use crate::error::{BrokerError, ReplError};
use crate::history::EntryHistory;
use crate::protocol::{AckMsg, ReplicationMsg, ServerStatus, UpdateMsg, UpdatePayload};
use crate::state::ServerState;
use dirsync_transport::Connector;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of publishing a local change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Sent without waiting for acknowledgment.
    Sent,
    /// Acknowledged without errors.
    Acknowledged,
    /// No acknowledgment within the assured timeout.
    AckTimeout,
    /// Acknowledged with errors.
    AckErrors(AckMsg),
}

/// Monitoring view of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    /// Base DN.
    pub base_dn: String,
    /// Local replica id.
    pub server_id: u32,
    /// Relay in use, or "Not connected".
    pub replication_server: String,
    /// Status announced to the relay.
    pub status: ServerStatus,
    /// Sessions lost so far.
    pub lost_connections: u64,
    /// Send credit left.
    pub send_window: u32,
    /// Send window granted by the relay.
    pub max_send_window: u32,
    /// Updates the relay may still send.
    pub rcv_window: u32,
    /// Configured receive window.
    pub max_rcv_window: u32,
    /// Newest clock seen per replica.
    pub server_state: ServerState,
    /// Assured updates published.
    pub assured_sent: u64,
    /// Assured updates acknowledged without error.
    pub assured_acknowledged: u64,
    /// Assured updates not acknowledged in time.
    pub assured_timeouts: u64,
    /// Assured updates acknowledged with errors.
    pub assured_errors: u64,
    /// Updates replayed.
    pub replayed: u64,
    /// Replayed updates that needed conflict resolution.
    pub conflicts_resolved: u64,
    /// Replayed updates that failed.
    pub replay_errors: u64,
}

#[derive(Debug, Default)]
struct DomainCounters {
    assured_sent: AtomicU64,
    assured_acknowledged: AtomicU64,
    assured_timeouts: AtomicU64,
    assured_errors: AtomicU64,
    replayed: AtomicU64,
    conflicts_resolved: AtomicU64,
    replay_errors: AtomicU64,
}

// What the broker reads during a handshake.
struct LocalState {
    backend: Arc<dyn ReplicaBackend>,
    state: Mutex<ServerState>,
}

impl LocalState {
    fn update(&self, clock: LogicalClock) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(clock);
    }
}

impl DomainState for LocalState {
    fn generation_id(&self) -> i64 {
        self.backend.generation_id()
    }

    fn server_state(&self) -> ServerState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// One replicated base DN.
pub struct ReplicationDomain {
    config: RwLock<ReplicationConfig>,
    local: Arc<LocalState>,
    broker: Arc<ReplicationBroker>,
    clock: ClockGenerator,
    pending_acks: Mutex<BTreeMap<LogicalClock, oneshot::Sender<AckMsg>>>,
    // Newest local change refused while recovery was pending. Recovery only
    // lifts the gate under this lock.
    held_back: Mutex<Option<LogicalClock>>,
    counters: DomainCounters,
}

impl std::fmt::Debug for ReplicationDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationDomain")
            .field("server_id", &self.server_id())
            .field("broker", &self.broker)
            .finish()
    }
}

/// Split a DN into its first RDN and its parent.
fn split_dn(dn: &str) -> (String, Option<String>) {
    match dn.split_once(',') {
        Some((rdn, parent)) => (rdn.trim().to_string(), Some(parent.trim().to_string())),
        None => (dn.trim().to_string(), None),
    }
}

impl ReplicationDomain {
    /// Domain over `backend`, reaching relays through `connector`.
    ///
    /// The local server state is rebuilt from the histories stored in the
    /// backend. The broker is not started.
    pub fn new(
        config: ReplicationConfig,
        backend: Arc<dyn ReplicaBackend>,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>, ReplError> {
        config.validate()?;
        let server_id = config.broker.server_id;

        let mut state = ServerState::new();
        for entry in backend.entries_changed_since(&LogicalClock::zero(0))? {
            for record in EntryHistory::from_entry(&entry).records() {
                state.update(record.clock);
            }
        }
        let clock = ClockGenerator::new(server_id);
        clock.adjust_state(&state);
        debug!(server_id, state = %state, "local server state loaded");

        let local = Arc::new(LocalState {
            backend,
            state: Mutex::new(state),
        });
        let broker = Arc::new(ReplicationBroker::new(
            config.broker.clone(),
            connector,
            local.clone(),
        ));
        Ok(Arc::new(Self {
            config: RwLock::new(config),
            local,
            broker,
            clock,
            pending_acks: Mutex::new(BTreeMap::new()),
            held_back: Mutex::new(None),
            counters: DomainCounters::default(),
        }))
    }

    fn config(&self) -> ReplicationConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Broker of this domain.
    pub fn broker(&self) -> &Arc<ReplicationBroker> {
        &self.broker
    }

    /// Local replica id.
    pub fn server_id(&self) -> u32 {
        self.clock.replica_id()
    }

    /// Clock for a new local change.
    pub fn next_clock(&self) -> LogicalClock {
        self.clock.next_clock()
    }

    /// Newest clock seen per replica.
    pub fn server_state(&self) -> ServerState {
        self.local.server_state()
    }

    /// Apply a new configuration, restarting the session if needed.
    pub async fn change_config(&self, config: ReplicationConfig) -> Result<(), ReplError> {
        config.validate()?;
        let restart = self.broker.change_config(config.broker.clone());
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        if restart {
            info!(server_id = self.server_id(), "configuration change requires a new session");
            self.broker.restart_now().await;
        }
        Ok(())
    }

    fn purge(&self, history: &mut EntryHistory) {
        if let Some(delay) = self.config().history_purge_delay() {
            let cutoff = system_time_ms().saturating_sub(delay.as_millis() as u64);
            history.purge(LogicalClock::new(cutoff, 0, 0));
        }
    }

    fn assured(&self, mut msg: UpdateMsg) -> UpdateMsg {
        let config = self.config();
        msg.assured = config.broker.assured;
        msg.assured_mode = config.broker.assured_mode;
        msg.safe_data_level = config.broker.safe_data_level;
        msg
    }

    /// Record a local modify of `entry` and build the update to publish.
    ///
    /// `mods` must already be applied to `entry`; only its history is
    /// updated here.
    pub fn deliver_local_change(
        &self,
        entry: &mut Entry,
        mods: &[Modification],
        clock: LogicalClock,
    ) -> UpdateMsg {
        let mut history = EntryHistory::from_entry(entry);
        history.process_local(mods, clock);
        self.purge(&mut history);
        history.write_to(entry);
        self.local.update(clock);
        let mods = mods
            .iter()
            .filter(|m| !m.attribute.is_historical())
            .cloned()
            .collect();
        self.assured(UpdateMsg::new(
            clock,
            entry.dn(),
            entry.uuid(),
            UpdatePayload::Modify { mods },
        ))
    }

    /// Record the local creation of `entry`.
    pub fn deliver_local_add(&self, entry: &mut Entry, clock: LogicalClock) -> UpdateMsg {
        let mut history = EntryHistory::from_entry(entry);
        history.record_add(clock);
        history.write_to(entry);
        self.local.update(clock);
        let attributes: Vec<(AttrDescription, Vec<String>)> = entry
            .attributes()
            .filter(|(attr, _)| !attr.is_historical())
            .map(|(attr, values)| (attr.clone(), values.iter().cloned().collect()))
            .collect();
        self.assured(UpdateMsg::new(
            clock,
            entry.dn(),
            entry.uuid(),
            UpdatePayload::Add {
                parent_uuid: None,
                attributes,
            },
        ))
    }

    /// Record the local rename of `entry` to `new_dn`.
    pub fn deliver_local_rename(
        &self,
        entry: &mut Entry,
        new_dn: &str,
        clock: LogicalClock,
    ) -> UpdateMsg {
        let old_dn = entry.dn().to_string();
        let mut history = EntryHistory::from_entry(entry);
        history.record_rename(clock);
        self.purge(&mut history);
        history.write_to(entry);
        entry.set_dn(new_dn);
        self.local.update(clock);
        let (new_rdn, new_superior) = split_dn(new_dn);
        self.assured(UpdateMsg::new(
            clock,
            &old_dn,
            entry.uuid(),
            UpdatePayload::ModifyDn {
                new_rdn,
                delete_old_rdn: false,
                new_superior,
            },
        ))
    }

    /// Record the local removal of `entry`.
    pub fn deliver_local_delete(&self, entry: &Entry, clock: LogicalClock) -> UpdateMsg {
        self.local.update(clock);
        self.assured(UpdateMsg::new(
            clock,
            entry.dn(),
            entry.uuid(),
            UpdatePayload::Delete,
        ))
    }

    /// Publish a local change, waiting for its acknowledgment when assured.
    ///
    /// The changed entry must be stored before this is called. While
    /// recovery is pending the change is refused with `RecoveryPending`;
    /// recovery then picks it up from the backend.
    pub async fn publish_local_change(&self, msg: UpdateMsg) -> Result<PublishOutcome, BrokerError> {
        let clock = msg.clock;
        {
            let mut held_back = self.held_back.lock().unwrap_or_else(PoisonError::into_inner);
            if self.broker.recovery_required() {
                *held_back = (*held_back).max(Some(clock));
                return Err(BrokerError::RecoveryPending);
            }
        }
        let waiter = msg.assured.then(|| {
            let (tx, rx) = oneshot::channel();
            self.pending_acks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(clock, tx);
            rx
        });

        if let Err(e) = self.broker.publish(&ReplicationMsg::Update(msg)).await {
            self.forget_ack(&clock);
            if matches!(e, BrokerError::RecoveryPending) {
                self.hold_back(clock);
            }
            return Err(e);
        }
        let Some(waiter) = waiter else {
            return Ok(PublishOutcome::Sent);
        };

        self.counters.assured_sent.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.config().assured_timeout(), waiter).await {
            Ok(Ok(ack)) if !ack.has_errors() => {
                self.counters.assured_acknowledged.fetch_add(1, Ordering::Relaxed);
                Ok(PublishOutcome::Acknowledged)
            }
            Ok(Ok(ack)) => {
                self.counters.assured_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%clock, failed = ?ack.failed_servers, "assured update acknowledged with errors");
                Ok(PublishOutcome::AckErrors(ack))
            }
            _ => {
                self.forget_ack(&clock);
                self.counters.assured_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(%clock, "no acknowledgment for assured update");
                Ok(PublishOutcome::AckTimeout)
            }
        }
    }

    fn hold_back(&self, clock: LogicalClock) {
        let mut held_back = self.held_back.lock().unwrap_or_else(PoisonError::into_inner);
        *held_back = (*held_back).max(Some(clock));
    }

    fn forget_ack(&self, clock: &LogicalClock) {
        self.pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(clock);
    }

    /// Wake the publisher waiting for `ack`.
    pub fn on_ack(&self, ack: AckMsg) {
        let waiter = self
            .pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ack.clock);
        match waiter {
            Some(tx) => {
                let _ = tx.send(ack);
            }
            None => debug!(clock = %ack.clock, "acknowledgment for an update nobody waits for"),
        }
    }

    /// Replay a received update against the local store.
    ///
    /// Returns true when conflict resolution changed the operation. The
    /// clock counts as seen even if the replay fails, so the update is not
    /// asked for again.
    pub fn replay(&self, msg: &UpdateMsg) -> Result<bool, ReplError> {
        self.clock.adjust(&msg.clock);
        let result = self.replay_operation(msg);
        self.local.update(msg.clock);
        result
    }

    fn fetch(&self, uuid: Uuid) -> Result<Entry, ReplError> {
        self.local
            .backend
            .fetch_entry(uuid)?
            .ok_or(ReplError::EntryNotFound { uuid })
    }

    fn store(&self, clock: LogicalClock, entry: Entry) -> Result<(), ReplError> {
        self.local
            .backend
            .apply_replayed_operation(ReplayedOperation::Store { clock, entry })
    }

    fn replay_operation(&self, msg: &UpdateMsg) -> Result<bool, ReplError> {
        let clock = msg.clock;
        let backend = &self.local.backend;
        match &msg.payload {
            UpdatePayload::Add { attributes, .. } => {
                if backend.fetch_entry(msg.entry_uuid)?.is_some() {
                    debug!(%clock, dn = %msg.dn, "entry already present, add ignored");
                    return Ok(true);
                }
                let mut entry = Entry::new(&msg.dn, msg.entry_uuid);
                for (attr, values) in attributes.iter().filter(|(a, _)| !a.is_historical()) {
                    entry.put(attr.clone(), values.iter().cloned());
                }
                let mut history = EntryHistory::new();
                history.record_add(clock);
                history.write_to(&mut entry);
                self.store(clock, entry)?;
                Ok(false)
            }
            UpdatePayload::Modify { mods } => {
                let mut entry = self.fetch(msg.entry_uuid)?;
                let mut history = EntryHistory::from_entry(&entry);
                let mut mods = mods.clone();
                let conflict = history.replay_modify(&entry, &mut mods, clock)?;
                entry.apply_modifications(&mods)?;
                self.purge(&mut history);
                history.write_to(&mut entry);
                self.store(clock, entry)?;
                Ok(conflict)
            }
            UpdatePayload::ModifyDn {
                new_rdn,
                new_superior,
                ..
            } => {
                let mut entry = self.fetch(msg.entry_uuid)?;
                let mut history = EntryHistory::from_entry(&entry);
                if history.entry_renamed().is_some_and(|renamed| renamed > clock) {
                    debug!(%clock, dn = %entry.dn(), "older rename ignored");
                    return Ok(true);
                }
                let parent = new_superior.clone().or_else(|| split_dn(entry.dn()).1);
                let dn = match parent {
                    Some(parent) => format!("{},{}", new_rdn, parent),
                    None => new_rdn.clone(),
                };
                entry.set_dn(&dn);
                history.record_rename(clock);
                history.write_to(&mut entry);
                self.store(clock, entry)?;
                Ok(false)
            }
            UpdatePayload::Delete => {
                if backend.fetch_entry(msg.entry_uuid)?.is_some() {
                    backend.apply_replayed_operation(ReplayedOperation::Remove {
                        clock,
                        uuid: msg.entry_uuid,
                    })?;
                }
                Ok(false)
            }
        }
    }

    /// Replay an update, logging and counting the outcome.
    ///
    /// Returns false if the update could not be applied; it is skipped.
    pub fn process_update(&self, msg: &UpdateMsg) -> bool {
        match self.replay(msg) {
            Ok(conflict) => {
                self.counters.replayed.fetch_add(1, Ordering::Relaxed);
                if conflict {
                    self.counters.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
                    debug!(clock = %msg.clock, dn = %msg.dn, op = msg.operation(), "conflict resolved");
                }
                true
            }
            Err(ReplError::UnsupportedIncrement { attribute }) => {
                self.counters.replay_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    clock = %msg.clock,
                    dn = %msg.dn,
                    attribute = %attribute,
                    "conflicting increment cannot be resolved, update skipped"
                );
                false
            }
            Err(e) => {
                self.counters.replay_errors.fetch_add(1, Ordering::Relaxed);
                warn!(clock = %msg.clock, dn = %msg.dn, op = msg.operation(), error = %e, "replay failed");
                false
            }
        }
    }

    /// Resend local changes the relay has not seen, oldest first, then lift
    /// the recovery gate.
    ///
    /// Local changes keep arriving while this runs, so the backend is
    /// searched again from the newest clock sent until a pass finds nothing
    /// new and no change was refused past that clock.
    pub async fn recover(&self) -> Result<usize, ReplError> {
        let server_id = self.server_id();
        let start = self
            .broker
            .connected_relay()
            .and_then(|relay| relay.server_state.max_clock(server_id))
            .unwrap_or(LogicalClock::zero(server_id));

        let mut since = start;
        let mut count = 0;
        loop {
            let updates = self.missed_changes(&since)?;
            for update in &updates {
                self.broker
                    .publish_recovery(&ReplicationMsg::Update(update.clone()))
                    .await?;
            }
            if let Some(last) = updates.last() {
                since = last.clock;
                count += updates.len();
                continue;
            }

            let mut held_back = self.held_back.lock().unwrap_or_else(PoisonError::into_inner);
            match held_back.take() {
                Some(refused) if refused > since => {
                    debug!(server_id, %refused, "local change refused during recovery, searching again");
                }
                _ => {
                    self.broker.set_recovery_required(false);
                    break;
                }
            }
        }
        info!(server_id, since = %start, count, "recovered changes missed by the replication server");
        Ok(count)
    }

    // Local changes newer than `since`, oldest first.
    fn missed_changes(&self, since: &LogicalClock) -> Result<Vec<UpdateMsg>, ReplError> {
        let server_id = self.server_id();
        let mut updates: Vec<UpdateMsg> = self
            .local
            .backend
            .entries_changed_since(since)?
            .iter()
            .flat_map(|entry| EntryHistory::from_entry(entry).generate_fake_operations(entry))
            .filter(|op| op.clock().replica_id() == server_id && op.clock() > *since)
            .map(|op| op.to_update_msg())
            .collect();
        updates.sort();
        updates.dedup();
        Ok(updates)
    }

    /// Run [`recover`](Self::recover) whenever a session starts that needs it.
    pub fn spawn_recovery(self: &Arc<Self>) -> JoinHandle<()> {
        let domain = Arc::clone(self);
        let mut events = self.broker.subscribe_sessions();
        let shutdown = self.broker.shutdown_token();
        tokio::spawn(async move {
            loop {
                let needed = matches!(
                    *events.borrow_and_update(),
                    SessionEvent::Connected {
                        recovery_required: true,
                        ..
                    }
                );
                if needed {
                    if let Err(e) = domain.recover().await {
                        warn!(server_id = domain.server_id(), error = %e, "recovery failed");
                    }
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = events.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Monitoring snapshot.
    pub fn monitor(&self) -> MonitorSnapshot {
        let config = self.config();
        let broker = &self.broker;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MonitorSnapshot {
            base_dn: config.broker.base_dn,
            server_id: config.broker.server_id,
            replication_server: broker.replication_server(),
            status: broker.status(),
            lost_connections: broker.num_lost_connections(),
            send_window: broker.current_send_window(),
            max_send_window: broker.max_send_window(),
            rcv_window: broker.current_rcv_window(),
            max_rcv_window: broker.max_rcv_window(),
            server_state: self.server_state(),
            assured_sent: load(&self.counters.assured_sent),
            assured_acknowledged: load(&self.counters.assured_acknowledged),
            assured_timeouts: load(&self.counters.assured_timeouts),
            assured_errors: load(&self.counters.assured_errors),
            replayed: load(&self.counters.replayed),
            conflicts_resolved: load(&self.counters.conflicts_resolved),
            replay_errors: load(&self.counters.replay_errors),
        }
    }
}
