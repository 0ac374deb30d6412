//! Scripted replication servers for integration tests.

#![allow(dead_code)]

use dirsync_repl::protocol::{
    DsInfo, ReplServerStartMsg, ReplicationMsg, RsInfo, TopologyMsg, PROTOCOL_VERSION,
};
use dirsync_repl::session::ReplSession;
use dirsync_repl::{BrokerConfig, DomainState, ServerState};
use dirsync_transport::MemoryNetwork;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const BASE_DN: &str = "dc=example,dc=com";

/// Upper bound on anything a test waits for.
pub const WAIT: Duration = Duration::from_secs(5);

/// Broker settings tuned for fast tests: no heartbeats, short waits.
pub fn broker_config(server_id: u32, urls: &[&str]) -> BrokerConfig {
    let mut config = BrokerConfig::new(
        server_id,
        BASE_DN,
        urls.iter().map(|u| u.to_string()).collect(),
    );
    config.heartbeat_interval_ms = 0;
    config.change_time_heartbeat_interval_ms = 0;
    config.connect_timeout_ms = 1_000;
    config.reconnect_backoff_ms = 20;
    config.receive_timeout_ms = 100;
    config.send_window_wait_ms = 50;
    config.publish_retry_delay_ms = 10;
    config.monitor_response_timeout_ms = 1_000;
    config
}

/// Fixed local view handed to a bare broker.
pub struct FixedState {
    pub generation_id: i64,
    pub state: ServerState,
}

impl DomainState for FixedState {
    fn generation_id(&self) -> i64 {
        self.generation_id
    }

    fn server_state(&self) -> ServerState {
        self.state.clone()
    }
}

/// How a scripted relay answers the handshake.
#[derive(Debug, Clone)]
pub struct RelaySpec {
    pub relay_id: u32,
    pub url: String,
    pub generation_id: i64,
    pub window_size: u32,
    pub server_state: ServerState,
    pub replicas: Vec<DsInfo>,
}

impl RelaySpec {
    pub fn new(relay_id: u32, url: &str) -> Self {
        Self {
            relay_id,
            url: url.to_string(),
            generation_id: 1,
            window_size: 100,
            server_state: ServerState::new(),
            replicas: Vec::new(),
        }
    }
}

/// A relay that answers both handshake phases and hands every established
/// session to the test.
pub struct ScriptedRelay {
    pub spec: RelaySpec,
    sessions: mpsc::UnboundedReceiver<ReplSession>,
    accept: JoinHandle<()>,
}

impl ScriptedRelay {
    pub fn start(net: &MemoryNetwork, spec: RelaySpec) -> Self {
        let mut listener = net.listen(&spec.url);
        let (tx, sessions) = mpsc::unbounded_channel();
        let script = spec.clone();
        let accept = tokio::spawn(async move {
            while let Some(server) = listener.accept().await {
                let session = ReplSession::new(server);
                tokio::spawn(handshake(session, script.clone(), tx.clone()));
            }
        });
        Self {
            spec,
            sessions,
            accept,
        }
    }

    /// Next session that completed phase 2.
    pub async fn next_session(&mut self) -> ReplSession {
        tokio::time::timeout(WAIT, self.sessions.recv())
            .await
            .expect("no session established in time")
            .expect("relay stopped")
    }
}

impl Drop for ScriptedRelay {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn handshake(session: ReplSession, spec: RelaySpec, established: mpsc::UnboundedSender<ReplSession>) {
    let Ok(ReplicationMsg::ServerStart(start)) = session.receive(Some(WAIT)).await else {
        return;
    };
    let reply = ReplServerStartMsg {
        server_id: spec.relay_id,
        server_url: spec.url.clone(),
        base_dn: start.base_dn.clone(),
        window_size: spec.window_size,
        server_state: spec.server_state.clone(),
        generation_id: spec.generation_id,
        group_id: 1,
        weight: 1,
        connected_replicas: spec.replicas.iter().map(|r| r.ds_id).collect(),
        protocol_version: PROTOCOL_VERSION,
        degraded_status_threshold: 0,
    };
    if session.publish(&ReplicationMsg::ReplServerStart(reply)).await.is_err() {
        return;
    }
    // Phase-1 probes are closed by the replica at this point.
    let Ok(ReplicationMsg::StartSession(_)) = session.receive(Some(WAIT)).await else {
        return;
    };
    let topology = TopologyMsg {
        replicas: spec.replicas.clone(),
        relays: vec![RsInfo {
            rs_id: spec.relay_id,
            server_url: spec.url.clone(),
            generation_id: spec.generation_id,
            group_id: 1,
            weight: 1,
        }],
    };
    if session.publish(&ReplicationMsg::Topology(topology)).await.is_ok() {
        let _ = established.send(session);
    }
}

/// Next message from the replica, heartbeats skipped.
pub async fn next_msg(session: &ReplSession) -> ReplicationMsg {
    loop {
        match session.receive(Some(WAIT)).await.expect("relay receive failed") {
            ReplicationMsg::Heartbeat | ReplicationMsg::ChangeTimeHeartbeat(_) => continue,
            msg => return msg,
        }
    }
}
