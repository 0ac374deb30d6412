//! Relay and replica topology as last seen by the broker.

use crate::protocol::{DsInfo, ReplServerStartMsg, RsInfo, TopologyMsg};
use crate::state::ServerState;
use std::collections::{BTreeMap, BTreeSet};

/// What the broker knows about one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationServerInfo {
    /// Relay id.
    pub relay_id: u32,
    /// `host:port` the relay listens on.
    pub server_url: String,
    /// Protocol version spoken by the relay, 0 if only known from topology.
    pub protocol_version: u16,
    /// Generation id of the relay's data.
    pub generation_id: i64,
    /// Group id of the relay.
    pub group_id: u8,
    /// Window advertised in the handshake, 0 if only known from topology.
    pub window_size: u32,
    /// Last known state of the relay's changelog.
    pub server_state: ServerState,
    /// Load-balancing weight.
    pub weight: u32,
    /// Replicas currently connected to the relay.
    pub connected_dss: BTreeSet<u32>,
    /// Whether the relay URL appears in the local configuration.
    pub locally_configured: bool,
}

impl ReplicationServerInfo {
    /// Info from a phase-1 handshake reply.
    pub fn from_start_msg(msg: &ReplServerStartMsg, configured: &[String]) -> Self {
        Self {
            relay_id: msg.server_id,
            server_url: msg.server_url.clone(),
            protocol_version: msg.protocol_version,
            generation_id: msg.generation_id,
            group_id: msg.group_id,
            window_size: msg.window_size,
            server_state: msg.server_state.clone(),
            weight: msg.weight,
            connected_dss: msg.connected_replicas.iter().copied().collect(),
            locally_configured: configured.iter().any(|u| same_url(u, &msg.server_url)),
        }
    }

    /// Info from a topology entry for a relay never handshaked with.
    pub fn from_rs_info(info: &RsInfo, connected_dss: BTreeSet<u32>, configured: &[String]) -> Self {
        Self {
            relay_id: info.rs_id,
            server_url: info.server_url.clone(),
            protocol_version: 0,
            generation_id: info.generation_id,
            group_id: info.group_id,
            window_size: 0,
            server_state: ServerState::new(),
            weight: info.weight,
            connected_dss,
            locally_configured: configured.iter().any(|u| same_url(u, &info.server_url)),
        }
    }

    fn update(&mut self, info: &RsInfo, connected_dss: BTreeSet<u32>) {
        self.generation_id = info.generation_id;
        self.group_id = info.group_id;
        self.weight = info.weight;
        self.connected_dss = connected_dss;
    }

    /// Number of replicas connected to the relay.
    pub fn connected_ds_count(&self) -> usize {
        self.connected_dss.len()
    }

    /// Host part of the URL.
    pub fn host(&self) -> &str {
        split_url(&self.server_url).0
    }

    /// Port part of the URL, if it parses.
    pub fn port(&self) -> Option<u16> {
        split_url(&self.server_url).1
    }
}

/// Split `host:port`; IPv6 hosts may be bracketed.
pub fn split_url(url: &str) -> (&str, Option<u16>) {
    match url.rsplit_once(':') {
        Some((host, port)) => (
            host.trim_start_matches('[').trim_end_matches(']'),
            port.parse().ok(),
        ),
        None => (url, None),
    }
}

/// Whether two relay URLs name the same relay.
pub fn same_url(a: &str, b: &str) -> bool {
    let (host_a, port_a) = split_url(a.trim());
    let (host_b, port_b) = split_url(b.trim());
    port_a.is_some() && port_a == port_b && normalize_host(host_a) == normalize_host(host_b)
}

fn normalize_host(host: &str) -> String {
    match host.to_ascii_lowercase().as_str() {
        "localhost" | "127.0.0.1" | "::1" => "localhost".to_string(),
        other => other.to_string(),
    }
}

/// Immutable snapshot of relays and other replicas.
///
/// A new snapshot is built for every change; readers hold an `Arc` to the
/// one they started with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    connected_relay: Option<u32>,
    replicas: BTreeMap<u32, DsInfo>,
    relays: BTreeMap<u32, ReplicationServerInfo>,
}

impl Topology {
    /// Snapshot holding only relays found during phase 1.
    pub fn from_relays(relays: impl IntoIterator<Item = ReplicationServerInfo>) -> Self {
        Self {
            connected_relay: None,
            replicas: BTreeMap::new(),
            relays: relays.into_iter().map(|r| (r.relay_id, r)).collect(),
        }
    }

    /// Snapshot after a topology message received through `connected_relay`.
    ///
    /// Relays already known keep their handshake data; relays missing from
    /// the message are dropped.
    pub fn with_message(
        &self,
        msg: &TopologyMsg,
        local_id: u32,
        connected_relay: u32,
        configured: &[String],
    ) -> Self {
        let replicas: BTreeMap<u32, DsInfo> = msg
            .replicas
            .iter()
            .filter(|ds| ds.ds_id != local_id)
            .map(|ds| (ds.ds_id, ds.clone()))
            .collect();

        let relays = msg
            .relays
            .iter()
            .map(|info| {
                let mut connected: BTreeSet<u32> = replicas
                    .values()
                    .filter(|ds| ds.rs_id == info.rs_id)
                    .map(|ds| ds.ds_id)
                    .collect();
                // The relay never lists the replica it sends to.
                if info.rs_id == connected_relay {
                    connected.insert(local_id);
                }
                let relay = match self.relays.get(&info.rs_id) {
                    Some(known) => {
                        let mut relay = known.clone();
                        relay.update(info, connected);
                        relay
                    }
                    None => ReplicationServerInfo::from_rs_info(info, connected, configured),
                };
                (info.rs_id, relay)
            })
            .collect();

        Self {
            connected_relay: Some(connected_relay),
            replicas,
            relays,
        }
    }

    /// Snapshot with relay states replaced by the ones in a monitor reply.
    pub fn with_relay_states(&self, states: &BTreeMap<u32, ServerState>) -> Self {
        let mut next = self.clone();
        for (id, state) in states {
            if let Some(relay) = next.relays.get_mut(id) {
                relay.server_state = state.clone();
            }
        }
        next
    }

    /// Relay the snapshot was received through.
    pub fn connected_relay(&self) -> Option<u32> {
        self.connected_relay
    }

    /// Relays by id.
    pub fn relays(&self) -> &BTreeMap<u32, ReplicationServerInfo> {
        &self.relays
    }

    /// One relay.
    pub fn relay(&self, relay_id: u32) -> Option<&ReplicationServerInfo> {
        self.relays.get(&relay_id)
    }

    /// Other replicas by id; never contains the local replica.
    pub fn replicas(&self) -> &BTreeMap<u32, DsInfo> {
        &self.replicas
    }

    /// True if no relay is known.
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
}
