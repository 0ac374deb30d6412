//! Replication messages exchanged between a replica and its relay.
//!
//! Every message is one transport frame: the frame tag is the
//! [`MessageType`] and the payload is the bincode encoding of the message
//! body. Messages are decoded once, at the session boundary, into the closed
//! [`ReplicationMsg`] enum.

use crate::clock::LogicalClock;
use crate::entry::{AttrDescription, Modification};
use crate::error::ReplError;
use crate::state::ServerState;
use dirsync_transport::Frame;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Replication protocol version spoken by this broker.
pub const PROTOCOL_VERSION: u16 = 4;

/// First protocol version whose relays understand change-time heartbeats.
pub const CHANGE_TIME_HEARTBEAT_MIN_VERSION: u16 = 3;

/// Generation id meaning "no data yet".
pub const NO_GENERATION_ID: i64 = -1;

/// Replication message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Phase-1 start sent by a replica
    ServerStart = 0x01,
    /// Phase-1 reply from a relay
    ReplServerStart = 0x02,
    /// Phase-2 start sent by a replica
    StartSession = 0x03,
    /// Topology snapshot (phase-2 reply and later broadcasts)
    Topology = 0x04,
    /// Replicated change
    Update = 0x10,
    /// Assured-replication acknowledgment
    Ack = 0x11,
    /// Send-window credit
    Window = 0x20,
    /// Probe for a window that looks closed
    WindowProbe = 0x21,
    /// Liveness ping
    Heartbeat = 0x30,
    /// Liveness ping carrying the sender's clock
    ChangeTimeHeartbeat = 0x31,
    /// Replica is going offline
    ReplicaOffline = 0x32,
    /// Request for monitoring data
    MonitorRequest = 0x40,
    /// Monitoring data
    Monitor = 0x41,
    /// Status change request or notification
    ChangeStatus = 0x50,
    /// Peer is closing the session cleanly
    Stop = 0x60,
}

impl TryFrom<u8> for MessageType {
    type Error = ReplError;

    fn try_from(value: u8) -> Result<Self, ReplError> {
        match value {
            0x01 => Ok(Self::ServerStart),
            0x02 => Ok(Self::ReplServerStart),
            0x03 => Ok(Self::StartSession),
            0x04 => Ok(Self::Topology),
            0x10 => Ok(Self::Update),
            0x11 => Ok(Self::Ack),
            0x20 => Ok(Self::Window),
            0x21 => Ok(Self::WindowProbe),
            0x30 => Ok(Self::Heartbeat),
            0x31 => Ok(Self::ChangeTimeHeartbeat),
            0x32 => Ok(Self::ReplicaOffline),
            0x40 => Ok(Self::MonitorRequest),
            0x41 => Ok(Self::Monitor),
            0x50 => Ok(Self::ChangeStatus),
            0x60 => Ok(Self::Stop),
            other => Err(ReplError::UnknownMessageType(other)),
        }
    }
}

/// Status of a replica as announced to its relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServerStatus {
    /// No session.
    #[default]
    NotConnected,
    /// Replicating normally.
    Normal,
    /// Too far behind its relay.
    Degraded,
    /// Being re-initialized.
    FullUpdate,
    /// Generation id differs from the relay's.
    BadGenerationId,
}

/// Assured-replication flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AssuredMode {
    /// Wait until enough servers stored the change.
    #[default]
    SafeData,
    /// Wait until the change is replayed on every replica.
    SafeRead,
}

/// Phase-1 start: who the replica is and where it stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStartMsg {
    /// Local replica id.
    pub server_id: u32,
    /// Replicated base DN.
    pub base_dn: String,
    /// URL of the local server.
    pub server_url: String,
    /// Receive window offered to the relay.
    pub window_size: u32,
    /// Heartbeat interval the relay should use (ms).
    pub heartbeat_interval_ms: u64,
    /// Local server state.
    pub server_state: ServerState,
    /// Local generation id.
    pub generation_id: i64,
    /// Local group id.
    pub group_id: u8,
    /// Protocol version.
    pub protocol_version: u16,
    /// Whether updates should be encrypted.
    pub ssl_encryption: bool,
}

/// Phase-1 reply: the relay's identity and state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplServerStartMsg {
    /// Relay id.
    pub server_id: u32,
    /// URL of the relay.
    pub server_url: String,
    /// Base DN the relay serves.
    pub base_dn: String,
    /// Window the relay grants the replica.
    pub window_size: u32,
    /// Relay's view of every replica.
    pub server_state: ServerState,
    /// Relay generation id.
    pub generation_id: i64,
    /// Relay group id.
    pub group_id: u8,
    /// Relay weight.
    pub weight: u32,
    /// Replicas currently connected to the relay.
    pub connected_replicas: Vec<u32>,
    /// Protocol version.
    pub protocol_version: u16,
    /// Relay's degraded-status threshold.
    pub degraded_status_threshold: u32,
}

/// Phase-2 start: the replica's status and preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSessionMsg {
    /// Initial status.
    pub status: ServerStatus,
    /// Referral URLs of the local server.
    pub referral_urls: Vec<String>,
    /// Whether assured replication is on.
    pub assured: bool,
    /// Assured flavor.
    pub assured_mode: AssuredMode,
    /// Safe-data level.
    pub safe_data_level: u8,
}

/// A replica as seen in a topology snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsInfo {
    /// Replica id.
    pub ds_id: u32,
    /// Relay the replica is connected to.
    pub rs_id: u32,
    /// Replica generation id.
    pub generation_id: i64,
    /// Replica status.
    pub status: ServerStatus,
    /// Whether assured replication is on.
    pub assured: bool,
    /// Assured flavor.
    pub assured_mode: AssuredMode,
    /// Safe-data level.
    pub safe_data_level: u8,
    /// Group id.
    pub group_id: u8,
    /// Referral URLs.
    pub referral_urls: Vec<String>,
    /// Protocol version.
    pub protocol_version: u16,
}

/// A relay as seen in a topology snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsInfo {
    /// Relay id.
    pub rs_id: u32,
    /// URL of the relay.
    pub server_url: String,
    /// Relay generation id.
    pub generation_id: i64,
    /// Relay group id.
    pub group_id: u8,
    /// Relay weight.
    pub weight: u32,
}

/// Topology snapshot: every other replica and every relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyMsg {
    /// Replicas (never includes the receiving replica).
    pub replicas: Vec<DsInfo>,
    /// Relays.
    pub relays: Vec<RsInfo>,
}

/// Request for monitoring data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRequestMsg {
    /// Requesting replica.
    pub sender_id: u32,
    /// Relay asked.
    pub destination: u32,
}

/// Monitoring data: the relay's view of every replica and relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorMsg {
    /// Sending relay.
    pub sender_id: u32,
    /// Server state per replica.
    pub replica_states: BTreeMap<u32, ServerState>,
    /// Server state per relay.
    pub relay_states: BTreeMap<u32, ServerState>,
}

/// Send-window credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowMsg {
    /// Number of permits restored.
    pub num_ack: u32,
}

/// Assured-replication acknowledgment of one update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMsg {
    /// Acknowledged change.
    pub clock: LogicalClock,
    /// Some servers did not answer in time.
    pub has_timeout: bool,
    /// Some servers were in a status that cannot acknowledge.
    pub has_wrong_status: bool,
    /// Some servers failed to replay the change.
    pub has_replay_error: bool,
    /// Servers that failed.
    pub failed_servers: Vec<u32>,
}

impl AckMsg {
    /// Plain success acknowledgment.
    pub fn ok(clock: LogicalClock) -> Self {
        Self {
            clock,
            has_timeout: false,
            has_wrong_status: false,
            has_replay_error: false,
            failed_servers: Vec::new(),
        }
    }

    /// True if any error flag is set.
    pub fn has_errors(&self) -> bool {
        self.has_timeout || self.has_wrong_status || self.has_replay_error
    }
}

/// Status change request (replica to relay) or order (relay to replica).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatusMsg {
    /// Status the sender asks for.
    pub requested_status: ServerStatus,
    /// Status the sender moved to.
    pub new_status: ServerStatus,
}

/// Operation-specific part of an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePayload {
    /// Entry creation.
    Add {
        /// Unique id of the parent entry, if known.
        parent_uuid: Option<Uuid>,
        /// Attributes of the new entry.
        attributes: Vec<(AttrDescription, Vec<String>)>,
    },
    /// Attribute modifications.
    Modify {
        /// Modifications in order.
        mods: Vec<Modification>,
    },
    /// Rename or move.
    ModifyDn {
        /// New RDN.
        new_rdn: String,
        /// Whether the old RDN value is removed.
        delete_old_rdn: bool,
        /// New parent DN, if moved.
        new_superior: Option<String>,
    },
    /// Entry removal.
    Delete,
}

/// A replicated change.
///
/// Compared, hashed and ordered by clock alone, so updates sort into replay
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMsg {
    /// Change number.
    pub clock: LogicalClock,
    /// Target DN at origination time.
    pub dn: String,
    /// Target entry unique id.
    pub entry_uuid: Uuid,
    /// Whether the originator waits for an acknowledgment.
    pub assured: bool,
    /// Assured flavor.
    pub assured_mode: AssuredMode,
    /// Safe-data level.
    pub safe_data_level: u8,
    /// Operation-specific part.
    pub payload: UpdatePayload,
}

impl UpdateMsg {
    /// Non-assured update.
    pub fn new(clock: LogicalClock, dn: &str, entry_uuid: Uuid, payload: UpdatePayload) -> Self {
        Self {
            clock,
            dn: dn.to_string(),
            entry_uuid,
            assured: false,
            assured_mode: AssuredMode::default(),
            safe_data_level: 1,
            payload,
        }
    }

    /// Short operation name for logs.
    pub fn operation(&self) -> &'static str {
        match self.payload {
            UpdatePayload::Add { .. } => "add",
            UpdatePayload::Modify { .. } => "modify",
            UpdatePayload::ModifyDn { .. } => "moddn",
            UpdatePayload::Delete => "delete",
        }
    }
}

impl PartialEq for UpdateMsg {
    fn eq(&self, other: &Self) -> bool {
        self.clock == other.clock
    }
}

impl Eq for UpdateMsg {}

impl Hash for UpdateMsg {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.clock.hash(state);
    }
}

impl Ord for UpdateMsg {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock.cmp(&other.clock)
    }
}

impl PartialOrd for UpdateMsg {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Every message a replica and a relay exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationMsg {
    /// Phase-1 start.
    ServerStart(ServerStartMsg),
    /// Phase-1 reply.
    ReplServerStart(ReplServerStartMsg),
    /// Phase-2 start.
    StartSession(StartSessionMsg),
    /// Topology snapshot.
    Topology(TopologyMsg),
    /// Replicated change.
    Update(UpdateMsg),
    /// Assured acknowledgment.
    Ack(AckMsg),
    /// Window credit.
    Window(WindowMsg),
    /// Window probe.
    WindowProbe,
    /// Liveness ping.
    Heartbeat,
    /// Liveness ping carrying the sender's clock.
    ChangeTimeHeartbeat(LogicalClock),
    /// Replica going offline, with its last clock.
    ReplicaOffline(LogicalClock),
    /// Monitoring request.
    MonitorRequest(MonitorRequestMsg),
    /// Monitoring data.
    Monitor(MonitorMsg),
    /// Status change.
    ChangeStatus(ChangeStatusMsg),
    /// Clean session close.
    Stop,
}

impl ReplicationMsg {
    /// Wire type of the message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ServerStart(_) => MessageType::ServerStart,
            Self::ReplServerStart(_) => MessageType::ReplServerStart,
            Self::StartSession(_) => MessageType::StartSession,
            Self::Topology(_) => MessageType::Topology,
            Self::Update(_) => MessageType::Update,
            Self::Ack(_) => MessageType::Ack,
            Self::Window(_) => MessageType::Window,
            Self::WindowProbe => MessageType::WindowProbe,
            Self::Heartbeat => MessageType::Heartbeat,
            Self::ChangeTimeHeartbeat(_) => MessageType::ChangeTimeHeartbeat,
            Self::ReplicaOffline(_) => MessageType::ReplicaOffline,
            Self::MonitorRequest(_) => MessageType::MonitorRequest,
            Self::Monitor(_) => MessageType::Monitor,
            Self::ChangeStatus(_) => MessageType::ChangeStatus,
            Self::Stop => MessageType::Stop,
        }
    }

    /// True for data messages, the only ones subject to the send window.
    pub fn is_update(&self) -> bool {
        matches!(self, Self::Update(_))
    }

    /// Encode into a transport frame.
    pub fn to_frame(&self) -> Result<Frame, ReplError> {
        let payload = match self {
            Self::ServerStart(m) => bincode::serialize(m)?,
            Self::ReplServerStart(m) => bincode::serialize(m)?,
            Self::StartSession(m) => bincode::serialize(m)?,
            Self::Topology(m) => bincode::serialize(m)?,
            Self::Update(m) => bincode::serialize(m)?,
            Self::Ack(m) => bincode::serialize(m)?,
            Self::Window(m) => bincode::serialize(m)?,
            Self::ChangeTimeHeartbeat(c) | Self::ReplicaOffline(c) => bincode::serialize(c)?,
            Self::MonitorRequest(m) => bincode::serialize(m)?,
            Self::Monitor(m) => bincode::serialize(m)?,
            Self::ChangeStatus(m) => bincode::serialize(m)?,
            Self::WindowProbe | Self::Heartbeat | Self::Stop => Vec::new(),
        };
        Ok(Frame::new(self.message_type() as u8, payload))
    }

    /// Decode a transport frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, ReplError> {
        let body = frame.payload.as_slice();
        let msg = match MessageType::try_from(frame.tag())? {
            MessageType::ServerStart => Self::ServerStart(decode(body)?),
            MessageType::ReplServerStart => Self::ReplServerStart(decode(body)?),
            MessageType::StartSession => Self::StartSession(decode(body)?),
            MessageType::Topology => Self::Topology(decode(body)?),
            MessageType::Update => Self::Update(decode(body)?),
            MessageType::Ack => Self::Ack(decode(body)?),
            MessageType::Window => Self::Window(decode(body)?),
            MessageType::WindowProbe => Self::WindowProbe,
            MessageType::Heartbeat => Self::Heartbeat,
            MessageType::ChangeTimeHeartbeat => Self::ChangeTimeHeartbeat(decode(body)?),
            MessageType::ReplicaOffline => Self::ReplicaOffline(decode(body)?),
            MessageType::MonitorRequest => Self::MonitorRequest(decode(body)?),
            MessageType::Monitor => Self::Monitor(decode(body)?),
            MessageType::ChangeStatus => Self::ChangeStatus(decode(body)?),
            MessageType::Stop => Self::Stop,
        };
        Ok(msg)
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ReplError> {
    Ok(bincode::deserialize(body)?)
}
