#![warn(missing_docs)]

//! dirsync replication subsystem: multi-master directory replication through relay servers
//!
//! A [`ReplicationDomain`] replicates one base DN. Its [`ReplicationBroker`]
//! holds the session to the best relay, exchanges the start handshake,
//! enforces flow control and keeps heartbeats going. Received updates are
//! replayed against the per-entry [`EntryHistory`], which resolves conflicts
//! deterministically from [`LogicalClock`] order.

pub mod backend;
pub mod broker;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod domain;
pub mod election;
pub mod entry;
pub mod error;
pub mod flowcontrol;
pub mod heartbeat;
pub mod history;
pub mod listener;
pub mod protocol;
pub mod session;
pub mod state;
pub mod topology;

pub use backend::{MemoryBackend, ReplayedOperation, ReplicaBackend};
pub use broker::{BrokerState, DomainState, ReceiveOptions, ReplicationBroker, SessionEvent};
pub use clock::{ClockGenerator, LogicalClock};
pub use config::{BrokerConfig, ReplicationConfig};
pub use domain::{MonitorSnapshot, PublishOutcome, ReplicationDomain};
pub use entry::{AttrDescription, Entry, Modification, ModificationType};
pub use error::{BrokerError, ReplError};
pub use history::EntryHistory;
pub use listener::spawn_listener;
pub use protocol::ReplicationMsg;
pub use state::ServerState;
pub use topology::{ReplicationServerInfo, Topology};
