//! Error types for the replication subsystem.

use dirsync_transport::TransportError;
use thiserror::Error;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// A relay answered with a message that does not fit the handshake step.
    #[error("protocol error: {msg}")]
    Protocol {
        /// What was expected and what arrived.
        msg: String,
    },

    /// Relay serves a different replicated base DN.
    #[error("base DN mismatch: local {local}, relay {relay}")]
    BaseDnMismatch {
        /// Base DN configured locally.
        local: String,
        /// Base DN announced by the relay.
        relay: String,
    },

    /// Frame carried a tag no message uses.
    #[error("unknown message type 0x{0:02X}")]
    UnknownMessageType(u8),

    /// A modification could not be applied.
    #[error("invalid modification of {attribute}: {reason}")]
    InvalidModification {
        /// Attribute description.
        attribute: String,
        /// Why it was rejected.
        reason: String,
    },

    /// INCREMENT cannot be resolved against a conflicting history.
    #[error("conflicting increment of {attribute} is not supported")]
    UnsupportedIncrement {
        /// Attribute description.
        attribute: String,
    },

    /// Target entry of a replayed operation is missing.
    #[error("entry {uuid} not found")]
    EntryNotFound {
        /// Entry unique id.
        uuid: uuid::Uuid,
    },

    /// Storage collaborator refused an operation.
    #[error("backend error: {msg}")]
    Backend {
        /// Error message from the backend.
        msg: String,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {msg}")]
    Config {
        /// What is wrong.
        msg: String,
    },

    /// Session transport error.
    #[error("transport error")]
    Transport(#[from] TransportError),

    /// The broker refused or failed a publish.
    #[error("publish failed")]
    Broker(#[from] BrokerError),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Replication was shut down.
    #[error("replication shut down")]
    Shutdown,
}

/// Outcome of a publish or receive that did not go through.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No relay session is available.
    #[error("not connected to a replication server")]
    NotConnected,

    /// Recovery of missed changes must finish before new changes go out.
    #[error("recovery of missed changes in progress")]
    RecoveryPending,

    /// The send window went away with the session it belonged to.
    #[error("send window closed")]
    WindowClosed,

    /// No message arrived within the receive timeout.
    #[error("receive timed out")]
    Timeout,

    /// The broker is shutting down.
    #[error("broker shut down")]
    Shutdown,

    /// The session failed while publishing.
    #[error("session failure")]
    Transport(#[source] TransportError),
}

impl BrokerError {
    /// True for conditions that clear up by themselves once a session is
    /// (re)established; false once the broker is shutting down.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BrokerError::Shutdown)
    }
}

/// Result alias for the replication subsystem.
pub type Result<T> = std::result::Result<T, ReplError>;
