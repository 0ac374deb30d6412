#![warn(missing_docs)]

//! dirsync transport subsystem: framed replication sessions over TCP and in-process channels

pub mod error;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod tcp;

pub use error::{Result, TransportError};
pub use memory::{MemoryListener, MemoryNetwork, MemorySession};
pub use protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE};
pub use session::{Connector, Session};
pub use tcp::{TcpConnector, TcpSession, TcpSessionConfig, TcpSessionListener};
