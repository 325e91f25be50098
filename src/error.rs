//! # Error Types
//!
//! Error handling for the hybrid TCP/UDP messaging core.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`ProtocolError`].
//!
//! ## Error Categories
//! - **Configuration**: invalid addresses or ports, rejected at construction time
//! - **Transport**: bind, connect and socket failures, surfaced to the caller
//! - **Protocol**: undersized or malformed packets, unknown message types. These
//!   never escape a receive loop; the offending message is dropped.
//! - **Delivery**: acknowledge retries exhausted for a reliable message
//!
//! ## Example Usage
//! ```rust
//! use hybrid_net::core::serialization::DataReader;
//! use hybrid_net::error::{ProtocolError, Result};
//!
//! fn read_port(data: &[u8]) -> Result<u16> {
//!     DataReader::new(data).u16()
//! }
//!
//! match read_port(&[0x01]) {
//!     Err(ProtocolError::UnexpectedEof { needed, remaining }) => {
//!         assert_eq!((needed, remaining), (2, 1));
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lock errors
    pub const ERR_PENDING_LOCK: &str = "Failed to acquire lock on pending acknowledge table";
    pub const ERR_PEER_TABLE_LOCK: &str = "Failed to acquire lock on peer table";
    pub const ERR_EVENT_BUS_LOCK: &str = "Failed to acquire lock on event bus";

    /// Configuration errors
    pub const ERR_INVALID_PORT: &str = "Invalid port. Port must be between 1 and 65535";
    pub const ERR_INVALID_ADDRESS: &str = "Invalid IP address";

    /// Session errors
    pub const ERR_ALREADY_STARTED: &str = "Server is already running";
    pub const ERR_ALREADY_CONNECTED: &str = "Client is already connected";
    pub const ERR_NO_ACK_REQUEST: &str = "Message does not carry an acknowledge request";
    pub const ERR_SECRET_EXHAUSTED: &str = "Could not generate a unique peer secret";
}

/// ProtocolError is the primary error type for all crate operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Packet too small: {0} bytes")]
    UndersizedPacket(usize),

    #[error("Unknown message type id: {0}")]
    UnknownMessageType(i32),

    #[error("No serializer registered for message type id {0}")]
    MissingSerializer(i32),

    #[error("Acknowledge token already pending: {0}")]
    DuplicateAckToken(String),

    #[error("Delivery failed for token {token} after {tries} tries")]
    DeliveryFailed { token: String, tries: u32 },

    #[error("Not connected")]
    NotConnected,

    #[error("Unknown peer")]
    UnknownPeer,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error describes malformed or unroutable input.
    ///
    /// Such errors are dropped inside receive loops instead of being propagated.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnexpectedEof { .. }
                | ProtocolError::InvalidData(_)
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::UndersizedPacket(_)
                | ProtocolError::UnknownMessageType(_)
                | ProtocolError::MissingSerializer(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
