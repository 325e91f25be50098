//! # Session Services
//!
//! The server and client built on top of the [`Messenger`](crate::protocol::Messenger).
//!
//! ## Session handshake
//! 1. Client connects over TCP; the server creates a peer with a fresh secret
//! 2. Server sends the secret, then its UDP port
//! 3. Client starts heartbeats and answers with its own UDP port and the secret
//! 4. Server records the client's UDP endpoint and confirms the connection
//!
//! Either side ends the session with an acknowledged disconnect message. The server
//! also drops peers whose heartbeats stop.

pub mod client;
pub mod events;
pub mod peer;
pub mod server;

pub use client::Client;
pub use events::{DisconnectReason, EventBus, NetworkEvent};
pub use peer::{ConnectionId, PeerInfo};
pub use server::Server;

/// Transport used for an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// Reliable, ordered control channel
    #[default]
    Tcp,
    /// Low-latency data channel; skipped until the UDP path is known
    Udp,
}
