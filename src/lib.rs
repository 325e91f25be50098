//! # hybrid-net
//!
//! Hybrid TCP/UDP session and messaging core for real-time client-server applications.
//!
//! A TCP control channel carries session setup; a UDP data channel carries low-latency
//! traffic. Selected messages are made reliable over either channel by an
//! application-level acknowledge protocol.
//!
//! ## Layers
//! - [`core`]: wire codec, packets, stream framing
//! - [`protocol`]: messages, type registry and the [`Messenger`] engine
//! - [`transport`]: recipients and receive loops
//! - [`service`]: [`Server`] and [`Client`] session state machines
//!
//! ## Example
//! ```rust,no_run
//! use hybrid_net::config::NetworkConfig;
//! use hybrid_net::protocol::MessageTypeRegistry;
//! use hybrid_net::service::{Client, Server};
//!
//! # async fn run() -> hybrid_net::error::Result<()> {
//! let server = Server::new(NetworkConfig::default(), MessageTypeRegistry::new())?;
//! server.start().await?;
//!
//! // Server and client share a host here, so the client takes another UDP port
//! let config = NetworkConfig::default_with_overrides(|c| c.client.local_udp_port = 25001);
//! let client = Client::new(config, MessageTypeRegistry::new())?;
//! client.connect("127.0.0.1", 26000).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};
pub use protocol::{MessageType, MessageTypeRegistry, Messenger};
pub use service::{Client, NetworkEvent, Protocol, Server};
pub use transport::Recipient;
