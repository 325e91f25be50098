//! # Messages
//!
//! Application objects travel as typed messages. Any `Send + Sync + 'static` type can be
//! a message once it implements [`NetMessage`] and has an [`ObjectSerializer`] registered
//! for it in the [`MessageTypeRegistry`](crate::protocol::registry::MessageTypeRegistry).
//!
//! A message opts into reliable delivery by returning an [`AcknowledgeRequest`] from
//! [`NetMessage::acknowledge_request`]. The receiving messenger answers every such
//! message with an [`AcknowledgeResponse`] carrying the same token.
//!
//! The built-in session messages live here as well, together with their reserved
//! negative type ids in [`system_ids`].

use std::marker::PhantomData;
use std::time::Duration;

use crate::config::DEFAULT_ACK_RETRIES;
use crate::core::serialization::{DataBuilder, DataReader, WireEnum};
use crate::error::Result;
use crate::utils::timeout::ACK_TIMEOUT;

/// Reserved type ids of the built-in session messages.
///
/// Application types registered without an explicit id are numbered from 0 upward,
/// so they never collide with these.
pub mod system_ids {
    pub const ACKNOWLEDGE_RESPONSE: i32 = -1;
    pub const CLIENT_SECRET: i32 = -2;
    pub const SERVER_UDP_PORT: i32 = -3;
    pub const CLIENT_UDP_PORT: i32 = -4;
    pub const CLIENT_SYSTEM: i32 = -5;
    pub const SERVER_SYSTEM: i32 = -6;
    pub const DISCONNECT: i32 = -7;
}

/// Capability trait for every object sent through a messenger.
pub trait NetMessage: Send + Sync + 'static {
    /// Reliable-delivery request carried by this message, if any
    fn acknowledge_request(&self) -> Option<&AcknowledgeRequest> {
        None
    }

    /// Set only by [`AcknowledgeResponse`]
    fn acknowledge_response(&self) -> Option<&AcknowledgeResponse> {
        None
    }
}

/// Bidirectional codec for one message type.
pub trait ObjectSerializer<T>: Send + Sync {
    fn serialize(&self, object: &T, builder: &mut DataBuilder) -> Result<()>;

    fn deserialize(&self, reader: &mut DataReader<'_>) -> Result<T>;
}

/// Types that know their own wire layout.
///
/// Pair with [`WireSerializer`] to register them without writing a serializer type.
pub trait WireFormat: Sized {
    fn write(&self, builder: &mut DataBuilder);

    fn read(reader: &mut DataReader<'_>) -> Result<Self>;
}

/// [`ObjectSerializer`] for any [`WireFormat`] type
pub struct WireSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> WireSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for WireSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: WireFormat> ObjectSerializer<T> for WireSerializer<T> {
    fn serialize(&self, object: &T, builder: &mut DataBuilder) -> Result<()> {
        object.write(builder);
        Ok(())
    }

    fn deserialize(&self, reader: &mut DataReader<'_>) -> Result<T> {
        T::read(reader)
    }
}

/// Reliable-delivery request attached to an outbound message.
///
/// Only the token is transmitted. The timeout and retry bound steer the local retry
/// loop and fall back to the defaults on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgeRequest {
    pub ack_token: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl AcknowledgeRequest {
    /// Request with the default timeout and retry bound
    pub fn new(ack_token: impl Into<String>) -> Self {
        Self {
            ack_token: ack_token.into(),
            timeout: ACK_TIMEOUT,
            max_retries: DEFAULT_ACK_RETRIES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl WireFormat for AcknowledgeRequest {
    fn write(&self, builder: &mut DataBuilder) {
        builder.string(&self.ack_token);
    }

    fn read(reader: &mut DataReader<'_>) -> Result<Self> {
        Ok(Self::new(reader.string()?))
    }
}

/// Confirms receipt of the message that carried the same token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgeResponse {
    pub ack_token: String,
}

impl AcknowledgeResponse {
    pub fn new(ack_token: impl Into<String>) -> Self {
        Self {
            ack_token: ack_token.into(),
        }
    }
}

impl NetMessage for AcknowledgeResponse {
    fn acknowledge_response(&self) -> Option<&AcknowledgeResponse> {
        Some(self)
    }
}

impl WireFormat for AcknowledgeResponse {
    fn write(&self, builder: &mut DataBuilder) {
        builder.string(&self.ack_token);
    }

    fn read(reader: &mut DataReader<'_>) -> Result<Self> {
        Ok(Self::new(reader.string()?))
    }
}

/// Server to client over TCP: the session secret issued on accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSecretMessage {
    pub secret: String,
}

impl NetMessage for ClientSecretMessage {}

impl WireFormat for ClientSecretMessage {
    fn write(&self, builder: &mut DataBuilder) {
        builder.string(&self.secret);
    }

    fn read(reader: &mut DataReader<'_>) -> Result<Self> {
        Ok(Self {
            secret: reader.string()?,
        })
    }
}

/// Server to client over TCP: the server's local UDP port, tagged with the session secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUdpPortMessage {
    pub secret: String,
    pub port: u16,
}

impl NetMessage for ServerUdpPortMessage {}

impl WireFormat for ServerUdpPortMessage {
    fn write(&self, builder: &mut DataBuilder) {
        builder.string(&self.secret).u16(self.port);
    }

    fn read(reader: &mut DataReader<'_>) -> Result<Self> {
        Ok(Self {
            secret: reader.string()?,
            port: reader.u16()?,
        })
    }
}

/// Client to server over TCP: the client's local UDP port, authenticated by its secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientUdpPortMessage {
    pub secret: String,
    pub port: u16,
}

impl NetMessage for ClientUdpPortMessage {}

impl WireFormat for ClientUdpPortMessage {
    fn write(&self, builder: &mut DataBuilder) {
        builder.string(&self.secret).u16(self.port);
    }

    fn read(reader: &mut DataReader<'_>) -> Result<Self> {
        let secret = reader.string()?;
        let port = reader.u16()?;
        Ok(Self { secret, port })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSystemKind {
    Heartbeat,
}

impl WireEnum for ClientSystemKind {
    fn discriminant(self) -> i64 {
        match self {
            ClientSystemKind::Heartbeat => 0,
        }
    }

    fn from_discriminant(value: i64) -> Option<Self> {
        match value {
            0 => Some(ClientSystemKind::Heartbeat),
            _ => None,
        }
    }
}

/// Client to server control message, currently only heartbeats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSystemMessage {
    pub kind: ClientSystemKind,
    pub secret: String,
}

impl ClientSystemMessage {
    pub fn heartbeat(secret: impl Into<String>) -> Self {
        Self {
            kind: ClientSystemKind::Heartbeat,
            secret: secret.into(),
        }
    }
}

impl NetMessage for ClientSystemMessage {}

impl WireFormat for ClientSystemMessage {
    fn write(&self, builder: &mut DataBuilder) {
        builder.enumeration(self.kind).string(&self.secret);
    }

    fn read(reader: &mut DataReader<'_>) -> Result<Self> {
        let kind = reader.enumeration()?;
        let secret = reader.string()?;
        Ok(Self { kind, secret })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSystemKind {
    ConnectionEstablished,
}

impl WireEnum for ServerSystemKind {
    fn discriminant(self) -> i64 {
        match self {
            ServerSystemKind::ConnectionEstablished => 0,
        }
    }

    fn from_discriminant(value: i64) -> Option<Self> {
        match value {
            0 => Some(ServerSystemKind::ConnectionEstablished),
            _ => None,
        }
    }
}

/// Server to client control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSystemMessage {
    pub kind: ServerSystemKind,
}

impl ServerSystemMessage {
    pub fn connection_established() -> Self {
        Self {
            kind: ServerSystemKind::ConnectionEstablished,
        }
    }
}

impl NetMessage for ServerSystemMessage {}

impl WireFormat for ServerSystemMessage {
    fn write(&self, builder: &mut DataBuilder) {
        builder.enumeration(self.kind);
    }

    fn read(reader: &mut DataReader<'_>) -> Result<Self> {
        Ok(Self {
            kind: reader.enumeration()?,
        })
    }
}

/// Ends a session. Always sent as an acknowledge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectMessage {
    pub secret: String,
    pub ack: AcknowledgeRequest,
}

impl DisconnectMessage {
    pub fn new(secret: impl Into<String>, ack: AcknowledgeRequest) -> Self {
        Self {
            secret: secret.into(),
            ack,
        }
    }
}

impl NetMessage for DisconnectMessage {
    fn acknowledge_request(&self) -> Option<&AcknowledgeRequest> {
        Some(&self.ack)
    }
}

impl WireFormat for DisconnectMessage {
    fn write(&self, builder: &mut DataBuilder) {
        builder.string(&self.secret);
        self.ack.write(builder);
    }

    fn read(reader: &mut DataReader<'_>) -> Result<Self> {
        let secret = reader.string()?;
        let ack = AcknowledgeRequest::read(reader)?;
        Ok(Self { secret, ack })
    }
}
