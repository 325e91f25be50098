//! # Packet
//!
//! A packet is a message type id followed by the serialized payload:
//!
//! ```text
//! [type id: i32 LE] [payload: N bytes]
//! ```
//!
//! Over UDP one datagram carries exactly one packet. Over TCP the packet is wrapped
//! in a length-prefixed frame by [`FrameCodec`](crate::core::codec::FrameCodec).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Width of the leading type id
pub const TYPE_ID_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub type_id: i32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(type_id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            payload: payload.into(),
        }
    }

    /// Number of bytes produced by [`Packet::to_bytes`]
    pub fn encoded_len(&self) -> usize {
        TYPE_ID_SIZE + self.payload.len()
    }

    /// Serialize as `type id || payload`
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_i32_le(self.type_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a packet from a borrowed slice, copying the payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::parse(Bytes::copy_from_slice(data))
    }

    /// Parse a packet without copying the payload
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.len() < TYPE_ID_SIZE {
            return Err(ProtocolError::UndersizedPacket(data.len()));
        }
        let header = data.split_to(TYPE_ID_SIZE);
        let type_id = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        Ok(Self {
            type_id,
            payload: data,
        })
    }
}
