//! # Core Protocol Components
//!
//! Binary encoding, packets and stream framing.
//!
//! ## Components
//! - **Serialization**: typed little-endian builder and reader
//! - **Packet**: message type id plus payload
//! - **Codec**: Tokio codec for length-prefixed framing over byte streams
//!
//! ## Wire Format
//! ```text
//! TCP: [Length(4)] [TypeId(4)] [Payload(N)]
//! UDP:             [TypeId(4)] [Payload(N)]
//! ```
//!
//! All integers are little-endian. Frame lengths are validated before allocation.

pub mod codec;
pub mod packet;
pub mod serialization;
