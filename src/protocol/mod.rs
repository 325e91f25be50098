//! # Protocol Layer
//!
//! Message definitions, the type registry, token generation and the [`Messenger`]
//! that ties them to transports.
//!
//! ## Flow
//! 1. A receive loop hands raw packet bytes to [`Messenger::handle`]
//! 2. The type id resolves a [`MessageType`](registry::MessageType) in the registry
//! 3. The payload is deserialized and acknowledge bookkeeping applied
//! 4. The registered handler runs with the object and its sender

pub mod handshake;
pub mod message;
pub mod messenger;
pub mod registry;

pub use messenger::{Dispatch, DropReason, Messenger};
pub use registry::{ConflictPolicy, MessageType, MessageTypeRegistry};
