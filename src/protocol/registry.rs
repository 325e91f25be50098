//! # Message Type Registry
//!
//! Maps application object types to numeric type ids, serializers and optional
//! handlers. Lookups by id serve the receive path, lookups by Rust type serve the send
//! path. Misses return `None`.
//!
//! Registration normally happens once at startup. The table sits behind an `RwLock`
//! so the server and client can add their session handlers after the application has
//! registered its own types.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::core::serialization::{DataBuilder, DataReader};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{AcknowledgeRequest, AcknowledgeResponse, NetMessage, ObjectSerializer};
use crate::transport::recipient::Recipient;

type HandlerFn = dyn Fn(&(dyn Any + Send + Sync), &Recipient) + Send + Sync + 'static;

/// A deserialized message with its acknowledge capabilities lifted out.
pub struct Decoded {
    pub object: Box<dyn Any + Send + Sync>,
    pub ack_request: Option<AcknowledgeRequest>,
    pub ack_response: Option<AcknowledgeResponse>,
}

trait ErasedSerializer: Send + Sync {
    fn serialize(&self, object: &dyn Any, builder: &mut DataBuilder) -> Result<()>;

    fn deserialize(&self, reader: &mut DataReader<'_>) -> Result<Decoded>;
}

struct TypedSerializer<T, S> {
    inner: S,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S> ErasedSerializer for TypedSerializer<T, S>
where
    T: NetMessage,
    S: ObjectSerializer<T>,
{
    fn serialize(&self, object: &dyn Any, builder: &mut DataBuilder) -> Result<()> {
        let object = object.downcast_ref::<T>().ok_or_else(|| {
            ProtocolError::InvalidData(format!("expected an object of type {}", type_name::<T>()))
        })?;
        self.inner.serialize(object, builder)
    }

    fn deserialize(&self, reader: &mut DataReader<'_>) -> Result<Decoded> {
        let object = self.inner.deserialize(reader)?;
        Ok(Decoded {
            ack_request: object.acknowledge_request().cloned(),
            ack_response: object.acknowledge_response().cloned(),
            object: Box::new(object),
        })
    }
}

/// Serializer and handler for one object type.
///
/// Build one with [`MessageType::new`]:
///
/// ```rust
/// use hybrid_net::protocol::message::{ClientSecretMessage, WireSerializer};
/// use hybrid_net::protocol::registry::{MessageType, MessageTypeRegistry};
///
/// let registry = MessageTypeRegistry::new();
/// let id = registry
///     .register(
///         MessageType::new::<ClientSecretMessage>()
///             .serializer(WireSerializer::new())
///             .handler(|message, _sender| println!("secret {}", message.secret))
///             .build(),
///     )
///     .unwrap();
/// assert_eq!(id, 0);
/// ```
pub struct MessageType {
    id: i32,
    object_type: TypeId,
    type_name: &'static str,
    serializer: Option<Arc<dyn ErasedSerializer>>,
    handler: Option<Arc<HandlerFn>>,
}

impl MessageType {
    #[allow(clippy::new_ret_no_self)]
    pub fn new<T: NetMessage>() -> MessageTypeBuilder<T> {
        MessageTypeBuilder {
            serializer: None,
            handler: None,
            _marker: PhantomData,
        }
    }

    /// Id assigned at registration
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn has_serializer(&self) -> bool {
        self.serializer.is_some()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub(crate) fn serialize(&self, object: &dyn Any, builder: &mut DataBuilder) -> Result<()> {
        match &self.serializer {
            Some(serializer) => serializer.serialize(object, builder),
            None => Err(ProtocolError::MissingSerializer(self.id)),
        }
    }

    pub(crate) fn deserialize(&self, reader: &mut DataReader<'_>) -> Result<Decoded> {
        match &self.serializer {
            Some(serializer) => serializer.deserialize(reader),
            None => Err(ProtocolError::MissingSerializer(self.id)),
        }
    }

    /// Invoke the handler, returning whether one was registered
    pub(crate) fn invoke(&self, object: &(dyn Any + Send + Sync), sender: &Recipient) -> bool {
        match &self.handler {
            Some(handler) => {
                handler(object, sender);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageType")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("serializer", &self.serializer.is_some())
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

pub struct MessageTypeBuilder<T> {
    serializer: Option<Arc<dyn ErasedSerializer>>,
    handler: Option<Arc<HandlerFn>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: NetMessage> MessageTypeBuilder<T> {
    pub fn serializer<S>(mut self, serializer: S) -> Self
    where
        S: ObjectSerializer<T> + 'static,
    {
        self.serializer = Some(Arc::new(TypedSerializer {
            inner: serializer,
            _marker: PhantomData::<fn() -> T>,
        }));
        self
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&T, &Recipient) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(move |object, sender| {
            if let Some(object) = object.downcast_ref::<T>() {
                handler(object, sender);
            }
        }));
        self
    }

    pub fn build(self) -> MessageType {
        MessageType {
            id: 0,
            object_type: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            serializer: self.serializer,
            handler: self.handler,
        }
    }
}

/// What to do when an explicit id is already taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Replace the existing registration
    #[default]
    Override,
    /// Ignore the new registration and return the existing id
    KeepOld,
    /// Register under the next free id instead
    GenerateNew,
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<i32, Arc<MessageType>>,
    by_type: HashMap<TypeId, i32>,
}

impl Tables {
    fn next_free_id(&self) -> i32 {
        (0..)
            .find(|id| !self.by_id.contains_key(id))
            .unwrap_or(i32::MAX)
    }

    fn insert(&mut self, id: i32, mut message_type: MessageType) -> i32 {
        if let Some(old) = self.by_id.remove(&id) {
            if self.by_type.get(&old.object_type) == Some(&id) {
                self.by_type.remove(&old.object_type);
            }
        }
        if let Some(previous) = self.by_type.remove(&message_type.object_type) {
            self.by_id.remove(&previous);
        }
        message_type.id = id;
        self.by_type.insert(message_type.object_type, id);
        self.by_id.insert(id, Arc::new(message_type));
        id
    }
}

/// Registry of message types, keyed by id and by Rust type.
#[derive(Default)]
pub struct MessageTypeRegistry {
    tables: RwLock<Tables>,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the smallest unused non-negative id.
    ///
    /// Registering a type that is already known replaces it and keeps its id.
    pub fn register(&self, message_type: MessageType) -> Result<i32> {
        let mut tables = self.write()?;
        let id = match tables.by_type.get(&message_type.object_type) {
            Some(&existing) => existing,
            None => tables.next_free_id(),
        };
        debug!(type_id = id, type_name = message_type.type_name, "Registered message type");
        Ok(tables.insert(id, message_type))
    }

    /// Register under an explicit id, resolving a clash with `policy`.
    pub fn register_with_id(
        &self,
        id: i32,
        message_type: MessageType,
        policy: ConflictPolicy,
    ) -> Result<i32> {
        let mut tables = self.write()?;
        let taken = tables.by_id.contains_key(&id);
        let id = match (taken, policy) {
            (false, _) | (true, ConflictPolicy::Override) => id,
            (true, ConflictPolicy::KeepOld) => {
                debug!(type_id = id, type_name = message_type.type_name, "Kept existing message type");
                return Ok(id);
            }
            (true, ConflictPolicy::GenerateNew) => tables.next_free_id(),
        };
        debug!(type_id = id, type_name = message_type.type_name, "Registered message type");
        Ok(tables.insert(id, message_type))
    }

    pub fn resolve_by_id(&self, id: i32) -> Option<Arc<MessageType>> {
        self.tables.read().ok()?.by_id.get(&id).cloned()
    }

    pub fn resolve_by_object_type<T: 'static>(&self) -> Option<Arc<MessageType>> {
        let tables = self.tables.read().ok()?;
        let id = tables.by_type.get(&TypeId::of::<T>())?;
        tables.by_id.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| ProtocolError::Custom("Failed to acquire write lock on message type registry".to_string()))
    }
}

impl std::fmt::Debug for MessageTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTypeRegistry")
            .field("types", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{ClientSecretMessage, ServerUdpPortMessage, WireSerializer};

    fn secret_type() -> MessageType {
        MessageType::new::<ClientSecretMessage>()
            .serializer(WireSerializer::new())
            .build()
    }

    fn port_type() -> MessageType {
        MessageType::new::<ServerUdpPortMessage>()
            .serializer(WireSerializer::new())
            .build()
    }

    #[test]
    fn test_auto_ids_start_at_zero() {
        let registry = MessageTypeRegistry::new();
        assert_eq!(registry.register(secret_type()).unwrap(), 0);
        assert_eq!(registry.register(port_type()).unwrap(), 1);
        assert_eq!(registry.register(secret_type()).unwrap(), 0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_builder_parts_are_optional() {
        let bare = MessageType::new::<ClientSecretMessage>().build();
        assert!(!bare.has_serializer());
        assert!(!bare.has_handler());

        let full = MessageType::new::<ClientSecretMessage>()
            .serializer(WireSerializer::new())
            .handler(|_, _| {})
            .build();
        assert!(full.has_serializer());
        assert!(full.has_handler());
        assert!(full.type_name().ends_with("ClientSecretMessage"));
    }

    #[test]
    fn test_conflict_policies() {
        let registry = MessageTypeRegistry::new();
        registry
            .register_with_id(7, secret_type(), ConflictPolicy::Override)
            .unwrap();

        let kept = registry
            .register_with_id(7, port_type(), ConflictPolicy::KeepOld)
            .unwrap();
        assert_eq!(kept, 7);
        assert!(registry.resolve_by_object_type::<ServerUdpPortMessage>().is_none());

        let fresh = registry
            .register_with_id(7, port_type(), ConflictPolicy::GenerateNew)
            .unwrap();
        assert_eq!(fresh, 0);
        assert_eq!(registry.resolve_by_id(7).unwrap().type_name(), type_name::<ClientSecretMessage>());

        registry
            .register_with_id(7, port_type(), ConflictPolicy::Override)
            .unwrap();
        assert!(registry.resolve_by_object_type::<ClientSecretMessage>().is_none());
        assert_eq!(registry.resolve_by_object_type::<ServerUdpPortMessage>().unwrap().id(), 7);
        assert!(registry.resolve_by_id(0).is_none());
    }

    #[test]
    fn test_misses_return_none() {
        let registry = MessageTypeRegistry::new();
        assert!(registry.resolve_by_id(3).is_none());
        assert!(registry.resolve_by_object_type::<ClientSecretMessage>().is_none());
    }
}
