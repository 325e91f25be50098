//! # Messenger
//!
//! The protocol engine shared by servers and clients. It serializes objects through
//! the [`MessageTypeRegistry`], transmits them to a [`Recipient`], dispatches inbound
//! bytes to handlers and runs the acknowledge protocol:
//!
//! - Every inbound message carrying an [`AcknowledgeRequest`] is answered with an
//!   [`AcknowledgeResponse`] before its handler runs.
//! - Every outbound message carrying an [`AcknowledgeRequest`] is tracked in the pending
//!   table until the matching response arrives.
//! - A background retry loop resends unanswered messages every `timeout` and gives up
//!   after `max_retries` resends, following the configured [`DeliveryFailurePolicy`].
//!
//! Malformed or unroutable input never escapes [`Messenger::handle`]; it is dropped,
//! logged at `debug` and counted.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::config::{DeliveryFailurePolicy, MessengerConfig};
use crate::core::packet::Packet;
use crate::core::serialization::{DataBuilder, DataReader};
use crate::error::constants::{ERR_NO_ACK_REQUEST, ERR_PENDING_LOCK};
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::{OsTokenSource, TokenSource};
use crate::protocol::message::{
    system_ids, AcknowledgeRequest, AcknowledgeResponse, NetMessage, WireSerializer,
};
use crate::protocol::registry::{ConflictPolicy, MessageType, MessageTypeRegistry};
use crate::service::events::{EventBus, NetworkEvent};
use crate::transport::recipient::Recipient;
use crate::utils::metrics::Metrics;

type Waiter = oneshot::Sender<Result<()>>;

/// Outcome of [`Messenger::handle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Deserialized and passed through acknowledge bookkeeping and the handler
    Dispatched(i32),
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Shorter than a type id
    Undersized(usize),
    UnknownType(i32),
    MissingSerializer(i32),
    /// The payload did not deserialize
    Malformed(i32),
}

/// A reliable message awaiting its acknowledge response
struct PendingAcknowledgeRequest {
    request: AcknowledgeRequest,
    recipient: Recipient,
    data: Bytes,
    tries: u32,
    last_try: Instant,
    waiter: Option<Waiter>,
}

/// Work done by one pass of the retry loop
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryReport {
    pub resent: Vec<String>,
    pub failed: Vec<String>,
}

struct Inner {
    registry: Arc<MessageTypeRegistry>,
    config: MessengerConfig,
    tokens: Arc<dyn TokenSource>,
    events: EventBus,
    metrics: Arc<Metrics>,
    pending: Mutex<HashMap<String, PendingAcknowledgeRequest>>,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// Cheaply cloneable handle to one protocol engine.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<Inner>,
}

pub struct MessengerBuilder {
    registry: Arc<MessageTypeRegistry>,
    config: MessengerConfig,
    tokens: Arc<dyn TokenSource>,
    events: EventBus,
    metrics: Arc<Metrics>,
}

impl MessengerBuilder {
    pub fn config(mut self, config: MessengerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Registers the acknowledge response type and returns the messenger, stopped.
    pub fn build(self) -> Result<Messenger> {
        self.registry.register_with_id(
            system_ids::ACKNOWLEDGE_RESPONSE,
            MessageType::new::<AcknowledgeResponse>()
                .serializer(WireSerializer::new())
                .build(),
            ConflictPolicy::Override,
        )?;

        Ok(Messenger {
            inner: Arc::new(Inner {
                registry: self.registry,
                config: self.config,
                tokens: self.tokens,
                events: self.events,
                metrics: self.metrics,
                pending: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                shutdown: Mutex::new(None),
            }),
        })
    }
}

impl Messenger {
    pub fn builder(registry: Arc<MessageTypeRegistry>) -> MessengerBuilder {
        MessengerBuilder {
            registry,
            config: MessengerConfig::default(),
            tokens: Arc::new(OsTokenSource),
            events: EventBus::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Messenger with default configuration, OS entropy and its own event bus
    pub fn new(registry: Arc<MessageTypeRegistry>) -> Result<Self> {
        Self::builder(registry).build()
    }

    pub fn registry(&self) -> &Arc<MessageTypeRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn token_source(&self) -> &Arc<dyn TokenSource> {
        &self.inner.tokens
    }

    /// Fresh acknowledge request using the configured timeout and retry bound
    pub fn new_ack_request(&self) -> Result<AcknowledgeRequest> {
        Ok(AcknowledgeRequest::new(self.inner.tokens.token()?)
            .with_timeout(self.inner.config.ack_timeout)
            .with_max_retries(self.inner.config.ack_max_retries))
    }

    /// Send already-encoded packet bytes
    pub async fn send_bytes(&self, recipient: &Recipient, data: Bytes) -> Result<()> {
        let len = data.len() as u64;
        recipient.send(data).await?;
        self.inner.metrics.message_sent(len);
        Ok(())
    }

    /// Send a packet, returning the bytes transmitted
    pub async fn send_packet(&self, recipient: &Recipient, packet: &Packet) -> Result<Bytes> {
        let data = packet.to_bytes();
        self.send_bytes(recipient, data.clone()).await?;
        Ok(data)
    }

    /// Serialize and send an object.
    ///
    /// Returns `Ok(None)` when no serializer is registered for `T`. Objects carrying an
    /// acknowledge request are tracked before the first transmission.
    pub async fn send<T: NetMessage>(&self, recipient: &Recipient, object: &T) -> Result<Option<Bytes>> {
        let Some(data) = self.encode(object)? else {
            return Ok(None);
        };
        let request = object.acknowledge_request().cloned();
        self.transmit(recipient, data.clone(), request, None).await?;
        Ok(Some(data))
    }

    /// Send a reliable object and wait until it is acknowledged or its retries run out.
    ///
    /// Wrap in [`with_timeout`](crate::utils::timeout::with_timeout) to bound the wait
    /// independently of the retry policy.
    pub async fn send_and_wait<T: NetMessage>(&self, recipient: &Recipient, object: &T) -> Result<()> {
        let request = object
            .acknowledge_request()
            .cloned()
            .ok_or_else(|| ProtocolError::Custom(ERR_NO_ACK_REQUEST.to_string()))?;
        let data = self.encode(object)?.ok_or_else(|| {
            ProtocolError::Custom(format!("No serializer registered for {}", type_name::<T>()))
        })?;

        let (tx, rx) = oneshot::channel();
        self.transmit(recipient, data, Some(request), Some(tx)).await?;
        rx.await.map_err(|_| ProtocolError::NotConnected)?
    }

    fn encode<T: NetMessage>(&self, object: &T) -> Result<Option<Bytes>> {
        let message_type = match self.inner.registry.resolve_by_object_type::<T>() {
            Some(message_type) if message_type.has_serializer() => message_type,
            _ => {
                debug!(type_name = type_name::<T>(), "No serializer registered, not sending");
                return Ok(None);
            }
        };

        let mut builder = DataBuilder::new();
        message_type.serialize(object, &mut builder)?;
        Ok(Some(Packet::new(message_type.id(), builder.freeze()).to_bytes()))
    }

    async fn transmit(
        &self,
        recipient: &Recipient,
        data: Bytes,
        request: Option<AcknowledgeRequest>,
        waiter: Option<Waiter>,
    ) -> Result<()> {
        let Some(request) = request else {
            return self.send_bytes(recipient, data).await;
        };

        let token = request.ack_token.clone();
        self.track(request, recipient.clone(), data.clone(), waiter)?;
        if let Err(e) = self.send_bytes(recipient, data).await {
            self.pending()?.remove(&token);
            return Err(e);
        }
        Ok(())
    }

    fn track(
        &self,
        request: AcknowledgeRequest,
        recipient: Recipient,
        data: Bytes,
        waiter: Option<Waiter>,
    ) -> Result<()> {
        let mut pending = self.pending()?;
        if pending.contains_key(&request.ack_token) {
            return Err(ProtocolError::DuplicateAckToken(request.ack_token));
        }
        trace!(token = %request.ack_token, %recipient, "Tracking acknowledge request");
        pending.insert(
            request.ack_token.clone(),
            PendingAcknowledgeRequest {
                request,
                recipient,
                data,
                tries: 0,
                last_try: Instant::now(),
                waiter,
            },
        );
        self.inner.metrics.ack_requested();
        Ok(())
    }

    /// Entry point for every inbound packet.
    pub async fn handle(&self, data: Bytes, sender: &Recipient) -> Dispatch {
        let len = data.len();
        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(_) => return self.drop_packet(DropReason::Undersized(len), sender),
        };
        let type_id = packet.type_id;

        let Some(message_type) = self.inner.registry.resolve_by_id(type_id) else {
            return self.drop_packet(DropReason::UnknownType(type_id), sender);
        };
        if !message_type.has_serializer() {
            return self.drop_packet(DropReason::MissingSerializer(type_id), sender);
        }

        let decoded = match message_type.deserialize(&mut DataReader::new(&packet.payload)) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(type_id, error = %e, "Failed to deserialize payload");
                return self.drop_packet(DropReason::Malformed(type_id), sender);
            }
        };
        self.inner.metrics.message_received(len as u64);

        if let Some(request) = &decoded.ack_request {
            let response = AcknowledgeResponse::new(request.ack_token.clone());
            if let Err(e) = self.send(sender, &response).await {
                debug!(token = %request.ack_token, %sender, error = %e, "Failed to send acknowledge response");
            }
        }
        if let Some(response) = &decoded.ack_response {
            self.acknowledge(&response.ack_token);
        }

        let object: &(dyn std::any::Any + Send + Sync) = &*decoded.object;
        message_type.invoke(object, sender);
        Dispatch::Dispatched(type_id)
    }

    fn drop_packet(&self, reason: DropReason, sender: &Recipient) -> Dispatch {
        debug!(?reason, %sender, "Dropped inbound packet");
        self.inner.metrics.packet_dropped();
        Dispatch::Dropped(reason)
    }

    /// Resolve a pending request. Unknown tokens are ignored.
    ///
    /// Returns whether an entry was removed.
    pub fn acknowledge(&self, token: &str) -> bool {
        let entry = match self.pending() {
            Ok(mut pending) => pending.remove(token),
            Err(e) => {
                warn!(error = %e, "Acknowledge skipped");
                None
            }
        };
        let Some(entry) = entry else {
            trace!(token, "Acknowledge for unknown token");
            return false;
        };

        debug!(token, tries = entry.tries, "Acknowledged");
        self.inner.metrics.ack_confirmed();
        if let Some(waiter) = entry.waiter {
            let _ = waiter.send(Ok(()));
        }
        true
    }

    pub fn is_pending(&self, token: &str) -> bool {
        self.pending().map(|p| p.contains_key(token)).unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().map(|p| p.len()).unwrap_or(0)
    }

    /// Retry bookkeeping for one tick at `now`.
    ///
    /// Entries whose timeout elapsed are resent and their `tries` incremented. An entry
    /// that is due again after `max_retries` resends is removed and reported as failed.
    pub async fn process_retries(&self, now: Instant) -> RetryReport {
        let (due, exhausted) = match self.pending() {
            Ok(mut pending) => {
                let mut due = Vec::new();
                let mut marked = Vec::new();
                for (token, entry) in pending.iter_mut() {
                    if now.saturating_duration_since(entry.last_try) < entry.request.timeout {
                        continue;
                    }
                    if entry.tries >= entry.request.max_retries {
                        marked.push(token.clone());
                        continue;
                    }
                    entry.tries += 1;
                    entry.last_try = now;
                    due.push((token.clone(), entry.recipient.clone(), entry.data.clone(), entry.tries));
                }
                let exhausted: Vec<_> = marked
                    .into_iter()
                    .filter_map(|token| pending.remove(&token).map(|entry| (token, entry)))
                    .collect();
                (due, exhausted)
            }
            Err(e) => {
                warn!(error = %e, "Retry pass skipped");
                return RetryReport::default();
            }
        };

        let mut report = RetryReport::default();
        for (token, recipient, data, tries) in due {
            debug!(%token, tries, %recipient, "Resending unacknowledged message");
            self.inner.metrics.ack_retry();
            if let Err(e) = self.send_bytes(&recipient, data).await {
                debug!(%token, error = %e, "Resend failed");
            }
            report.resent.push(token);
        }

        for (token, entry) in exhausted {
            self.fail_delivery(&token, entry);
            report.failed.push(token);
        }
        report
    }

    fn fail_delivery(&self, token: &str, entry: PendingAcknowledgeRequest) {
        self.inner.metrics.delivery_failed();
        match self.inner.config.delivery_failure {
            DeliveryFailurePolicy::Silent => {
                debug!(token, tries = entry.tries, "Delivery failed");
            }
            DeliveryFailurePolicy::Report => {
                warn!(token, tries = entry.tries, recipient = %entry.recipient, "Delivery failed");
                self.inner.events.publish(NetworkEvent::DeliveryFailed {
                    token: token.to_string(),
                    tries: entry.tries,
                    recipient: entry.recipient.to_string(),
                });
            }
        }
        if let Some(waiter) = entry.waiter {
            let _ = waiter.send(Err(ProtocolError::DeliveryFailed {
                token: token.to_string(),
                tries: entry.tries,
            }));
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the retry loop. Calling it on a running messenger does nothing.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        match self.inner.shutdown.lock() {
            Ok(mut slot) => *slot = Some(tx),
            Err(poisoned) => *poisoned.into_inner() = Some(tx),
        }

        let weak = Arc::downgrade(&self.inner);
        let tick = self.inner.config.retry_tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let messenger = Messenger { inner };
                        if !messenger.is_running() {
                            break;
                        }
                        messenger.process_retries(Instant::now()).await;
                    }
                }
            }
            trace!("Retry loop stopped");
        });
    }

    /// Stop the retry loop and abandon every pending request.
    ///
    /// Callers blocked in [`Messenger::send_and_wait`] get [`ProtocolError::NotConnected`].
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let sender = match self.inner.shutdown.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
        let abandoned = self.pending().map(|mut p| p.drain().count()).unwrap_or(0);
        debug!(abandoned, "Messenger stopped");
    }

    fn pending(&self) -> Result<MutexGuard<'_, HashMap<String, PendingAcknowledgeRequest>>> {
        self.inner
            .pending
            .lock()
            .map_err(|_| ProtocolError::Custom(ERR_PENDING_LOCK.to_string()))
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("running", &self.is_running())
            .field("pending", &self.pending_count())
            .finish()
    }
}
