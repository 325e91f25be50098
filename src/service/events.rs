//! # Lifecycle Events
//!
//! Closed set of events published by servers, clients and messengers. Observers
//! subscribe a callback on the [`EventBus`]; every callback sees every event in
//! publication order for its publisher.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::error::constants::ERR_EVENT_BUS_LOCK;
use crate::service::peer::ConnectionId;

/// Why a peer or session went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No heartbeat within the configured timeout
    HeartbeatTimeout,
    /// The client sent a disconnect message
    ClientRequested,
    /// The server sent a disconnect message
    ServerRequested,
    /// The TCP connection closed or failed
    ConnectionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    ServerStarted {
        tcp_addr: SocketAddr,
        udp_addr: SocketAddr,
    },
    ServerStopped,
    PeerConnected {
        peer: ConnectionId,
        addr: SocketAddr,
    },
    PeerDisconnected {
        peer: ConnectionId,
        secret: String,
        reason: DisconnectReason,
    },
    UdpPathsExchanged {
        peer: ConnectionId,
        secret: String,
        udp_endpoint: SocketAddr,
    },
    /// Client side: the server confirmed both paths
    ConnectionEstablished {
        server: SocketAddr,
    },
    /// Client side: the session was torn down
    SessionEnded {
        reason: DisconnectReason,
    },
    /// A reliable message exhausted its retries
    DeliveryFailed {
        token: String,
        tries: u32,
        recipient: String,
    },
}

impl NetworkEvent {
    /// Stable event name for log sinks and dashboards
    pub fn name(&self) -> &'static str {
        match self {
            NetworkEvent::ServerStarted { .. } => "server_started",
            NetworkEvent::ServerStopped => "server_stopped",
            NetworkEvent::PeerConnected { .. } => "peer_connected",
            NetworkEvent::PeerDisconnected { .. } => "peer_disconnected",
            NetworkEvent::UdpPathsExchanged { .. } => "udp_paths_exchanged",
            NetworkEvent::ConnectionEstablished { .. } => "connection_established",
            NetworkEvent::SessionEnded { .. } => "session_ended",
            NetworkEvent::DeliveryFailed { .. } => "delivery_failed",
        }
    }
}

type Listener = dyn Fn(&NetworkEvent) + Send + Sync + 'static;

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(SubscriptionId, Arc<Listener>)>,
}

/// Observer registry shared by a server or client and its messenger.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Listeners>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = SubscriptionId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the subscription existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry, _)| *entry != id);
        listeners.entries.len() != before
    }

    /// Deliver an event to every subscriber.
    ///
    /// Callbacks run outside the lock, so they may subscribe or unsubscribe.
    pub fn publish(&self, event: NetworkEvent) {
        debug!(event = event.name(), ?event, "Network event");
        let snapshot: Vec<Arc<Listener>> = match self.listeners.read() {
            Ok(listeners) => listeners.entries.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => {
                warn!("{}", ERR_EVENT_BUS_LOCK);
                return;
            }
        };
        for listener in snapshot {
            listener(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().map(|l| l.entries.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = bus.subscribe(move |event| {
            if event.name() == "server_stopped" {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.publish(NetworkEvent::ServerStopped);
        bus.publish(NetworkEvent::SessionEnded {
            reason: DisconnectReason::ConnectionClosed,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(NetworkEvent::ServerStopped);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_subscribe_during_publish() {
        let bus = EventBus::new();
        let inner = bus.clone();
        bus.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        bus.publish(NetworkEvent::ServerStopped);
        assert_eq!(bus.subscriber_count(), 2);
    }
}
