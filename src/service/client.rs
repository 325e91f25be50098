//! # Client
//!
//! Client side of a session: connects over TCP, receives its secret, sends heartbeats
//! and negotiates the UDP path with the server.
//!
//! Heartbeats start as soon as the secret arrives. They go over TCP until the server's
//! UDP endpoint is known and over UDP afterwards.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{validate_ip, validate_port, ClientConfig, NetworkConfig};
use crate::core::codec::FrameCodec;
use crate::core::packet::Packet;
use crate::error::constants::ERR_ALREADY_CONNECTED;
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::{OsTokenSource, TokenSource};
use crate::protocol::message::{
    system_ids, ClientSecretMessage, ClientSystemMessage, ClientUdpPortMessage, DisconnectMessage,
    NetMessage, ServerSystemKind, ServerSystemMessage, ServerUdpPortMessage, WireSerializer,
};
use crate::protocol::messenger::Messenger;
use crate::protocol::registry::{ConflictPolicy, MessageType, MessageTypeRegistry};
use crate::service::events::{DisconnectReason, EventBus, NetworkEvent};
use crate::service::Protocol;
use crate::transport::endpoint::{run_tcp_loop, run_udp_loop};
use crate::transport::recipient::Recipient;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout;

struct Session {
    generation: u64,
    server_addr: SocketAddr,
    tcp: Recipient,
    udp_socket: Arc<UdpSocket>,
    server_udp: Option<SocketAddr>,
    secret: Option<String>,
    established: bool,
    closing: bool,
    heartbeat_started: bool,
    udp_loop_started: bool,
    active: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// UDP once the server's endpoint is known, TCP before that
    fn preferred_recipient(&self) -> Recipient {
        match self.server_udp {
            Some(endpoint) => Recipient::datagram(self.udp_socket.clone(), endpoint),
            None => self.tcp.clone(),
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    messenger: Messenger,
    session: Mutex<Option<Session>>,
    next_generation: AtomicU64,
}

/// Cheaply cloneable client handle.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a disconnected client. Application types must already be in `registry`.
    pub fn new(config: NetworkConfig, registry: MessageTypeRegistry) -> Result<Self> {
        Self::with_token_source(config, registry, Arc::new(OsTokenSource))
    }

    /// Like [`Client::new`], drawing acknowledge tokens from `tokens`
    pub fn with_token_source(
        config: NetworkConfig,
        registry: MessageTypeRegistry,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self> {
        config.client.validate_strict()?;
        config.messenger.validate_strict()?;

        let messenger = Messenger::builder(Arc::new(registry))
            .config(config.messenger)
            .token_source(tokens)
            .events(EventBus::new())
            .build()?;

        let inner = Arc::new(ClientInner {
            config: config.client,
            messenger,
            session: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        });
        ClientInner::register_handlers(&inner)?;
        Ok(Self { inner })
    }

    /// Connect to a server's TCP endpoint and start the session.
    ///
    /// The local UDP socket is bound here so bind failures surface to the caller.
    #[instrument(skip(self))]
    pub async fn connect(&self, ip: &str, port: u32) -> Result<()> {
        let ip = validate_ip(ip)?;
        let port = validate_port(port)?;
        if self.is_connected() {
            return Err(ProtocolError::TransportError(ERR_ALREADY_CONNECTED.to_string()));
        }

        let server_addr = SocketAddr::new(ip, port);
        let unspecified = match ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let udp_addr = SocketAddr::new(unspecified, self.inner.config.local_udp_port);
        let udp_socket = Arc::new(
            UdpSocket::bind(udp_addr)
                .await
                .map_err(|e| ProtocolError::TransportError(format!("Failed to bind UDP {udp_addr}: {e}")))?,
        );
        let stream = TcpStream::connect(server_addr)
            .await
            .map_err(|e| ProtocolError::TransportError(format!("Failed to connect to {server_addr}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let codec = FrameCodec::new(self.inner.messenger.config().max_frame_size);
        let tcp = Recipient::stream(write_half, codec, Some(server_addr));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicBool::new(true));
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);

        {
            let mut session = self.inner.session();
            if session.is_some() {
                return Err(ProtocolError::TransportError(ERR_ALREADY_CONNECTED.to_string()));
            }
            *session = Some(Session {
                generation,
                server_addr,
                tcp: tcp.clone(),
                udp_socket,
                server_udp: None,
                secret: None,
                established: false,
                closing: false,
                heartbeat_started: false,
                udp_loop_started: false,
                active: active.clone(),
                shutdown,
            });
        }

        let messenger = self.inner.messenger.clone();
        messenger.start();
        messenger.metrics().peer_connected();

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let exit = run_tcp_loop(read_half, codec, messenger, tcp, active, shutdown_rx).await;
            trace!(?exit, "TCP receive loop ended");
            if let Some(inner) = weak.upgrade() {
                inner.end_session(DisconnectReason::ConnectionClosed, Some(generation));
            }
        });

        info!(%server_addr, "Connected");
        Ok(())
    }

    /// Leave the session with an acknowledged disconnect message.
    ///
    /// Local resources are released once the server confirms, or after the configured
    /// disconnect timeout, whichever comes first.
    pub async fn disconnect(&self) -> Result<()> {
        let (secret, recipient) = {
            let mut session = self.inner.session();
            let session = session.as_mut().ok_or(ProtocolError::NotConnected)?;
            session.closing = true;
            (
                session.secret.clone().unwrap_or_default(),
                session.preferred_recipient(),
            )
        };

        let messenger = &self.inner.messenger;
        let message = DisconnectMessage::new(secret, messenger.new_ack_request()?);
        let result = with_timeout(
            self.inner.config.disconnect_timeout,
            messenger.send_and_wait(&recipient, &message),
        )
        .await;
        self.inner.end_session(DisconnectReason::ClientRequested, None);

        match result {
            // The server closed the connection before its acknowledgement arrived
            Err(ProtocolError::NotConnected) => Ok(()),
            other => other,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session().is_some()
    }

    /// Whether the server confirmed both paths
    pub fn is_established(&self) -> bool {
        self.inner.session().as_ref().is_some_and(|s| s.established)
    }

    pub fn secret(&self) -> Option<String> {
        self.inner.session().as_ref().and_then(|s| s.secret.clone())
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.inner.session().as_ref().map(|s| s.server_addr)
    }

    pub fn server_udp_endpoint(&self) -> Option<SocketAddr> {
        self.inner.session().as_ref().and_then(|s| s.server_udp)
    }

    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.inner
            .session()
            .as_ref()
            .and_then(|s| s.udp_socket.local_addr().ok())
    }

    pub fn events(&self) -> &EventBus {
        self.inner.messenger.events()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        self.inner.messenger.metrics()
    }

    pub fn messenger(&self) -> &Messenger {
        &self.inner.messenger
    }

    /// Send a heartbeat now, over UDP when available
    pub async fn send_heartbeat(&self) -> Result<()> {
        self.inner.send_heartbeat().await
    }

    /// Send an object to the server.
    ///
    /// Returns `Ok(None)` when the type has no serializer or, for UDP, when the server's
    /// UDP endpoint is not known yet.
    pub async fn send<T: NetMessage>(&self, object: &T, protocol: Protocol) -> Result<Option<Bytes>> {
        match self.inner.recipient(protocol)? {
            Some(recipient) => self.inner.messenger.send(&recipient, object).await,
            None => Ok(None),
        }
    }

    pub async fn send_bytes(&self, data: Bytes, protocol: Protocol) -> Result<Option<Bytes>> {
        match self.inner.recipient(protocol)? {
            Some(recipient) => {
                self.inner.messenger.send_bytes(&recipient, data.clone()).await?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    pub async fn send_packet(&self, packet: &Packet, protocol: Protocol) -> Result<Option<Bytes>> {
        self.send_bytes(packet.to_bytes(), protocol).await
    }

    /// Send a reliable object and wait for the server's acknowledgement
    pub async fn send_and_wait<T: NetMessage>(&self, object: &T, protocol: Protocol) -> Result<()> {
        let recipient = self
            .inner
            .recipient(protocol)?
            .ok_or(ProtocolError::NotConnected)?;
        self.inner.messenger.send_and_wait(&recipient, object).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.server_addr())
            .field("established", &self.is_established())
            .finish()
    }
}

impl ClientInner {
    fn register_handlers(inner: &Arc<Self>) -> Result<()> {
        let registry = inner.messenger.registry();

        registry.register_with_id(
            system_ids::CLIENT_UDP_PORT,
            MessageType::new::<ClientUdpPortMessage>()
                .serializer(WireSerializer::new())
                .build(),
            ConflictPolicy::Override,
        )?;
        registry.register_with_id(
            system_ids::CLIENT_SYSTEM,
            MessageType::new::<ClientSystemMessage>()
                .serializer(WireSerializer::new())
                .build(),
            ConflictPolicy::Override,
        )?;

        let weak = Arc::downgrade(inner);
        registry.register_with_id(
            system_ids::CLIENT_SECRET,
            MessageType::new::<ClientSecretMessage>()
                .serializer(WireSerializer::new())
                .handler(move |message, _sender| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_secret(message);
                    }
                })
                .build(),
            ConflictPolicy::Override,
        )?;

        let weak = Arc::downgrade(inner);
        registry.register_with_id(
            system_ids::SERVER_UDP_PORT,
            MessageType::new::<ServerUdpPortMessage>()
                .serializer(WireSerializer::new())
                .handler(move |message, _sender| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_server_udp_port(message);
                    }
                })
                .build(),
            ConflictPolicy::Override,
        )?;

        let weak = Arc::downgrade(inner);
        registry.register_with_id(
            system_ids::SERVER_SYSTEM,
            MessageType::new::<ServerSystemMessage>()
                .serializer(WireSerializer::new())
                .handler(move |message, _sender| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_server_system(message);
                    }
                })
                .build(),
            ConflictPolicy::Override,
        )?;

        let weak = Arc::downgrade(inner);
        registry.register_with_id(
            system_ids::DISCONNECT,
            MessageType::new::<DisconnectMessage>()
                .serializer(WireSerializer::new())
                .handler(move |message, _sender| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_disconnect(message);
                    }
                })
                .build(),
            ConflictPolicy::Override,
        )?;
        Ok(())
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn recipient(&self, protocol: Protocol) -> Result<Option<Recipient>> {
        let session = self.session();
        let session = session.as_ref().ok_or(ProtocolError::NotConnected)?;
        Ok(match protocol {
            Protocol::Tcp => Some(session.tcp.clone()),
            Protocol::Udp => session
                .server_udp
                .map(|endpoint| Recipient::datagram(session.udp_socket.clone(), endpoint)),
        })
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let (secret, recipient) = {
            let session = self.session();
            let session = session.as_ref().ok_or(ProtocolError::NotConnected)?;
            let secret = session.secret.clone().ok_or(ProtocolError::NotConnected)?;
            (secret, session.preferred_recipient())
        };
        self.messenger
            .send(&recipient, &ClientSystemMessage::heartbeat(secret))
            .await?;
        Ok(())
    }

    fn handle_secret(self: &Arc<Self>, message: &ClientSecretMessage) {
        let heartbeat = {
            let mut session = self.session();
            let Some(session) = session.as_mut() else {
                return;
            };
            session.secret = Some(message.secret.clone());
            if session.heartbeat_started {
                None
            } else {
                session.heartbeat_started = true;
                Some((session.active.clone(), session.shutdown.subscribe()))
            }
        };
        debug!("Received session secret");

        if let Some((active, shutdown)) = heartbeat {
            tokio::spawn(Self::heartbeat_loop(
                Arc::downgrade(self),
                self.config.heartbeat_interval,
                active,
                shutdown,
            ));
        }
    }

    fn handle_server_udp_port(self: &Arc<Self>, message: &ServerUdpPortMessage) {
        let plan = {
            let mut session = self.session();
            let Some(session) = session.as_mut() else {
                return;
            };
            if session.secret.as_deref().is_some_and(|s| s != message.secret) {
                warn!("Ignoring server UDP port for a different session");
                return;
            }
            session.server_udp = Some(SocketAddr::new(session.server_addr.ip(), message.port));
            let udp_loop = if session.udp_loop_started {
                None
            } else {
                session.udp_loop_started = true;
                Some((session.active.clone(), session.shutdown.subscribe()))
            };
            (
                session.secret.clone(),
                session.tcp.clone(),
                session.udp_socket.clone(),
                udp_loop,
            )
        };
        let (secret, tcp, udp_socket, udp_loop) = plan;
        debug!(port = message.port, "Received server UDP port");

        if let Some((active, shutdown)) = udp_loop {
            tokio::spawn(run_udp_loop(
                udp_socket.clone(),
                self.messenger.clone(),
                active,
                shutdown,
            ));
        }

        let Some(secret) = secret else {
            warn!("Server UDP port arrived before the session secret");
            return;
        };
        let port = match udp_socket.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!(error = %e, "Local UDP socket has no address");
                return;
            }
        };
        let messenger = self.messenger.clone();
        tokio::spawn(async move {
            if let Err(e) = messenger
                .send(&tcp, &ClientUdpPortMessage { secret, port })
                .await
            {
                debug!(error = %e, "Failed to announce UDP port");
            }
        });
    }

    fn handle_server_system(&self, message: &ServerSystemMessage) {
        match message.kind {
            ServerSystemKind::ConnectionEstablished => {
                let server = {
                    let mut session = self.session();
                    let Some(session) = session.as_mut() else {
                        return;
                    };
                    let first = !session.established;
                    session.established = true;
                    first.then_some(session.server_addr)
                };
                if let Some(server) = server {
                    info!(%server, "Connection established");
                    self.messenger
                        .events()
                        .publish(NetworkEvent::ConnectionEstablished { server });
                }
            }
        }
    }

    fn handle_disconnect(&self, message: &DisconnectMessage) {
        let matches = self
            .session()
            .as_ref()
            .is_some_and(|s| s.secret.as_deref() == Some(message.secret.as_str()));
        if matches {
            self.end_session(DisconnectReason::ServerRequested, None);
        } else {
            debug!("Disconnect with foreign secret ignored");
        }
    }

    /// Tear the session down once. With `generation` set, only that session is ended.
    fn end_session(&self, reason: DisconnectReason, generation: Option<u64>) -> bool {
        let session = {
            let mut slot = self.session();
            let stale = matches!(
                (slot.as_ref(), generation),
                (Some(current), Some(generation)) if current.generation != generation
            );
            if stale {
                None
            } else {
                slot.take()
            }
        };
        let Some(session) = session else {
            return false;
        };

        let reason = if session.closing {
            DisconnectReason::ClientRequested
        } else {
            reason
        };
        session.active.store(false, Ordering::SeqCst);
        session.shutdown.send_replace(true);
        self.messenger.stop();

        let tcp = session.tcp.clone();
        tokio::spawn(async move { tcp.close().await });

        self.messenger.metrics().peer_disconnected();
        info!(server = %session.server_addr, ?reason, "Session ended");
        self.messenger
            .events()
            .publish(NetworkEvent::SessionEnded { reason });
        true
    }

    async fn heartbeat_loop(
        weak: Weak<Self>,
        period: Duration,
        active: Arc<AtomicBool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if !active.load(Ordering::SeqCst) {
                        break;
                    }
                    let Some(inner) = weak.upgrade() else { break };
                    if let Err(e) = inner.send_heartbeat().await {
                        debug!(error = %e, "Heartbeat failed");
                    }
                }
            }
        }
        trace!("Heartbeat loop stopped");
    }
}
