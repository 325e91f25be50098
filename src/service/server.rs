//! # Server
//!
//! Accepts TCP connections, issues session secrets, learns each peer's UDP endpoint
//! and drops peers whose heartbeats stop.
//!
//! ## Tasks
//! - accept loop on the TCP listener
//! - one TCP receive loop per peer
//! - one UDP receive loop on the shared server socket; datagrams are attributed to
//!   peers by the secret they carry
//! - heartbeat sweep
//! - the messenger's acknowledge retry loop
//!
//! Every task holds only a weak reference to the server, so dropping the last
//! [`Server`] handle stops them all.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{NetworkConfig, ServerConfig};
use crate::core::codec::FrameCodec;
use crate::core::packet::Packet;
use crate::error::constants::{ERR_ALREADY_STARTED, ERR_PEER_TABLE_LOCK, ERR_SECRET_EXHAUSTED};
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::{OsTokenSource, TokenSource};
use crate::protocol::message::{
    system_ids, ClientSecretMessage, ClientSystemKind, ClientSystemMessage, ClientUdpPortMessage,
    DisconnectMessage, NetMessage, ServerSystemMessage, ServerUdpPortMessage, WireSerializer,
};
use crate::protocol::messenger::Messenger;
use crate::protocol::registry::{ConflictPolicy, MessageType, MessageTypeRegistry};
use crate::service::events::{DisconnectReason, EventBus, NetworkEvent};
use crate::service::peer::{ConnectionId, Peer, PeerInfo, PeerTable};
use crate::service::Protocol;
use crate::transport::endpoint::{run_tcp_loop, run_udp_loop, LoopExit};
use crate::transport::recipient::Recipient;
use crate::utils::metrics::Metrics;

/// Secret generation attempts before giving up on a collision-free value
const SECRET_ATTEMPTS: usize = 8;

struct Running {
    tcp_addr: SocketAddr,
    udp_socket: Arc<UdpSocket>,
    active: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

struct ServerInner {
    config: ServerConfig,
    messenger: Messenger,
    secrets: Arc<dyn TokenSource>,
    peers: Mutex<PeerTable>,
    next_id: AtomicU64,
    running: Mutex<Option<Running>>,
}

/// Cheaply cloneable server handle.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a stopped server. Application types must already be in `registry`.
    pub fn new(config: NetworkConfig, registry: MessageTypeRegistry) -> Result<Self> {
        Self::with_token_source(config, registry, Arc::new(OsTokenSource))
    }

    /// Like [`Server::new`], drawing secrets and acknowledge tokens from `tokens`
    pub fn with_token_source(
        config: NetworkConfig,
        registry: MessageTypeRegistry,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self> {
        config.server.validate_strict()?;
        config.messenger.validate_strict()?;

        let messenger = Messenger::builder(Arc::new(registry))
            .config(config.messenger)
            .token_source(tokens.clone())
            .events(EventBus::new())
            .build()?;

        let inner = Arc::new(ServerInner {
            config: config.server,
            messenger,
            secrets: tokens,
            peers: Mutex::new(PeerTable::new()),
            next_id: AtomicU64::new(1),
            running: Mutex::new(None),
        });
        ServerInner::register_handlers(&inner)?;
        Ok(Self { inner })
    }

    /// Bind the TCP listener and UDP socket and launch the server tasks.
    #[instrument(skip(self), fields(address = %self.inner.config.address))]
    pub async fn start(&self) -> Result<()> {
        let addr = self.inner.config.socket_addr()?;
        if self.is_running() {
            return Err(ProtocolError::TransportError(ERR_ALREADY_STARTED.to_string()));
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProtocolError::TransportError(format!("Failed to bind TCP {addr}: {e}")))?;
        let udp_addr = SocketAddr::new(addr.ip(), self.inner.config.local_udp_port);
        let udp_socket = Arc::new(
            UdpSocket::bind(udp_addr)
                .await
                .map_err(|e| ProtocolError::TransportError(format!("Failed to bind UDP {udp_addr}: {e}")))?,
        );
        let tcp_addr = listener.local_addr()?;
        let udp_addr = udp_socket.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicBool::new(true));
        {
            let mut running = self.inner.running();
            if running.is_some() {
                return Err(ProtocolError::TransportError(ERR_ALREADY_STARTED.to_string()));
            }
            *running = Some(Running {
                tcp_addr,
                udp_socket: udp_socket.clone(),
                active: active.clone(),
                shutdown,
            });
        }

        let messenger = &self.inner.messenger;
        messenger.start();

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(ServerInner::accept_loop(weak.clone(), listener, shutdown_rx.clone()));
        tokio::spawn(run_udp_loop(udp_socket, messenger.clone(), active, shutdown_rx.clone()));
        tokio::spawn(ServerInner::sweep_loop(
            weak,
            self.inner.config.heartbeat_sweep_interval,
            shutdown_rx,
        ));

        info!(%tcp_addr, %udp_addr, "Server started");
        messenger
            .events()
            .publish(NetworkEvent::ServerStarted { tcp_addr, udp_addr });
        Ok(())
    }

    /// Stop every task and close all peer connections.
    ///
    /// Peers dropped this way do not produce individual disconnect events.
    pub async fn stop(&self) {
        let Some(running) = self.inner.running().take() else {
            return;
        };
        running.active.store(false, Ordering::SeqCst);
        running.shutdown.send_replace(true);
        self.inner.messenger.stop();

        let peers = self.inner.peers().map(|mut p| p.drain()).unwrap_or_default();
        for peer in &peers {
            peer.deactivate();
            peer.stream().close().await;
        }

        info!(peers = peers.len(), "Server stopped");
        self.inner.messenger.metrics().log_metrics();
        self.inner.messenger.events().publish(NetworkEvent::ServerStopped);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running().is_some()
    }

    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.inner.running().as_ref().map(|r| r.tcp_addr)
    }

    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.inner
            .running()
            .as_ref()
            .and_then(|r| r.udp_socket.local_addr().ok())
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

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner
            .peers()
            .map(|p| p.iter().map(Peer::info).collect())
            .unwrap_or_default()
    }

    pub fn peer(&self, id: ConnectionId) -> Option<PeerInfo> {
        self.inner.peers().ok()?.get(id).map(Peer::info)
    }

    pub fn peer_by_secret(&self, secret: &str) -> Option<PeerInfo> {
        self.inner.peers().ok()?.get_by_secret(secret).map(Peer::info)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers().map(|p| p.len()).unwrap_or(0)
    }

    /// Send an object to one peer.
    ///
    /// Returns `Ok(None)` when the type has no serializer or, for UDP, when the peer's
    /// UDP endpoint is not known yet.
    pub async fn send_to<T: NetMessage>(
        &self,
        peer: ConnectionId,
        object: &T,
        protocol: Protocol,
    ) -> Result<Option<Bytes>> {
        match self.inner.recipient_for(peer, protocol)? {
            Some(recipient) => self.inner.messenger.send(&recipient, object).await,
            None => Ok(None),
        }
    }

    pub async fn send_bytes_to(
        &self,
        peer: ConnectionId,
        data: Bytes,
        protocol: Protocol,
    ) -> Result<Option<Bytes>> {
        match self.inner.recipient_for(peer, protocol)? {
            Some(recipient) => {
                self.inner.messenger.send_bytes(&recipient, data.clone()).await?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    pub async fn send_packet_to(
        &self,
        peer: ConnectionId,
        packet: &Packet,
        protocol: Protocol,
    ) -> Result<Option<Bytes>> {
        self.send_bytes_to(peer, packet.to_bytes(), protocol).await
    }

    /// Send an object to every peer, returning how many sends went out
    pub async fn broadcast<T: NetMessage>(&self, object: &T, protocol: Protocol) -> Result<usize> {
        let ids: Vec<ConnectionId> = self.inner.peers()?.iter().map(Peer::id).collect();
        let mut sent = 0;
        for id in ids {
            match self.send_to(id, object, protocol).await {
                Ok(Some(_)) => sent += 1,
                Ok(None) => {}
                Err(e) => debug!(peer = id, error = %e, "Broadcast send failed"),
            }
        }
        Ok(sent)
    }

    /// Ask a peer to leave, wait for its acknowledgement, then drop it.
    ///
    /// The peer is removed even when the acknowledgement never arrives; the wait's
    /// error is returned in that case.
    pub async fn disconnect_peer(&self, id: ConnectionId) -> Result<()> {
        let (secret, stream) = {
            let mut peers = self.inner.peers()?;
            let peer = peers.get_mut(id).ok_or(ProtocolError::UnknownPeer)?;
            // The client may close TCP before this task resumes after the ack
            peer.begin_closing();
            (peer.secret().to_string(), peer.stream().clone())
        };

        let messenger = &self.inner.messenger;
        let message = DisconnectMessage::new(secret, messenger.new_ack_request()?);
        let result = messenger.send_and_wait(&stream, &message).await;
        self.inner.remove_peer(id, DisconnectReason::ServerRequested);
        result
    }

    /// Drop every peer whose heartbeat is older than the configured timeout.
    ///
    /// Runs periodically while the server is started; returns the removed ids.
    pub fn sweep_expired(&self) -> Vec<ConnectionId> {
        self.inner.sweep(Instant::now())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.inner.config.address)
            .field("running", &self.is_running())
            .field("peers", &self.peer_count())
            .finish()
    }
}

impl ServerInner {
    fn register_handlers(inner: &Arc<Self>) -> Result<()> {
        let registry = inner.messenger.registry();

        registry.register_with_id(
            system_ids::CLIENT_SECRET,
            MessageType::new::<ClientSecretMessage>()
                .serializer(WireSerializer::new())
                .build(),
            ConflictPolicy::Override,
        )?;
        registry.register_with_id(
            system_ids::SERVER_UDP_PORT,
            MessageType::new::<ServerUdpPortMessage>()
                .serializer(WireSerializer::new())
                .build(),
            ConflictPolicy::Override,
        )?;
        registry.register_with_id(
            system_ids::SERVER_SYSTEM,
            MessageType::new::<ServerSystemMessage>()
                .serializer(WireSerializer::new())
                .build(),
            ConflictPolicy::Override,
        )?;

        let weak = Arc::downgrade(inner);
        registry.register_with_id(
            system_ids::CLIENT_UDP_PORT,
            MessageType::new::<ClientUdpPortMessage>()
                .serializer(WireSerializer::new())
                .handler(move |message, _sender| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_client_udp_port(message);
                    }
                })
                .build(),
            ConflictPolicy::Override,
        )?;

        let weak = Arc::downgrade(inner);
        registry.register_with_id(
            system_ids::CLIENT_SYSTEM,
            MessageType::new::<ClientSystemMessage>()
                .serializer(WireSerializer::new())
                .handler(move |message, sender| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_client_system(message, sender);
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

    fn peers(&self) -> Result<MutexGuard<'_, PeerTable>> {
        self.peers
            .lock()
            .map_err(|_| ProtocolError::Custom(ERR_PEER_TABLE_LOCK.to_string()))
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.running().as_ref().map(|r| r.udp_socket.clone())
    }

    fn recipient_for(&self, id: ConnectionId, protocol: Protocol) -> Result<Option<Recipient>> {
        let socket = self.udp_socket();
        let peers = self.peers()?;
        let peer = peers.get(id).ok_or(ProtocolError::UnknownPeer)?;
        match protocol {
            Protocol::Tcp => Ok(Some(peer.stream().clone())),
            Protocol::Udp => {
                let (Some(endpoint), Some(socket)) = (peer.udp_endpoint(), socket) else {
                    return Ok(None);
                };
                Ok(Some(Recipient::datagram(socket, endpoint)))
            }
        }
    }

    async fn accept_loop(
        weak: Weak<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let Some(inner) = weak.upgrade() else { break };
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = inner.add_peer(stream, addr) {
                                warn!(%addr, error = %e, "Rejected connection");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        }
        trace!("Accept loop stopped");
    }

    fn add_peer(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(%addr, error = %e, "Failed to set TCP_NODELAY");
        }
        let udp_port = self
            .udp_socket()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
            .ok_or(ProtocolError::NotConnected)?;

        let (read_half, write_half) = stream.into_split();
        let codec = FrameCodec::new(self.messenger.config().max_frame_size);
        let recipient = Recipient::stream(write_half, codec, Some(addr));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (secret, active, shutdown) = {
            let mut peers = self.peers()?;
            if peers.len() >= self.config.max_peers {
                return Err(ProtocolError::TransportError(format!(
                    "Peer limit of {} reached",
                    self.config.max_peers
                )));
            }
            let secret = self.unique_secret(&peers)?;
            let peer = Peer::new(id, secret.clone(), addr, recipient.clone(), Instant::now());
            let flags = (peer.active_flag(), peer.shutdown_signal());
            peers.insert(peer);
            (secret, flags.0, flags.1)
        };

        self.messenger.metrics().peer_connected();
        info!(peer = id, %addr, "Peer connected");
        self.messenger
            .events()
            .publish(NetworkEvent::PeerConnected { peer: id, addr });

        let weak = Arc::downgrade(self);
        let messenger = self.messenger.clone();
        let sender = recipient.clone();
        tokio::spawn(async move {
            let exit = run_tcp_loop(read_half, codec, messenger, sender, active, shutdown).await;
            trace!(peer = id, ?exit, "TCP receive loop ended");
            // Shutdown is only signalled after the peer left the table
            if exit == LoopExit::Shutdown {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.remove_peer(id, DisconnectReason::ConnectionClosed);
            }
        });

        let messenger = self.messenger.clone();
        tokio::spawn(async move {
            let handshake = async {
                messenger
                    .send(&recipient, &ClientSecretMessage { secret: secret.clone() })
                    .await?;
                messenger
                    .send(&recipient, &ServerUdpPortMessage { secret, port: udp_port })
                    .await
            };
            if let Err(e) = handshake.await {
                debug!(peer = id, error = %e, "Failed to send session handshake");
            }
        });
        Ok(())
    }

    fn unique_secret(&self, peers: &PeerTable) -> Result<String> {
        for _ in 0..SECRET_ATTEMPTS {
            let secret = self.secrets.token()?;
            if !peers.contains_secret(&secret) {
                return Ok(secret);
            }
            warn!("Generated secret collides with a live peer, regenerating");
        }
        Err(ProtocolError::Custom(ERR_SECRET_EXHAUSTED.to_string()))
    }

    /// Remove a peer and notify once. Returns false when it was already gone.
    ///
    /// A peer marked closing by [`Server::disconnect_peer`] always reports
    /// [`DisconnectReason::ServerRequested`].
    fn remove_peer(&self, id: ConnectionId, reason: DisconnectReason) -> bool {
        let peer = match self.peers() {
            Ok(mut peers) => peers.remove(id),
            Err(e) => {
                warn!(peer = id, error = %e, "Peer removal skipped");
                None
            }
        };
        let Some(peer) = peer else {
            return false;
        };
        let reason = if peer.is_closing() {
            DisconnectReason::ServerRequested
        } else {
            reason
        };

        peer.deactivate();
        let stream = peer.stream().clone();
        tokio::spawn(async move { stream.close().await });

        self.messenger.metrics().peer_disconnected();
        info!(peer = id, ?reason, "Peer disconnected");
        self.messenger.events().publish(NetworkEvent::PeerDisconnected {
            peer: id,
            secret: peer.secret().to_string(),
            reason,
        });
        true
    }

    fn handle_client_udp_port(self: &Arc<Self>, message: &ClientUdpPortMessage) {
        let update = match self.peers() {
            Ok(mut peers) => peers.get_by_secret_mut(&message.secret).map(|peer| {
                let endpoint = SocketAddr::new(peer.tcp_addr().ip(), message.port);
                let first = peer.set_udp_endpoint(endpoint);
                peer.touch(Instant::now());
                (peer.id(), peer.stream().clone(), endpoint, first)
            }),
            Err(e) => {
                warn!(error = %e, "UDP port message skipped");
                None
            }
        };
        let Some((id, stream, udp_endpoint, first)) = update else {
            debug!("UDP port message with unknown secret");
            return;
        };

        if first {
            info!(peer = id, %udp_endpoint, "UDP paths exchanged");
            self.messenger.events().publish(NetworkEvent::UdpPathsExchanged {
                peer: id,
                secret: message.secret.clone(),
                udp_endpoint,
            });
        }

        let messenger = self.messenger.clone();
        tokio::spawn(async move {
            if let Err(e) = messenger
                .send(&stream, &ServerSystemMessage::connection_established())
                .await
            {
                debug!(peer = id, error = %e, "Failed to confirm connection");
            }
        });
    }

    fn handle_client_system(&self, message: &ClientSystemMessage, sender: &Recipient) {
        match message.kind {
            ClientSystemKind::Heartbeat => {
                let touched = match self.peers() {
                    Ok(mut peers) => peers
                        .get_by_secret_mut(&message.secret)
                        .map(|peer| {
                            peer.touch(Instant::now());
                            peer.id()
                        }),
                    Err(_) => None,
                };
                match touched {
                    Some(id) => trace!(peer = id, %sender, "Heartbeat"),
                    None => debug!(%sender, "Heartbeat with unknown secret"),
                }
            }
        }
    }

    fn handle_disconnect(&self, message: &DisconnectMessage) {
        let id = self
            .peers()
            .ok()
            .and_then(|peers| peers.get_by_secret(&message.secret).map(Peer::id));
        match id {
            Some(id) => {
                self.remove_peer(id, DisconnectReason::ClientRequested);
            }
            None => debug!("Disconnect with unknown secret"),
        }
    }

    fn sweep(&self, now: Instant) -> Vec<ConnectionId> {
        let expired = match self.peers() {
            Ok(peers) => peers.expired(now, self.config.heartbeat_timeout),
            Err(_) => return Vec::new(),
        };
        expired
            .into_iter()
            .filter(|&id| self.remove_peer(id, DisconnectReason::HeartbeatTimeout))
            .collect()
    }

    async fn sweep_loop(weak: Weak<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    let removed = inner.sweep(Instant::now());
                    if !removed.is_empty() {
                        debug!(removed = removed.len(), "Heartbeat sweep dropped peers");
                    }
                }
            }
        }
        trace!("Heartbeat sweep stopped");
    }
}
