//! Server-side peer records and the table indexing them by connection and by secret.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::transport::recipient::Recipient;

/// Server-assigned handle of one TCP connection
pub type ConnectionId = u64;

/// Live state of one connected client.
pub struct Peer {
    id: ConnectionId,
    secret: String,
    tcp_addr: SocketAddr,
    joined_at: Instant,
    last_heartbeat: Instant,
    udp_endpoint: Option<SocketAddr>,
    stream: Recipient,
    closing: bool,
    active: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl Peer {
    pub(crate) fn new(
        id: ConnectionId,
        secret: String,
        tcp_addr: SocketAddr,
        stream: Recipient,
        now: Instant,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            secret,
            tcp_addr,
            joined_at: now,
            last_heartbeat: now,
            udp_endpoint: None,
            stream,
            closing: false,
            active: Arc::new(AtomicBool::new(true)),
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn stream(&self) -> &Recipient {
        &self.stream
    }

    pub fn udp_endpoint(&self) -> Option<SocketAddr> {
        self.udp_endpoint
    }

    pub(crate) fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Record a heartbeat. The timestamp never moves backwards.
    pub(crate) fn touch(&mut self, now: Instant) {
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
    }

    /// Set the public UDP endpoint, returning whether it was unknown before
    pub(crate) fn set_udp_endpoint(&mut self, endpoint: SocketAddr) -> bool {
        self.udp_endpoint.replace(endpoint).is_none()
    }

    pub(crate) fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > timeout
    }

    /// Mark the peer as leaving at the server's request
    pub(crate) fn begin_closing(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Stop the peer's loops. The stream itself is closed by the caller.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            secret: self.secret.clone(),
            tcp_addr: self.tcp_addr,
            udp_endpoint: self.udp_endpoint,
            joined_at: self.joined_at,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Point-in-time copy of a peer's public state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: ConnectionId,
    pub secret: String,
    pub tcp_addr: SocketAddr,
    pub udp_endpoint: Option<SocketAddr>,
    pub joined_at: Instant,
    pub last_heartbeat: Instant,
}

/// Peers indexed by connection id and by secret.
#[derive(Default)]
pub struct PeerTable {
    by_id: HashMap<ConnectionId, Peer>,
    by_secret: HashMap<String, ConnectionId>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains_secret(&self, secret: &str) -> bool {
        self.by_secret.contains_key(secret)
    }

    pub fn insert(&mut self, peer: Peer) {
        self.by_secret.insert(peer.secret.clone(), peer.id);
        self.by_id.insert(peer.id, peer);
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Peer> {
        let peer = self.by_id.remove(&id)?;
        self.by_secret.remove(&peer.secret);
        Some(peer)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Peer> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Peer> {
        self.by_id.get_mut(&id)
    }

    pub fn get_by_secret(&self, secret: &str) -> Option<&Peer> {
        self.by_secret.get(secret).and_then(|id| self.by_id.get(id))
    }

    pub fn get_by_secret_mut(&mut self, secret: &str) -> Option<&mut Peer> {
        let id = *self.by_secret.get(secret)?;
        self.by_id.get_mut(&id)
    }

    /// Ids of peers silent for longer than `timeout`
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.by_id
            .values()
            .filter(|peer| peer.is_expired(now, timeout))
            .map(Peer::id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.by_id.values()
    }

    pub fn drain(&mut self) -> Vec<Peer> {
        self.by_secret.clear();
        self.by_id.drain().map(|(_, peer)| peer).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::FrameCodec;

    fn peer(id: ConnectionId, secret: &str, now: Instant) -> Peer {
        let (near, _far) = tokio::io::duplex(64);
        let stream = Recipient::stream(near, FrameCodec::default(), None);
        Peer::new(id, secret.to_string(), "127.0.0.1:5000".parse().unwrap(), stream, now)
    }

    #[tokio::test]
    async fn test_both_indexes_follow_insert_and_remove() {
        let now = Instant::now();
        let mut table = PeerTable::new();
        table.insert(peer(1, "alpha", now));
        table.insert(peer(2, "beta", now));

        assert_eq!(table.get_by_secret("beta").map(Peer::id), Some(2));
        assert!(table.remove(2).is_some());
        assert!(table.remove(2).is_none());
        assert!(table.get_by_secret("beta").is_none());
        assert!(!table.contains_secret("beta"));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_is_monotonic_and_drives_expiry() {
        let start = Instant::now();
        let mut table = PeerTable::new();
        table.insert(peer(1, "alpha", start));

        let later = start + Duration::from_secs(10);
        table.get_by_secret_mut("alpha").unwrap().touch(later);
        table.get_by_secret_mut("alpha").unwrap().touch(start);
        assert_eq!(table.get(1).unwrap().info().last_heartbeat, later);

        let timeout = Duration::from_secs(15);
        assert!(table.expired(later + timeout, timeout).is_empty());
        assert_eq!(table.expired(later + timeout * 2, timeout), vec![1]);
    }

    #[tokio::test]
    async fn test_udp_endpoint_reports_first_assignment() {
        let mut p = peer(1, "alpha", Instant::now());
        assert!(p.set_udp_endpoint("127.0.0.1:7000".parse().unwrap()));
        assert!(!p.set_udp_endpoint("127.0.0.1:7001".parse().unwrap()));
        assert_eq!(p.udp_endpoint(), Some("127.0.0.1:7001".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_closing_mark_survives_removal() {
        let mut table = PeerTable::new();
        table.insert(peer(1, "alpha", Instant::now()));
        assert!(!table.get(1).unwrap().is_closing());

        table.get_mut(1).unwrap().begin_closing();
        let removed = table.remove(1).unwrap();
        assert!(removed.is_closing());
    }
}
