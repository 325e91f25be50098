//! Observability and Metrics
//!
//! Counters for traffic, dropped packets, acknowledge bookkeeping and peer churn.
//!
//! Every messenger owns one [`Metrics`] instance behind an `Arc`; the server and
//! client share it with their messenger, so there is no process-wide state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for one endpoint
#[derive(Debug)]
pub struct Metrics {
    /// Total messages sent
    pub messages_sent: AtomicU64,
    /// Total messages received and dispatched
    pub messages_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Inbound packets dropped as malformed or unroutable
    pub packets_dropped: AtomicU64,
    /// Reliable messages sent
    pub acks_requested: AtomicU64,
    /// Reliable messages confirmed by the far side
    pub acks_confirmed: AtomicU64,
    /// Resends performed by the retry loop
    pub ack_retries: AtomicU64,
    /// Reliable messages dropped after exhausting their retries
    pub deliveries_failed: AtomicU64,
    /// Peers accepted (server) or sessions opened (client)
    pub peers_connected: AtomicU64,
    /// Peers or sessions removed for any reason
    pub peers_disconnected: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            acks_requested: AtomicU64::new(0),
            acks_confirmed: AtomicU64::new(0),
            ack_retries: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            peers_connected: AtomicU64::new(0),
            peers_disconnected: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a message sent
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a message received
    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_requested(&self) {
        self.acks_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_confirmed(&self) {
        self.acks_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_retry(&self) {
        self.ack_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_failed(&self) {
        self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_connected(&self) {
        self.peers_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_disconnected(&self) {
        self.peers_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            acks_requested: self.acks_requested.load(Ordering::Relaxed),
            acks_confirmed: self.acks_confirmed.load(Ordering::Relaxed),
            ack_retries: self.ack_retries.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            peers_connected: self.peers_connected.load(Ordering::Relaxed),
            peers_disconnected: self.peers_disconnected.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            packets_dropped = snapshot.packets_dropped,
            acks_requested = snapshot.acks_requested,
            acks_confirmed = snapshot.acks_confirmed,
            ack_retries = snapshot.ack_retries,
            deliveries_failed = snapshot.deliveries_failed,
            peers_connected = snapshot.peers_connected,
            peers_disconnected = snapshot.peers_disconnected,
            uptime_seconds = snapshot.uptime_seconds,
            "Network metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_dropped: u64,
    pub acks_requested: u64,
    pub acks_confirmed: u64,
    pub ack_retries: u64,
    pub deliveries_failed: u64,
    pub peers_connected: u64,
    pub peers_disconnected: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.message_sent(10);
        metrics.message_sent(5);
        metrics.message_received(7);
        metrics.packet_dropped();
        metrics.ack_retry();
        metrics.ack_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 15);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.bytes_received, 7);
        assert_eq!(snapshot.packets_dropped, 1);
        assert_eq!(snapshot.ack_retries, 2);
        assert_eq!(snapshot.deliveries_failed, 0);
    }
}
