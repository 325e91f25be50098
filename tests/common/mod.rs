//! Shared helpers for integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hybrid_net::config::NetworkConfig;
use hybrid_net::service::NetworkEvent;
use hybrid_net::service::events::EventBus;

/// A TCP port that was free a moment ago on loopback
pub fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A UDP port that was free a moment ago on every interface
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Configuration with fresh ports and timings short enough for tests
pub fn test_config() -> NetworkConfig {
    let tcp_port = free_tcp_port();
    let server_udp = free_udp_port();
    let mut client_udp = free_udp_port();
    while client_udp == server_udp {
        client_udp = free_udp_port();
    }

    NetworkConfig::default_with_overrides(|config| {
        config.server.address = format!("127.0.0.1:{tcp_port}");
        config.server.local_udp_port = server_udp;
        config.server.heartbeat_timeout = Duration::from_secs(5);
        config.server.heartbeat_sweep_interval = Duration::from_millis(50);
        config.client.local_udp_port = client_udp;
        config.client.heartbeat_interval = Duration::from_millis(200);
        config.client.disconnect_timeout = Duration::from_secs(2);
        config.messenger.ack_timeout = Duration::from_millis(200);
        config.messenger.retry_tick = Duration::from_millis(20);
    })
}

pub fn tcp_port(config: &NetworkConfig) -> u32 {
    config
        .server
        .address
        .parse::<std::net::SocketAddr>()
        .unwrap()
        .port()
        .into()
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Records every event published on a bus
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<NetworkEvent>>>,
}

impl EventLog {
    pub fn attach(bus: &EventBus) -> Self {
        let log = Self::default();
        let events = log.events.clone();
        bus.subscribe(move |event| events.lock().unwrap().push(event.clone()));
        log
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn all(&self) -> Vec<NetworkEvent> {
        self.events.lock().unwrap().clone()
    }
}
