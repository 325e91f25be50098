//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use hybrid_net::config::{
    validate_ip, validate_port, ClientConfig, DeliveryFailurePolicy, MessengerConfig,
    NetworkConfig, ServerConfig,
};
use hybrid_net::error::ProtocolError;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {errors:?}"
    );
    assert_eq!(config.server.address, "127.0.0.1:26000");
    assert_eq!(config.server.local_udp_port, 25000);
    assert_eq!(config.messenger.ack_timeout, Duration::from_millis(1000));
    assert_eq!(config.messenger.ack_max_retries, 5);
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
    assert!(matches!(
        config.validate_strict(),
        Err(ProtocolError::ConfigError(_))
    ));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_server_config_new_keeps_bad_ip_for_validation() {
    let good = ServerConfig::new("10.0.0.5", 4000, 4001);
    assert_eq!(good.address, "10.0.0.5:4000");
    assert!(good.validate().is_empty());

    let bad = ServerConfig::new("not-an-ip", 4000, 4001);
    assert!(bad.validate_strict().is_err());
}

#[test]
fn test_zero_ports_are_rejected() {
    let mut config = NetworkConfig::default();
    config.server.address = "127.0.0.1:0".to_string();
    config.server.local_udp_port = 0;
    config.client.local_udp_port = 0;

    let errors = config.validate();
    assert_eq!(
        errors.iter().filter(|e| e.contains("port")).count(),
        3,
        "{errors:?}"
    );
}

#[test]
fn test_port_and_ip_helpers() {
    assert!(matches!(validate_port(0), Err(ProtocolError::ConfigError(_))));
    assert!(matches!(validate_port(65_536), Err(ProtocolError::ConfigError(_))));
    assert_eq!(validate_port(26000).unwrap(), 26000);

    assert!(validate_ip("").is_err());
    assert!(validate_ip("256.0.0.1").is_err());
    assert!(validate_ip("::1").unwrap().is_loopback());
    assert!(validate_ip(" 127.0.0.1 ").unwrap().is_loopback());
}

#[test]
fn test_heartbeat_bounds() {
    let mut server = ServerConfig::default();
    server.heartbeat_timeout = Duration::from_millis(50);
    assert!(server
        .validate()
        .iter()
        .any(|e| e.contains("Heartbeat timeout too short")));

    let mut server = ServerConfig::default();
    server.heartbeat_sweep_interval = server.heartbeat_timeout + Duration::from_secs(1);
    assert!(server
        .validate()
        .iter()
        .any(|e| e.contains("cannot exceed the heartbeat timeout")));

    let client = ClientConfig {
        heartbeat_interval: Duration::from_secs(7200),
        ..ClientConfig::default()
    };
    assert!(client.validate().iter().any(|e| e.contains("too long")));

    let client = ClientConfig {
        heartbeat_interval: Duration::from_millis(1),
        ..ClientConfig::default()
    };
    assert!(client.validate().iter().any(|e| e.contains("too short")));
}

#[test]
fn test_messenger_bounds() {
    let config = MessengerConfig {
        ack_timeout: Duration::from_millis(50),
        retry_tick: Duration::from_millis(100),
        ..MessengerConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Retry tick cannot exceed")));

    let config = MessengerConfig {
        max_frame_size: 16,
        ..MessengerConfig::default()
    };
    assert!(config.validate_strict().is_err());

    let config = MessengerConfig {
        ack_timeout: Duration::ZERO,
        ..MessengerConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Acknowledge timeout must be greater than 0")));
}

#[test]
fn test_partial_toml_fills_defaults() {
    let config = NetworkConfig::from_toml(
        r#"
        [server]
        address = "0.0.0.0:7000"
        heartbeat_timeout = 3000

        [messenger]
        ack_max_retries = 2
        delivery_failure = "report"

        [logging]
        log_level = "debug"
        "#,
    )
    .unwrap();

    assert_eq!(config.server.address, "0.0.0.0:7000");
    assert_eq!(config.server.heartbeat_timeout, Duration::from_secs(3));
    assert_eq!(config.server.local_udp_port, 25000);
    assert_eq!(config.messenger.ack_max_retries, 2);
    assert_eq!(config.messenger.delivery_failure, DeliveryFailurePolicy::Report);
    assert_eq!(config.messenger.ack_timeout, Duration::from_millis(1000));
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.validate().is_empty());
}

#[test]
fn test_malformed_toml_is_config_error() {
    assert!(matches!(
        NetworkConfig::from_toml("[server]\naddress = 12"),
        Err(ProtocolError::ConfigError(_))
    ));
    assert!(matches!(
        NetworkConfig::from_toml("[logging]\nlog_level = \"loud\""),
        Err(ProtocolError::ConfigError(_))
    ));
}

#[test]
fn test_file_round_trip() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:27000".to_string();
        c.client.heartbeat_interval = Duration::from_millis(750);
        c.messenger.retry_tick = Duration::from_millis(25);
    });

    let path = std::env::temp_dir().join(format!("hybrid-net-config-{}.toml", std::process::id()));
    config.save_to_file(&path).unwrap();
    let loaded = NetworkConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded.server.address, "127.0.0.1:27000");
    assert_eq!(loaded.client.heartbeat_interval, Duration::from_millis(750));
    assert_eq!(loaded.messenger.retry_tick, Duration::from_millis(25));
    assert!(NetworkConfig::from_file(&path).is_err());
}

#[test]
fn test_example_config_parses() {
    let example = NetworkConfig::example_config();
    assert!(example.contains("[server]"));
    let parsed = NetworkConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}
