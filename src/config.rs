//! # Configuration Management
//!
//! Centralized configuration for servers, clients and the messenger.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` or strings via `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`
//!
//! ## Defaults
//! - Server TCP port 26000, local UDP port 25000
//! - Acknowledge timeout 1000 ms with 5 retries
//! - Client heartbeat every 10 s, server drops peers silent for 15 s

use crate::error::{constants, ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default TCP port the server listens on
pub const DEFAULT_TCP_PORT: u16 = 26000;

/// Default local UDP port for both sides
pub const DEFAULT_UDP_PORT: u16 = 25000;

/// Default number of acknowledge retries
pub const DEFAULT_ACK_RETRIES: u32 = 5;

/// Max allowed frame size on stream transports (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Max payload carried by a single UDP datagram
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Reject port 0 and anything that does not fit 1 to 65535.
pub fn validate_port(port: u32) -> Result<u16> {
    if port == 0 || port > u32::from(u16::MAX) {
        return Err(ProtocolError::ConfigError(format!(
            "{} (got {port})",
            constants::ERR_INVALID_PORT
        )));
    }
    Ok(port as u16)
}

/// Parse an IP address, rejecting empty or malformed input.
pub fn validate_ip(ip: &str) -> Result<IpAddr> {
    ip.trim().parse::<IpAddr>().map_err(|_| {
        ProtocolError::ConfigError(format!("{}: '{ip}'", constants::ERR_INVALID_ADDRESS))
    })
}

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Acknowledge and framing configuration shared by both sides
    #[serde(default)]
    pub messenger: MessengerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HYBRID_NET_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(port) = std::env::var("HYBRID_NET_SERVER_UDP_PORT") {
            if let Ok(val) = port.parse::<u16>() {
                config.server.local_udp_port = val;
            }
        }

        if let Ok(port) = std::env::var("HYBRID_NET_CLIENT_UDP_PORT") {
            if let Ok(val) = port.parse::<u16>() {
                config.client.local_udp_port = val;
            }
        }

        if let Ok(heartbeat) = std::env::var("HYBRID_NET_HEARTBEAT_INTERVAL_MS") {
            if let Ok(val) = heartbeat.parse::<u64>() {
                config.client.heartbeat_interval = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("HYBRID_NET_HEARTBEAT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.server.heartbeat_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("HYBRID_NET_ACK_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.messenger.ack_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(retries) = std::env::var("HYBRID_NET_ACK_RETRIES") {
            if let Ok(val) = retries.parse::<u32>() {
                config.messenger.ack_max_retries = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.messenger.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        into_result(self.validate())
    }
}

fn into_result(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address (e.g., "127.0.0.1:26000")
    pub address: String,

    /// UDP port bound on the listen IP
    pub local_udp_port: u16,

    /// Peers without a heartbeat for this long are dropped
    #[serde(with = "duration_serde")]
    pub heartbeat_timeout: Duration,

    /// How often the heartbeat sweep runs
    #[serde(with = "duration_serde")]
    pub heartbeat_sweep_interval: Duration,

    /// Maximum number of concurrent peers
    pub max_peers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_TCP_PORT}"),
            local_udp_port: DEFAULT_UDP_PORT,
            heartbeat_timeout: timeout::HEARTBEAT_TIMEOUT,
            heartbeat_sweep_interval: timeout::HEARTBEAT_SWEEP_INTERVAL,
            max_peers: 1000,
        }
    }
}

impl ServerConfig {
    /// Build a configuration for an IP, TCP port and UDP port
    pub fn new(ip: &str, tcp_port: u16, udp_port: u16) -> Self {
        // An unparsable IP is kept verbatim so validation reports it
        let address = match ip.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, tcp_port).to_string(),
            Err(_) => format!("{ip}:{tcp_port}"),
        };
        Self {
            address,
            local_udp_port: udp_port,
            ..Self::default()
        }
    }

    /// Parsed listen address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = self.address.parse::<SocketAddr>().map_err(|_| {
            ProtocolError::ConfigError(format!(
                "{}: '{}'",
                constants::ERR_INVALID_ADDRESS,
                self.address
            ))
        })?;
        validate_port(u32::from(addr.port()))?;
        Ok(addr)
    }

    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else {
            match self.address.parse::<SocketAddr>() {
                Err(_) => errors.push(format!(
                    "Invalid server address format: '{}' (expected format: '127.0.0.1:26000')",
                    self.address
                )),
                Ok(addr) if addr.port() == 0 => {
                    errors.push(format!("Invalid server TCP port: {}", constants::ERR_INVALID_PORT))
                }
                Ok(_) => {}
            }
        }

        if self.local_udp_port == 0 {
            errors.push(format!("Invalid server UDP port: {}", constants::ERR_INVALID_PORT));
        }

        if self.heartbeat_timeout.as_millis() < 100 {
            errors.push("Heartbeat timeout too short (minimum: 100ms)".to_string());
        }

        if self.heartbeat_sweep_interval.as_millis() < 10 {
            errors.push("Heartbeat sweep interval too short (minimum: 10ms)".to_string());
        } else if self.heartbeat_sweep_interval > self.heartbeat_timeout {
            errors.push("Heartbeat sweep interval cannot exceed the heartbeat timeout".to_string());
        }

        if self.max_peers == 0 {
            errors.push("Max peers must be greater than 0".to_string());
        }

        errors
    }

    pub fn validate_strict(&self) -> Result<()> {
        into_result(self.validate())
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// UDP port the client binds locally and announces to the server
    pub local_udp_port: u16,

    /// Interval between heartbeat messages
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Upper bound for the acknowledged disconnect
    #[serde(with = "duration_serde")]
    pub disconnect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_udp_port: DEFAULT_UDP_PORT,
            heartbeat_interval: timeout::HEARTBEAT_INTERVAL,
            disconnect_timeout: timeout::DISCONNECT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.local_udp_port == 0 {
            errors.push(format!("Invalid client UDP port: {}", constants::ERR_INVALID_PORT));
        }

        if self.heartbeat_interval.as_millis() < 10 {
            errors.push("Heartbeat interval too short (minimum: 10ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.disconnect_timeout.as_millis() < 10 {
            errors.push("Disconnect timeout too short (minimum: 10ms)".to_string());
        }

        errors
    }

    pub fn validate_strict(&self) -> Result<()> {
        into_result(self.validate())
    }
}

/// What happens when a reliable message runs out of retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFailurePolicy {
    /// Drop the pending entry and only log it
    #[default]
    Silent,
    /// Also publish a `DeliveryFailed` event
    Report,
}

/// Acknowledge protocol and framing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Time to wait for a response before resending
    #[serde(with = "duration_serde")]
    pub ack_timeout: Duration,

    /// Number of resends before a request is dropped
    pub ack_max_retries: u32,

    /// Tick of the retry loop
    #[serde(with = "duration_serde")]
    pub retry_tick: Duration,

    /// Maximum frame size accepted on stream transports
    pub max_frame_size: usize,

    /// Handling of requests that exhaust their retries
    pub delivery_failure: DeliveryFailurePolicy,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            ack_timeout: timeout::ACK_TIMEOUT,
            ack_max_retries: DEFAULT_ACK_RETRIES,
            retry_tick: timeout::RETRY_TICK,
            max_frame_size: MAX_FRAME_SIZE,
            delivery_failure: DeliveryFailurePolicy::Silent,
        }
    }
}

impl MessengerConfig {
    /// Validate messenger configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.ack_timeout.is_zero() {
            errors.push("Acknowledge timeout must be greater than 0".to_string());
        }

        if self.retry_tick.is_zero() {
            errors.push("Retry tick must be greater than 0".to_string());
        } else if self.retry_tick > self.ack_timeout {
            errors.push("Retry tick cannot exceed the acknowledge timeout".to_string());
        }

        if self.max_frame_size < 64 {
            errors.push("Max frame size too small (minimum: 64 bytes)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        errors
    }

    pub fn validate_strict(&self) -> Result<()> {
        into_result(self.validate())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level used when `RUST_LOG` is not set
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("hybrid-net"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
