//! Endpoint configuration.
//!
//! Every optional field carries a serde default so a device file only has to
//! name what differs from the defaults. Configuration is validated when an
//! endpoint is asked to connect or listen, not when it is parsed.

use crate::debug::StreamDebug;
use crate::error::ConfigError;
use crate::framer::{DEFAULT_MAX_FRAME_LEN, Delimiter};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BUFFER_SIZE: usize = 2000;
const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_CLIENTS: usize = 10;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_true() -> bool {
    true
}

fn default_reconnect_interval_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

fn default_max_clients() -> usize {
    DEFAULT_MAX_CLIENTS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Login credentials for channels that need them (the shell channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// Heartbeat settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Whether liveness is enforced at all.
    #[serde(default)]
    pub required: bool,
    /// Longest silence tolerated before the peer is dropped.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Message that counts as a heartbeat. When unset any message does.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            required: false,
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            token: None,
        }
    }
}

impl HeartbeatConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.required && self.interval_ms == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        Ok(())
    }
}

fn validate_shared_key(required: bool, key: &Option<String>) -> Result<(), ConfigError> {
    if required && key.as_deref().is_none_or(str::is_empty) {
        return Err(ConfigError::MissingSharedKey);
    }
    Ok(())
}

/// Parameters of one outgoing connection (TCP or shell).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Read buffer size in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_interval_ms")]
    pub auto_reconnect_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub shared_key: Option<String>,
    #[serde(default)]
    pub shared_key_required: bool,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub delimiter: Delimiter,
    #[serde(default)]
    pub include_delimiter: bool,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default)]
    pub stream_debug: StreamDebug,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            credentials: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            auto_reconnect: true,
            auto_reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            shared_key: None,
            shared_key_required: false,
            heartbeat: HeartbeatConfig::default(),
            delimiter: Delimiter::default(),
            include_delimiter: false,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            stream_debug: StreamDebug::Off,
        }
    }
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Check that the endpoint can be connected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        validate_shared_key(self.shared_key_required, &self.shared_key)?;
        self.heartbeat.validate()
    }

    /// The key the handshake must verify, if the handshake is enabled.
    pub fn handshake_key(&self) -> Option<&str> {
        if self.shared_key_required {
            self.shared_key.as_deref()
        } else {
            None
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.auto_reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Parameters of a listening TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on; 0 lets the OS choose.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub shared_key: Option<String>,
    #[serde(default)]
    pub shared_key_required: bool,
    /// How long a peer may take to present the shared key.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub delimiter: Delimiter,
    #[serde(default)]
    pub include_delimiter: bool,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default)]
    pub stream_debug: StreamDebug,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: 0,
            max_clients: DEFAULT_MAX_CLIENTS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            shared_key: None,
            shared_key_required: false,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            heartbeat: HeartbeatConfig::default(),
            delimiter: Delimiter::default(),
            include_delimiter: false,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            stream_debug: StreamDebug::Off,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.max_clients == 0 {
            return Err(ConfigError::InvalidMaxClients);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        validate_shared_key(self.shared_key_required, &self.shared_key)?;
        if self.shared_key_required && self.handshake_timeout_ms == 0 {
            return Err(ConfigError::InvalidHandshakeTimeout);
        }
        self.heartbeat.validate()
    }

    pub fn handshake_key(&self) -> Option<&str> {
        if self.shared_key_required {
            self.shared_key.as_deref()
        } else {
            None
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Parameters of a UDP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Local port; 0 lets the OS choose.
    #[serde(default)]
    pub port: u16,
    /// Default destination for `send_text` / `send_bytes`.
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Datagrams held for the dispatcher before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub stream_debug: StreamDebug,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: 0,
            remote_host: None,
            remote_port: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stream_debug: StreamDebug::Off,
        }
    }
}

impl UdpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }
        if self.remote_port == Some(0) {
            return Err(ConfigError::InvalidPort(0));
        }
        Ok(())
    }
}
