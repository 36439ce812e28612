//! Error types.
//!
//! Lifecycle methods on supervisors and servers never hand these to the
//! caller; they are logged and folded into a state change. They surface from
//! the fallible helpers (config validation, channel open, bind).

use crate::framer::FramerError;
use crate::handshake::HandshakeError;
use thiserror::Error;

/// Top-level error for tether operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Incomplete or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Socket, process or timeout failure at the channel boundary.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Shared-key verification failed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The peer went silent for longer than the heartbeat interval.
    #[error("no heartbeat within {interval_ms}ms")]
    Heartbeat { interval_ms: u64 },

    /// The framer gave up on the stream.
    #[error("framing error: {0}")]
    Framing(#[from] FramerError),
}

/// Configuration errors, reported when an endpoint is asked to connect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("host is missing")]
    MissingHost,

    #[error("port {0} is outside 1..=65535")]
    InvalidPort(u16),

    #[error("shared key is required but not configured")]
    MissingSharedKey,

    #[error("shared key is required but the handshake timeout is zero")]
    InvalidHandshakeTimeout,

    #[error("heartbeat is required but its interval is zero")]
    InvalidHeartbeatInterval,

    #[error("buffer size must be non-zero")]
    InvalidBufferSize,

    #[error("max_clients must be at least 1")]
    InvalidMaxClients,

    #[error("queue capacity must be non-zero")]
    InvalidQueueCapacity,
}

pub type Result<T> = std::result::Result<T, Error>;
