//! Core types for tether.
//!
//! This crate holds the transport-agnostic pieces of a device link: the
//! connection lifecycle states, endpoint configuration, the delimiter framer,
//! the shared-key handshake guard and the heartbeat policy. Transports live in
//! `tether-client` and `tether-server`; this crate never touches a socket.

pub mod config;
mod debug;
mod error;
pub mod framer;
pub mod handshake;
pub mod heartbeat;
mod peer;
mod state;

pub use config::{
    Credentials, EndpointConfig, HeartbeatConfig, ServerConfig, UdpConfig,
};
pub use debug::StreamDebug;
pub use error::{ConfigError, Error, Result};
pub use framer::{Delimiter, Frame, Framer, FramerError};
pub use handshake::{ClientGuard, HandshakeError, HandshakeState, ServerGuard};
pub use heartbeat::HeartbeatPolicy;
pub use peer::PeerId;
pub use state::ConnectionState;
