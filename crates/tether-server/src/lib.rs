//! Listening endpoints for tether.
//!
//! - [`TcpServer`]: accepts device connections, runs the shared-key handshake
//!   and heartbeat per peer, and publishes framed messages.
//! - [`UdpEndpoint`]: receives datagrams into an [`InboundQueue`] drained by a
//!   single dispatcher task.

mod queue;
pub mod tcp;
pub mod udp;

pub use queue::{InboundEntry, InboundQueue};
pub use tcp::{
    DisconnectReason, OUTBOUND_CAPACITY, PeerInfo, ServerEvent, ServerState, TcpServer,
};
pub use udp::{UdpEndpoint, UdpEvent};
