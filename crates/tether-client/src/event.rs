//! Events published by a supervised link.

use std::borrow::Cow;
use tether_core::ConnectionState;

/// Notifications from a [`crate::Supervisor`], delivered over a broadcast
/// channel in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The lifecycle state changed.
    ConnectionChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    /// Raw bytes received after the handshake (if any) completed.
    Received(Vec<u8>),
}

impl LinkEvent {
    /// Received bytes as text, replacing invalid UTF-8.
    pub fn text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Received(bytes) => Some(String::from_utf8_lossy(bytes)),
            Self::ConnectionChanged { .. } => None,
        }
    }
}
