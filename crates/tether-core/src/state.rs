//! Connection lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one supervised connection.
///
/// ```text
/// Idle ──connect──▶ Connecting ──ok──▶ Connected ──disconnect──▶ Disconnecting
///                        │                 │                          │
///                        ▼                 ▼                          ▼
///                  ConnectFailed   DisconnectedRemotely / LinkDown   DisconnectedByUser
/// ```
///
/// The three failure states are the only ones that feed the reconnect policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Created, never connected.
    #[default]
    Idle,
    /// Opening the channel (and running the handshake, if any).
    Connecting,
    /// Channel open and application traffic flowing.
    Connected,
    /// Closing at the user's request.
    Disconnecting,
    /// Closed by the user; no reconnect follows.
    DisconnectedByUser,
    /// The peer closed the stream or was rejected during the handshake.
    DisconnectedRemotely,
    /// The channel could not be opened.
    ConnectFailed,
    /// An I/O error tore down an established link.
    LinkDown,
}

impl ConnectionState {
    /// States that represent an unplanned loss of the link.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::DisconnectedRemotely | Self::ConnectFailed | Self::LinkDown
        )
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::DisconnectedByUser => "disconnected-by-user",
            Self::DisconnectedRemotely => "disconnected-remotely",
            Self::ConnectFailed => "connect-failed",
            Self::LinkDown => "link-down",
        };
        f.write_str(name)
    }
}
