//! Peer identifiers for server endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one accepted connection on a server endpoint.
///
/// Ids are handed out in accept order and never reused within the lifetime of
/// a server instance. Rendered as `peer-<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(u64);

impl PeerId {
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    /// The numeric index.
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let index = s
            .strip_prefix("peer-")
            .ok_or_else(|| PeerIdParseError::MissingPrefix(s.to_string()))?;
        index
            .parse()
            .map(Self)
            .map_err(|_| PeerIdParseError::InvalidIndex(index.to_string()))
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.to_string()
    }
}

/// Error parsing a peer id string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PeerIdParseError {
    #[error("peer id must start with 'peer-', got: {0}")]
    MissingPrefix(String),
    #[error("peer index is not a number: {0}")]
    InvalidIndex(String),
}
