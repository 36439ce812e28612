//! Heartbeat policy.
//!
//! The policy decides which inbound messages keep a peer alive. The timer
//! itself belongs to whoever owns the connection task.

use crate::config::HeartbeatConfig;
use std::time::Duration;

/// Notice sent to a peer right before it is dropped for silence.
pub const EXPIRED_NOTICE: &str = "Heartbeat not received, disconnecting";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    interval: Duration,
    token: Option<String>,
}

impl HeartbeatPolicy {
    pub fn new(interval: Duration, token: Option<String>) -> Self {
        Self {
            interval,
            token: token.filter(|t| !t.is_empty()),
        }
    }

    /// `None` unless heartbeat is required.
    pub fn from_config(config: &HeartbeatConfig) -> Option<Self> {
        config.required.then(|| {
            Self::new(
                Duration::from_millis(config.interval_ms),
                config.token.clone(),
            )
        })
    }

    /// Longest silence tolerated.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Whether `message` resets the peer's timer.
    pub fn resets(&self, message: &str) -> bool {
        match &self.token {
            Some(token) => message.trim_end_matches(['\r', '\n']) == token,
            None => true,
        }
    }

    /// Whether `message` is the heartbeat token itself. Such messages are
    /// consumed rather than passed to the application.
    pub fn is_token(&self, message: &str) -> bool {
        self.token
            .as_deref()
            .is_some_and(|token| message.trim_end_matches(['\r', '\n']) == token)
    }

    /// How often a client sends its token: twice per interval, so one lost
    /// heartbeat does not drop the link.
    pub fn send_interval(&self) -> Duration {
        (self.interval / 2).max(Duration::from_millis(1))
    }

    /// The token followed by `terminator`, the end-of-message marker the
    /// receiving framer splits on.
    pub fn beat(&self, terminator: &str) -> Option<Vec<u8>> {
        self.token
            .as_ref()
            .map(|token| format!("{token}{terminator}").into_bytes())
    }
}
