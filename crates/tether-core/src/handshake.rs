//! Shared-key handshake.
//!
//! The server speaks first:
//!
//! ```text
//! server                         client
//!   │── <key>\n ──────────────────▶│  client compares with its own key
//!   │◀───────────────── <key>\n ───│  server compares with its own key
//!   │── Shared Key Match\n ───────▶│
//!   │        application traffic    │
//! ```
//!
//! Either side closes the connection on a mismatch, an overlong line or a
//! stalled exchange; the server first sends `Shared Key Does Not Match`. Lines are compared after trimming trailing
//! `\r` / `\n`, case-sensitively, with plain string equality.
//!
//! The guards only interpret bytes; sending and closing is left to the caller.
//! Bytes that follow the final handshake line in the same read are handed back
//! so the framer never sees handshake lines and never loses application data.

use thiserror::Error;

/// Acknowledgement sent by the server once the client's key matched.
pub const ACK: &str = "Shared Key Match";

/// Sent by the server before it drops a client with the wrong key.
pub const REJECT: &str = "Shared Key Does Not Match";

/// Longest handshake line accepted before giving up.
pub const MAX_LINE_LEN: usize = 1024;

/// Handshake failures. All of them end the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("peer presented the wrong shared key")]
    Mismatch,

    #[error("peer rejected our shared key")]
    Rejected,

    #[error("unexpected handshake reply: {0:?}")]
    UnexpectedReply(String),

    #[error("handshake line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("no shared key within {0}ms")]
    TimedOut(u64),
}

/// Where a connection is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the peer's key.
    AwaitingSecret,
    /// Client only: our key was sent, waiting for the server's verdict.
    AwaitingAck,
    /// Application traffic may flow.
    Verified,
}

/// Result of feeding bytes into a guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// More input is needed.
    Pending,
    /// The handshake completed; the bytes belong to the application stream.
    Verified(Vec<u8>),
}

/// What the caller has to do after a client guard consumed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStep {
    /// Bytes to send to the server, if any.
    pub reply: Option<Vec<u8>>,
    pub outcome: Outcome,
}

/// Accumulates input and yields complete `\n`-terminated lines.
#[derive(Debug, Default)]
struct LineReader {
    buffer: Vec<u8>,
}

impl LineReader {
    fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_line(&mut self) -> Result<Option<String>, HandshakeError> {
        match self.buffer.iter().position(|&b| b == b'\n') {
            Some(at) => {
                let line: Vec<u8> = self.buffer.drain(..=at).collect();
                let text = String::from_utf8_lossy(&line);
                Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
            }
            None if self.buffer.len() > MAX_LINE_LEN => {
                Err(HandshakeError::LineTooLong(MAX_LINE_LEN))
            }
            None => Ok(None),
        }
    }

    fn take_rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

fn line(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Client half of the handshake.
#[derive(Debug)]
pub struct ClientGuard {
    key: String,
    state: HandshakeState,
    reader: LineReader,
}

impl ClientGuard {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: HandshakeState::AwaitingSecret,
            reader: LineReader::default(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Feed received bytes.
    ///
    /// Returns the reply to send (our key, once the server's key matched) and
    /// whether the handshake is complete.
    pub fn feed(&mut self, data: &[u8]) -> Result<ClientStep, HandshakeError> {
        if self.state == HandshakeState::Verified {
            return Ok(ClientStep {
                reply: None,
                outcome: Outcome::Verified(data.to_vec()),
            });
        }

        self.reader.push(data);
        let mut reply = None;
        while let Some(received) = self.reader.next_line()? {
            match self.state {
                HandshakeState::AwaitingSecret => {
                    if received != self.key {
                        return Err(HandshakeError::Mismatch);
                    }
                    reply = Some(line(&self.key));
                    self.state = HandshakeState::AwaitingAck;
                }
                HandshakeState::AwaitingAck => {
                    if received == ACK {
                        self.state = HandshakeState::Verified;
                        return Ok(ClientStep {
                            reply,
                            outcome: Outcome::Verified(self.reader.take_rest()),
                        });
                    }
                    if received == REJECT {
                        return Err(HandshakeError::Rejected);
                    }
                    return Err(HandshakeError::UnexpectedReply(received));
                }
                HandshakeState::Verified => unreachable!("handled above"),
            }
        }
        Ok(ClientStep {
            reply,
            outcome: Outcome::Pending,
        })
    }
}

/// Server half of the handshake, one per accepted peer.
#[derive(Debug)]
pub struct ServerGuard {
    key: String,
    state: HandshakeState,
    reader: LineReader,
}

impl ServerGuard {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: HandshakeState::AwaitingSecret,
            reader: LineReader::default(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The line the server sends as soon as the peer connects.
    pub fn greeting(&self) -> Vec<u8> {
        line(&self.key)
    }

    /// The acknowledgement line.
    pub fn ack() -> Vec<u8> {
        line(ACK)
    }

    /// The rejection line.
    pub fn reject() -> Vec<u8> {
        line(REJECT)
    }

    /// Feed bytes received from the peer.
    pub fn feed(&mut self, data: &[u8]) -> Result<Outcome, HandshakeError> {
        if self.state == HandshakeState::Verified {
            return Ok(Outcome::Verified(data.to_vec()));
        }

        self.reader.push(data);
        match self.reader.next_line()? {
            None => Ok(Outcome::Pending),
            Some(received) if received == self.key => {
                self.state = HandshakeState::Verified;
                Ok(Outcome::Verified(self.reader.take_rest()))
            }
            Some(_) => Err(HandshakeError::Mismatch),
        }
    }
}
