//! Listening TCP endpoint.
//!
//! Every accepted connection gets its own task that runs the server half of
//! the shared-key handshake, frames inbound bytes and enforces the heartbeat
//! deadline. The registry of live peers is owned by the server instance.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tether_core::handshake::Outcome;
use tether_core::heartbeat::EXPIRED_NOTICE;
use tether_core::{
    Error, Framer, HandshakeError, HeartbeatPolicy, PeerId, ServerConfig, ServerGuard,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Writes queued for one peer before sends to it start failing.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Whether the server accepts new connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ServerState {
    #[default]
    Stopped,
    Listening,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Listening => "listening",
        })
    }
}

/// Why a peer left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its end.
    Closed,
    /// [`TcpServer::disconnect`] was called.
    Kicked,
    /// [`TcpServer::shutdown`] was called.
    Shutdown,
    /// The peer presented the wrong shared key or an unreadable handshake.
    HandshakeFailed,
    /// The peer did not present a shared key in time.
    HandshakeTimeout,
    /// No qualifying message within the heartbeat interval.
    HeartbeatExpired,
    /// Socket error.
    Io(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed by peer"),
            Self::Kicked => f.write_str("disconnected by server"),
            Self::Shutdown => f.write_str("server shut down"),
            Self::HandshakeFailed => f.write_str("shared key handshake failed"),
            Self::HandshakeTimeout => f.write_str("shared key not presented in time"),
            Self::HeartbeatExpired => f.write_str("heartbeat expired"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

/// Notifications from a [`TcpServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    StateChanged {
        previous: ServerState,
        current: ServerState,
    },
    /// A connection was accepted. It may still have to pass the handshake.
    PeerConnected { peer: PeerId, addr: SocketAddr },
    /// The peer may exchange application messages.
    PeerReady { peer: PeerId },
    /// One framed message from a ready peer.
    Message { peer: PeerId, text: String },
    PeerDisconnected {
        peer: PeerId,
        reason: DisconnectReason,
    },
}

/// A connected peer as seen from the outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
    /// Passed the handshake (or none was required).
    pub ready: bool,
}

/// TCP server endpoint.
///
/// Cloning is cheap; clones share the listener and the peer registry.
#[derive(Clone)]
pub struct TcpServer {
    shared: Arc<Shared>,
}

struct Shared {
    key: String,
    config: ServerConfig,
    events: broadcast::Sender<ServerEvent>,
    next_peer: AtomicU64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    state: ServerState,
    local_addr: Option<SocketAddr>,
    accept: Option<JoinHandle<()>>,
    peers: HashMap<PeerId, PeerHandle>,
    /// Peers that still owe us the shared key.
    awaiting_secret: HashSet<PeerId>,
}

struct PeerHandle {
    addr: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    fn queue(&self, device: &str, peer: PeerId, data: &[u8]) -> bool {
        match self.outbound.try_send(data.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(device, %peer, len = data.len(), "send queue full, dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl TcpServer {
    /// Create a stopped server. `key` names the device in diagnostics.
    pub fn new(key: impl Into<String>, config: ServerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                key: key.into(),
                config,
                events,
                next_peer: AtomicU64::new(1),
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ServerState {
        self.shared.inner().state
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.inner().local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Bind and start accepting. Returns the bound address; calling it again
    /// while listening returns the existing address.
    pub async fn listen(&self) -> tether_core::Result<SocketAddr> {
        let shared = &self.shared;
        if let Some(addr) = shared.inner().local_addr {
            return Ok(addr);
        }

        let config = &shared.config;
        config.validate()?;
        let framer = Framer::new(&config.delimiter, config.include_delimiter)?
            .with_max_len(config.max_frame_len);

        let listener = TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;

        let mut inner = shared.inner();
        if let Some(existing) = inner.local_addr {
            return Ok(existing);
        }
        inner.local_addr = Some(addr);
        inner.accept = Some(tokio::spawn(accept_loop(
            Arc::clone(shared),
            listener,
            framer,
        )));
        shared.transition(&mut inner, ServerState::Listening);
        info!(device = %shared.key, %addr, max_clients = config.max_clients, "listening");
        Ok(addr)
    }

    /// Stop accepting new connections. Connected peers stay connected.
    pub fn stop_listening(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner();
        if let Some(accept) = inner.accept.take() {
            accept.abort();
        }
        inner.local_addr = None;
        shared.transition(&mut inner, ServerState::Stopped);
    }

    /// Stop listening and drop every peer.
    pub fn shutdown(&self) {
        self.stop_listening();
        let ids: Vec<PeerId> = self.shared.inner().peers.keys().copied().collect();
        for peer in ids {
            self.shared.remove(peer, DisconnectReason::Shutdown);
        }
    }

    /// Queue `text` for one ready peer. Returns `false` if the peer is unknown,
    /// has not passed the handshake or is [`OUTBOUND_CAPACITY`] writes behind.
    pub fn send_to(&self, peer: PeerId, text: &str) -> bool {
        let inner = self.shared.inner();
        if inner.awaiting_secret.contains(&peer) {
            debug!(device = %self.shared.key, %peer, "peer not verified, send dropped");
            return false;
        }
        match inner.peers.get(&peer) {
            Some(handle) => handle.queue(&self.shared.key, peer, text.as_bytes()),
            None => {
                debug!(device = %self.shared.key, %peer, "unknown peer, send dropped");
                false
            }
        }
    }

    /// Queue `text` for every ready peer. Returns how many peers it was
    /// queued for.
    pub fn broadcast(&self, text: &str) -> usize {
        let inner = self.shared.inner();
        inner
            .peers
            .iter()
            .filter(|&(id, _)| !inner.awaiting_secret.contains(id))
            .filter(|&(&id, handle)| handle.queue(&self.shared.key, id, text.as_bytes()))
            .count()
    }

    /// Drop one peer. Returns `false` if it was not connected.
    pub fn disconnect(&self, peer: PeerId) -> bool {
        self.shared.remove(peer, DisconnectReason::Kicked)
    }

    /// Connected peers in accept order.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let inner = self.shared.inner();
        let mut peers: Vec<PeerInfo> = inner
            .peers
            .iter()
            .map(|(&id, handle)| PeerInfo {
                id,
                addr: handle.addr,
                ready: !inner.awaiting_secret.contains(&id),
            })
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, next: ServerState) {
        let previous = inner.state;
        if previous == next {
            return;
        }
        inner.state = next;
        info!(device = %self.key, %previous, current = %next, "server state changed");
        let _ = self.events.send(ServerEvent::StateChanged {
            previous,
            current: next,
        });
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Register an accepted connection and start its task.
    fn admit(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, framer: Framer) {
        let mut inner = self.inner();
        if inner.peers.len() >= self.config.max_clients {
            warn!(
                device = %self.key,
                %addr,
                max_clients = self.config.max_clients,
                "connection refused, too many clients"
            );
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(device = %self.key, %addr, error = %e, "set_nodelay failed");
        }

        let peer = PeerId::new(self.next_peer.fetch_add(1, Ordering::Relaxed));
        let guard = self.config.handshake_key().map(ServerGuard::new);
        if guard.is_some() {
            inner.awaiting_secret.insert(peer);
        }

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let task = tokio::spawn(run_peer(
            Arc::clone(self),
            peer,
            addr,
            stream,
            guard,
            framer,
            outbound_rx,
        ));
        inner.peers.insert(
            peer,
            PeerHandle {
                addr,
                outbound,
                task,
            },
        );
        info!(device = %self.key, %peer, %addr, "peer connected");
        self.emit(ServerEvent::PeerConnected { peer, addr });
    }

    fn mark_ready(&self, peer: PeerId) {
        let mut inner = self.inner();
        if !inner.peers.contains_key(&peer) {
            return;
        }
        inner.awaiting_secret.remove(&peer);
        debug!(device = %self.key, %peer, "peer ready");
        self.emit(ServerEvent::PeerReady { peer });
    }

    /// Drop a peer from the registry and abort its task. The first caller for
    /// a given peer wins; later calls return `false`.
    fn remove(&self, peer: PeerId, reason: DisconnectReason) -> bool {
        let handle = {
            let mut inner = self.inner();
            inner.awaiting_secret.remove(&peer);
            match inner.peers.remove(&peer) {
                Some(handle) => handle,
                None => return false,
            }
        };
        handle.task.abort();
        info!(device = %self.key, %peer, addr = %handle.addr, %reason, "peer disconnected");
        self.emit(ServerEvent::PeerDisconnected { peer, reason });
        true
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, framer: Framer) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => shared.admit(stream, addr, framer.clone()),
            Err(e) => {
                warn!(device = %shared.key, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn run_peer(
    shared: Arc<Shared>,
    peer: PeerId,
    addr: SocketAddr,
    stream: TcpStream,
    guard: Option<ServerGuard>,
    framer: Framer,
    outbound: mpsc::Receiver<Vec<u8>>,
) {
    let reason = match serve(&shared, peer, addr, stream, guard, framer, outbound).await {
        Ok(()) => DisconnectReason::Closed,
        Err(Error::Handshake(HandshakeError::TimedOut(timeout_ms))) => {
            warn!(device = %shared.key, %peer, %addr, timeout_ms, "shared key handshake timed out");
            DisconnectReason::HandshakeTimeout
        }
        Err(Error::Handshake(e)) => {
            error!(device = %shared.key, %peer, %addr, error = %e, "shared key handshake failed");
            DisconnectReason::HandshakeFailed
        }
        Err(Error::Heartbeat { interval_ms }) => {
            warn!(device = %shared.key, %peer, %addr, interval_ms, "heartbeat expired");
            DisconnectReason::HeartbeatExpired
        }
        Err(e) => {
            warn!(device = %shared.key, %peer, %addr, error = %e, "peer connection failed");
            DisconnectReason::Io(e.to_string())
        }
    };
    shared.remove(peer, reason);
}

/// Serve one peer until it leaves. `Ok` means the peer closed its end.
async fn serve(
    shared: &Shared,
    peer: PeerId,
    addr: SocketAddr,
    stream: TcpStream,
    mut guard: Option<ServerGuard>,
    mut framer: Framer,
    mut outbound: mpsc::Receiver<Vec<u8>>,
) -> Result<(), Error> {
    let config = &shared.config;
    let device = shared.key.as_str();
    let remote = peer.to_string();
    let (mut reader, mut writer) = stream.into_split();

    let heartbeat = HeartbeatPolicy::from_config(&config.heartbeat);
    let include_delimiter = framer.include_delimiter();
    let mut deadline = None;
    let mut handshake_deadline = guard
        .as_ref()
        .map(|_| Instant::now() + config.handshake_timeout());

    match &guard {
        Some(guard) => send(config, device, &remote, &mut writer, &guard.greeting()).await?,
        None => {
            shared.mark_ready(peer);
            deadline = heartbeat.as_ref().map(|h| Instant::now() + h.interval());
        }
    }

    let mut buf = vec![0u8; config.buffer_size];
    let mut frames = Vec::new();
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                let data = &buf[..n];
                config.stream_debug.trace_rx(device, &remote, data);

                let data = match guard.as_mut() {
                    None => data.to_vec(),
                    Some(g) => match g.feed(data) {
                        Ok(Outcome::Pending) => continue,
                        Ok(Outcome::Verified(rest)) => {
                            send(config, device, &remote, &mut writer, &ServerGuard::ack()).await?;
                            guard = None;
                            handshake_deadline = None;
                            shared.mark_ready(peer);
                            deadline = heartbeat.as_ref().map(|h| Instant::now() + h.interval());
                            rest
                        }
                        Err(e) => {
                            let _ = send(config, device, &remote, &mut writer, &ServerGuard::reject()).await;
                            return Err(e.into());
                        }
                    },
                };

                if let Err(e) = framer.push_frames(&data, &mut frames) {
                    warn!(device, %peer, %addr, error = %e, "partial message discarded");
                }
                for frame in frames.drain(..) {
                    if let Some(policy) = &heartbeat {
                        if policy.resets(&frame.body) {
                            deadline = Some(Instant::now() + policy.interval());
                        }
                        if policy.is_token(&frame.body) {
                            continue;
                        }
                    }
                    let text = frame.into_message(include_delimiter);
                    shared.emit(ServerEvent::Message { peer, text });
                }
            }
            Some(data) = outbound.recv() => {
                send(config, device, &remote, &mut writer, &data).await?;
            }
            _ = expired(handshake_deadline) => {
                let _ = send(config, device, &remote, &mut writer, &ServerGuard::reject()).await;
                let timeout_ms = config.handshake_timeout_ms;
                return Err(HandshakeError::TimedOut(timeout_ms).into());
            }
            _ = expired(deadline) => {
                let mut notice = EXPIRED_NOTICE.as_bytes().to_vec();
                notice.push(b'\n');
                let _ = send(config, device, &remote, &mut writer, &notice).await;
                let interval_ms = heartbeat
                    .as_ref()
                    .map_or(0, |h| h.interval().as_millis() as u64);
                return Err(Error::Heartbeat { interval_ms });
            }
        }
    }
}

async fn send(
    config: &ServerConfig,
    device: &str,
    remote: &str,
    writer: &mut OwnedWriteHalf,
    data: &[u8],
) -> std::io::Result<()> {
    config.stream_debug.trace_tx(device, remote, data);
    writer.write_all(data).await?;
    writer.flush().await
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_display() {
        assert_eq!(DisconnectReason::HeartbeatExpired.to_string(), "heartbeat expired");
        assert_eq!(
            DisconnectReason::HandshakeTimeout.to_string(),
            "shared key not presented in time"
        );
        assert_eq!(
            DisconnectReason::Io("broken pipe".into()).to_string(),
            "i/o error: broken pipe"
        );
    }

    #[tokio::test]
    async fn listen_rejects_invalid_config() {
        let config = ServerConfig {
            max_clients: 0,
            ..ServerConfig::default()
        };
        let server = TcpServer::new("bad", config);
        assert!(matches!(server.listen().await, Err(Error::Config(_))));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn listen_is_idempotent() {
        let config = ServerConfig {
            bind_address: "127.0.0.1".into(),
            ..ServerConfig::default()
        };
        let server = TcpServer::new("idem", config);
        let first = server.listen().await.unwrap();
        let second = server.listen().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(server.state(), ServerState::Listening);

        server.stop_listening();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.local_addr(), None);
    }
}
