//! TCP server tests over loopback.

use std::net::SocketAddr;
use std::time::Duration;

use tether_client::{LinkEvent, TcpChannel, TcpClient};
use tether_core::{ConnectionState, Delimiter, EndpointConfig, PeerId, ServerConfig};
use tether_server::{DisconnectReason, OUTBOUND_CAPACITY, ServerEvent, ServerState, TcpServer};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::broadcast;
use tokio::time::timeout;

fn config() -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".into(),
        ..ServerConfig::default()
    }
}

fn keyed() -> ServerConfig {
    ServerConfig {
        shared_key: Some("s3cret".into()),
        shared_key_required: true,
        ..config()
    }
}

async fn start(config: ServerConfig) -> (TcpServer, SocketAddr, broadcast::Receiver<ServerEvent>) {
    let server = TcpServer::new("test-server", config);
    let events = server.subscribe();
    let addr = server.listen().await.unwrap();
    (server, addr, events)
}

async fn next_event(
    events: &mut broadcast::Receiver<ServerEvent>,
    mut want: impl FnMut(&ServerEvent) -> bool,
) -> ServerEvent {
    timeout(Duration::from_secs(3), async {
        loop {
            let event = events.recv().await.unwrap();
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

async fn connected(events: &mut broadcast::Receiver<ServerEvent>) -> PeerId {
    match next_event(events, |e| matches!(e, ServerEvent::PeerConnected { .. })).await {
        ServerEvent::PeerConnected { peer, .. } => peer,
        _ => unreachable!(),
    }
}

async fn message(events: &mut broadcast::Receiver<ServerEvent>) -> (PeerId, String) {
    match next_event(events, |e| matches!(e, ServerEvent::Message { .. })).await {
        ServerEvent::Message { peer, text } => (peer, text),
        _ => unreachable!(),
    }
}

async fn disconnected(events: &mut broadcast::Receiver<ServerEvent>) -> (PeerId, DisconnectReason) {
    match next_event(events, |e| matches!(e, ServerEvent::PeerDisconnected { .. })).await {
        ServerEvent::PeerDisconnected { peer, reason } => (peer, reason),
        _ => unreachable!(),
    }
}

struct RawPeer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawPeer {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
    }

    /// Next line including its terminator; empty at end of stream.
    async fn line(&mut self) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(3), self.reader.read_line(&mut line))
            .await
            .expect("no line from server")
            .unwrap();
        line
    }

    async fn handshake(&mut self, key: &str) {
        assert_eq!(self.line().await, format!("{key}\n"));
        self.send(&format!("{key}\n")).await;
        assert_eq!(self.line().await, "Shared Key Match\n");
    }
}

#[tokio::test]
async fn plain_peer_messages_are_framed() {
    let (server, addr, mut events) = start(ServerConfig {
        delimiter: Delimiter::text("\r\n"),
        ..config()
    })
    .await;

    let mut client = RawPeer::connect(addr).await;
    let peer = connected(&mut events).await;
    next_event(&mut events, |e| matches!(e, ServerEvent::PeerReady { .. })).await;

    client.send("hello\r\nwor").await;
    client.send("ld\r\n").await;
    assert_eq!(message(&mut events).await, (peer, "hello".to_string()));
    assert_eq!(message(&mut events).await, (peer, "world".to_string()));

    assert!(server.send_to(peer, "ack\n"));
    assert_eq!(client.line().await, "ack\n");

    let peers = server.peers();
    assert_eq!(peers.len(), 1);
    assert!(peers[0].ready);
    server.shutdown();
}

#[tokio::test]
async fn stalled_peer_bounds_its_send_queue() {
    let (server, addr, mut events) = start(config()).await;
    let _client = RawPeer::connect(addr).await;
    let peer = connected(&mut events).await;

    let chunk = "x".repeat(1024);
    let accepted = (0..1000).filter(|_| server.send_to(peer, &chunk)).count();
    assert!(accepted >= OUTBOUND_CAPACITY, "accepted {accepted}");
    assert!(accepted < 1000, "every write was queued");
    assert_eq!(server.peers().len(), 1);
    server.shutdown();
}

#[tokio::test]
async fn max_clients_refuses_extra_connections() {
    let (server, addr, mut events) = start(ServerConfig {
        max_clients: 1,
        ..config()
    })
    .await;

    let _first = RawPeer::connect(addr).await;
    connected(&mut events).await;

    let mut second = RawPeer::connect(addr).await;
    assert_eq!(second.line().await, "", "extra connection should be closed");
    assert_eq!(server.peers().len(), 1);
    server.shutdown();
}

#[tokio::test]
async fn disconnect_drops_one_peer() {
    let (server, addr, mut events) = start(config()).await;
    let mut client = RawPeer::connect(addr).await;
    let peer = connected(&mut events).await;

    assert!(server.disconnect(peer));
    assert_eq!(client.line().await, "");
    assert_eq!(disconnected(&mut events).await, (peer, DisconnectReason::Kicked));
    assert!(!server.disconnect(peer));
    assert!(server.peers().is_empty());
}

#[tokio::test]
async fn remote_close_is_reported() {
    let (server, addr, mut events) = start(config()).await;
    let client = RawPeer::connect(addr).await;
    let peer = connected(&mut events).await;

    drop(client);
    assert_eq!(disconnected(&mut events).await, (peer, DisconnectReason::Closed));
    assert!(server.peers().is_empty());
}

#[tokio::test]
async fn shutdown_stops_everything() {
    let (server, addr, mut events) = start(config()).await;
    let mut client = RawPeer::connect(addr).await;
    let peer = connected(&mut events).await;

    server.shutdown();
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(client.line().await, "");
    assert_eq!(disconnected(&mut events).await, (peer, DisconnectReason::Shutdown));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn wrong_key_is_rejected_before_any_message() {
    let (server, addr, mut events) = start(keyed()).await;
    let mut client = RawPeer::connect(addr).await;
    let peer = connected(&mut events).await;

    assert_eq!(client.line().await, "s3cret\n");
    client.send("guess\nPOWER OFF\n").await;
    assert_eq!(client.line().await, "Shared Key Does Not Match\n");
    assert_eq!(client.line().await, "");

    let event = next_event(&mut events, |e| {
        matches!(
            e,
            ServerEvent::Message { .. } | ServerEvent::PeerReady { .. } | ServerEvent::PeerDisconnected { .. }
        )
    })
    .await;
    assert_eq!(
        event,
        ServerEvent::PeerDisconnected {
            peer,
            reason: DisconnectReason::HandshakeFailed
        }
    );
    assert!(server.peers().is_empty());
}

#[tokio::test]
async fn overlong_handshake_line_is_rejected() {
    let (server, addr, mut events) = start(keyed()).await;
    let mut client = RawPeer::connect(addr).await;
    let peer = connected(&mut events).await;

    assert_eq!(client.line().await, "s3cret\n");
    client.send(&"x".repeat(1100)).await;
    assert_eq!(client.line().await, "Shared Key Does Not Match\n");
    assert_eq!(client.line().await, "");
    assert_eq!(
        disconnected(&mut events).await,
        (peer, DisconnectReason::HandshakeFailed)
    );
    assert!(server.peers().is_empty());
}

#[tokio::test]
async fn silent_peer_times_out_and_frees_its_slot() {
    let (server, addr, mut events) = start(ServerConfig {
        max_clients: 1,
        handshake_timeout_ms: 200,
        ..keyed()
    })
    .await;

    let mut silent = RawPeer::connect(addr).await;
    let silent_id = connected(&mut events).await;
    assert_eq!(silent.line().await, "s3cret\n");
    assert_eq!(silent.line().await, "Shared Key Does Not Match\n");
    assert_eq!(silent.line().await, "");
    assert_eq!(
        disconnected(&mut events).await,
        (silent_id, DisconnectReason::HandshakeTimeout)
    );

    let mut next = RawPeer::connect(addr).await;
    let next_id = connected(&mut events).await;
    next.handshake("s3cret").await;
    assert_eq!(
        next_event(&mut events, |e| matches!(e, ServerEvent::PeerReady { .. })).await,
        ServerEvent::PeerReady { peer: next_id }
    );
    server.shutdown();
}

#[tokio::test]
async fn correct_key_releases_trailing_bytes() {
    let (server, addr, mut events) = start(keyed()).await;
    let mut client = RawPeer::connect(addr).await;
    let peer = connected(&mut events).await;
    assert!(!server.peers()[0].ready);
    assert!(!server.send_to(peer, "too early\n"));

    assert_eq!(client.line().await, "s3cret\n");
    client.send("s3cret\nfirst\n").await;
    assert_eq!(client.line().await, "Shared Key Match\n");

    assert_eq!(message(&mut events).await, (peer, "first".to_string()));
    assert!(server.peers()[0].ready);
    server.shutdown();
}

#[tokio::test]
async fn broadcast_skips_unverified_peers() {
    let (server, addr, mut events) = start(keyed()).await;

    let mut verified = RawPeer::connect(addr).await;
    connected(&mut events).await;
    verified.handshake("s3cret").await;
    next_event(&mut events, |e| matches!(e, ServerEvent::PeerReady { .. })).await;

    let _pending = RawPeer::connect(addr).await;
    connected(&mut events).await;

    assert_eq!(server.broadcast("status\n"), 1);
    assert_eq!(verified.line().await, "status\n");
    server.shutdown();
}

#[tokio::test]
async fn heartbeat_expiry_drops_only_the_silent_peer() {
    let mut config = config();
    config.heartbeat.required = true;
    config.heartbeat.interval_ms = 300;
    config.heartbeat.token = Some("PING".into());
    let (server, addr, mut events) = start(config).await;

    let mut alive = RawPeer::connect(addr).await;
    let alive_id = connected(&mut events).await;
    let mut silent = RawPeer::connect(addr).await;
    let silent_id = connected(&mut events).await;

    let beats = tokio::spawn(async move {
        for _ in 0..10 {
            alive.send("PING\n").await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        alive
    });

    assert_eq!(silent.line().await, "Heartbeat not received, disconnecting\n");
    assert_eq!(silent.line().await, "");
    assert_eq!(
        disconnected(&mut events).await,
        (silent_id, DisconnectReason::HeartbeatExpired)
    );

    let mut alive = beats.await.unwrap();
    let peers: Vec<PeerId> = server.peers().into_iter().map(|p| p.id).collect();
    assert_eq!(peers, vec![alive_id]);

    // Heartbeat tokens are consumed, not published.
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ServerEvent::Message { .. }), "{event:?}");
    }

    alive.send("status?\n").await;
    assert_eq!(message(&mut events).await, (alive_id, "status?".to_string()));
    assert!(server.send_to(alive_id, "ok\n"));
    assert_eq!(alive.line().await, "ok\n");
    server.shutdown();
}

#[tokio::test]
async fn heartbeat_token_uses_the_configured_delimiter() {
    let mut config = config();
    config.delimiter = Delimiter::Char(';');
    config.include_delimiter = true;
    config.heartbeat.required = true;
    config.heartbeat.interval_ms = 300;
    config.heartbeat.token = Some("PING".into());
    let (server, addr, mut events) = start(config).await;

    let mut client = RawPeer::connect(addr).await;
    let peer = connected(&mut events).await;
    for _ in 0..8 {
        client.send("PING;").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(server.peers().len(), 1);
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(
                event,
                ServerEvent::Message { .. } | ServerEvent::PeerDisconnected { .. }
            ),
            "{event:?}"
        );
    }

    client.send("status;").await;
    assert_eq!(message(&mut events).await, (peer, "status;".to_string()));
    server.shutdown();
}

#[tokio::test]
async fn any_message_resets_without_token() {
    let mut config = config();
    config.heartbeat.required = true;
    config.heartbeat.interval_ms = 300;
    let (server, addr, mut events) = start(config).await;

    let mut client = RawPeer::connect(addr).await;
    let peer = connected(&mut events).await;
    for n in 0..5 {
        client.send(&format!("reading {n}\n")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(message(&mut events).await, (peer, "reading 0".to_string()));
    assert_eq!(server.peers().len(), 1);
    server.shutdown();
}

#[tokio::test]
async fn client_and_server_end_to_end() {
    let mut server_config = keyed();
    server_config.heartbeat.required = true;
    server_config.heartbeat.interval_ms = 400;
    server_config.heartbeat.token = Some("PING".into());
    let heartbeat = server_config.heartbeat.clone();
    let (server, addr, mut events) = start(server_config).await;

    let mut client_config = EndpointConfig::new("127.0.0.1", addr.port());
    client_config.shared_key = Some("s3cret".into());
    client_config.shared_key_required = true;
    client_config.heartbeat = heartbeat;
    let client = TcpClient::new("panel", client_config, TcpChannel);
    let gather = client.gather().unwrap();
    let mut lines = gather.subscribe();
    let mut link = client.subscribe();
    client.connect();

    let peer = match next_event(&mut events, |e| matches!(e, ServerEvent::PeerReady { .. })).await {
        ServerEvent::PeerReady { peer } => peer,
        _ => unreachable!(),
    };
    timeout(Duration::from_secs(3), async {
        loop {
            if let LinkEvent::ConnectionChanged { current: ConnectionState::Connected, .. } =
                link.recv().await.unwrap()
            {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert!(client.send_text("DEVICE get version\n"));
    assert_eq!(message(&mut events).await, (peer, "DEVICE get version".to_string()));

    assert!(server.send_to(peer, "version 1.2\n"));
    let line = timeout(Duration::from_secs(3), lines.recv()).await.unwrap().unwrap();
    assert_eq!(line, "version 1.2");

    // Client heartbeats keep the peer alive well past one interval.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(server.peers().len(), 1);
    assert!(client.is_connected());

    client.disconnect();
    assert_eq!(disconnected(&mut events).await, (peer, DisconnectReason::Closed));
    server.shutdown();
}
