//! UDP endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tether_core::{ConfigError, UdpConfig};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::queue::{InboundEntry, InboundQueue};

const EVENT_CAPACITY: usize = 1024;

/// Notifications from a [`UdpEndpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpEvent {
    /// A datagram, delivered in arrival order.
    Message(InboundEntry),
    /// The endpoint was closed.
    Closed,
}

/// A bound UDP socket whose datagrams are queued and dispatched as
/// [`UdpEvent::Message`].
pub struct UdpEndpoint {
    key: String,
    config: UdpConfig,
    socket: Arc<UdpSocket>,
    events: broadcast::Sender<UdpEvent>,
    queue: InboundQueue,
    receiver: JoinHandle<()>,
    closed: AtomicBool,
}

impl UdpEndpoint {
    /// Bind the socket and start receiving.
    pub async fn bind(key: impl Into<String>, config: UdpConfig) -> tether_core::Result<Self> {
        let key = key.into();
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind((config.bind_address.as_str(), config.port)).await?);
        let local = socket.local_addr()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let publisher = events.clone();
        let queue = InboundQueue::new(key.clone(), config.queue_capacity, move |entry| {
            let _ = publisher.send(UdpEvent::Message(entry));
        });

        let receiver = tokio::spawn(receive_loop(
            key.clone(),
            config.clone(),
            Arc::clone(&socket),
            queue.clone(),
        ));
        info!(device = %key, %local, "udp endpoint bound");

        Ok(Self {
            key,
            config,
            socket,
            events,
            queue,
            receiver,
            closed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UdpEvent> {
        self.events.subscribe()
    }

    /// Send text to the configured remote.
    pub async fn send_text(&self, text: &str) -> tether_core::Result<usize> {
        self.send_bytes(text.as_bytes()).await
    }

    /// Send bytes to the configured remote.
    pub async fn send_bytes(&self, data: &[u8]) -> tether_core::Result<usize> {
        let (Some(host), Some(port)) = (self.config.remote_host.as_deref(), self.config.remote_port)
        else {
            return Err(ConfigError::MissingHost.into());
        };
        self.send_to((host, port), data).await
    }

    /// Send bytes to an explicit destination.
    pub async fn send_to(
        &self,
        target: impl ToSocketAddrs,
        data: &[u8],
    ) -> tether_core::Result<usize> {
        self.config.stream_debug.trace_tx(&self.key, "udp", data);
        Ok(self.socket.send_to(data, target).await?)
    }

    /// Stop receiving and drop anything still queued.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.receiver.abort();
        self.queue.close();
        info!(device = %self.key, "udp endpoint closed");
        let _ = self.events.send(UdpEvent::Closed);
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.receiver.abort();
        self.queue.close();
    }
}

async fn receive_loop(key: String, config: UdpConfig, socket: Arc<UdpSocket>, queue: InboundQueue) {
    let mut buf = vec![0u8; config.buffer_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, source)) => {
                let payload = &buf[..n];
                config.stream_debug.trace_rx(&key, &source.to_string(), payload);
                queue.enqueue(InboundEntry::new(payload.to_vec(), source));
            }
            Err(e) => warn!(device = %key, error = %e, "udp receive failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> UdpConfig {
        UdpConfig {
            bind_address: "127.0.0.1".into(),
            ..UdpConfig::default()
        }
    }

    #[tokio::test]
    async fn send_without_remote_is_a_config_error() {
        let endpoint = UdpEndpoint::bind("udp", loopback()).await.unwrap();
        let err = endpoint.send_text("hello").await.unwrap_err();
        assert!(matches!(err, tether_core::Error::Config(ConfigError::MissingHost)));
    }

    #[tokio::test]
    async fn bind_validates() {
        let config = UdpConfig {
            queue_capacity: 0,
            ..loopback()
        };
        assert!(UdpEndpoint::bind("udp", config).await.is_err());
    }
}
