//! Starting and stopping configured devices.

use tether_client::{Gather, LinkEvent, ShellChannel, ShellClient, TcpChannel, TcpClient};
use tether_server::{ServerEvent, TcpServer, UdpEndpoint, UdpEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::devices::{Device, Transport};

/// A started device and the task logging its traffic.
pub struct Running {
    key: String,
    endpoint: Endpoint,
    logger: JoinHandle<()>,
}

enum Endpoint {
    Tcp(TcpClient, Gather),
    Ssh(ShellClient, Gather),
    Udp(UdpEndpoint),
    Server(TcpServer),
}

impl Running {
    pub async fn start(device: Device) -> anyhow::Result<Self> {
        let key = device.key;
        let (endpoint, logger) = match device.transport {
            Transport::Tcp(config) => {
                let client = TcpClient::new(key.clone(), config, TcpChannel);
                let gather = client.gather()?;
                let logger = log_link(key.clone(), client.subscribe(), gather.subscribe());
                client.connect();
                (Endpoint::Tcp(client, gather), logger)
            }
            Transport::Ssh(config) => {
                let client = ShellClient::new(key.clone(), config, ShellChannel::default());
                let gather = client.gather()?;
                let logger = log_link(key.clone(), client.subscribe(), gather.subscribe());
                client.connect();
                (Endpoint::Ssh(client, gather), logger)
            }
            Transport::Udp(config) => {
                let endpoint = UdpEndpoint::bind(key.clone(), config).await?;
                let logger = log_udp(key.clone(), endpoint.subscribe());
                (Endpoint::Udp(endpoint), logger)
            }
            Transport::TcpServer(config) => {
                let server = TcpServer::new(key.clone(), config);
                let logger = log_server(key.clone(), server.subscribe());
                server.listen().await?;
                (Endpoint::Server(server), logger)
            }
        };
        Ok(Self {
            key,
            endpoint,
            logger,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn stop(self) {
        match &self.endpoint {
            Endpoint::Tcp(client, gather) => {
                gather.stop();
                client.disconnect();
            }
            Endpoint::Ssh(client, gather) => {
                gather.stop();
                client.disconnect();
            }
            Endpoint::Udp(endpoint) => endpoint.close(),
            Endpoint::Server(server) => server.shutdown(),
        }
        self.logger.abort();
        info!(device = %self.key, "stopped");
    }
}

fn log_link(
    device: String,
    mut events: broadcast::Receiver<LinkEvent>,
    mut lines: broadcast::Receiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(LinkEvent::ConnectionChanged { current, .. }) => {
                        info!(device = %device, state = %current, "link state");
                    }
                    Ok(LinkEvent::Received(_)) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(device = %device, skipped, "log fell behind"),
                    Err(RecvError::Closed) => break,
                },
                line = lines.recv() => match line {
                    Ok(line) => info!(device = %device, %line, "message"),
                    Err(RecvError::Lagged(skipped)) => warn!(device = %device, skipped, "log fell behind"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

fn log_udp(device: String, mut events: broadcast::Receiver<UdpEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(UdpEvent::Message(entry)) => {
                    info!(device = %device, source = %entry.source(), text = %entry.text, "datagram");
                }
                Ok(UdpEvent::Closed) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => warn!(device = %device, skipped, "log fell behind"),
            }
        }
    })
}

fn log_server(device: String, mut events: broadcast::Receiver<ServerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServerEvent::Message { peer, text }) => {
                    info!(device = %device, %peer, %text, "message");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(device = %device, skipped, "log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
