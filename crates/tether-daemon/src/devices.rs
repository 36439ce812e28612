//! Device file format.
//!
//! ```toml
//! [[device]]
//! key = "projector"
//! transport = "tcp"
//! host = "10.0.0.20"
//! port = 4352
//! delimiter = { text = "\r" }
//!
//! [[device]]
//! key = "panel-listener"
//! transport = "tcp-server"
//! port = 5000
//! shared_key = "s3cret"
//! shared_key_required = true
//! ```

use anyhow::{Context, bail};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tether_core::{EndpointConfig, ServerConfig, UdpConfig};

#[derive(Debug, Deserialize)]
pub struct DeviceFile {
    #[serde(default, rename = "device")]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub key: String,
    #[serde(flatten)]
    pub transport: Transport,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum Transport {
    Tcp(EndpointConfig),
    Ssh(EndpointConfig),
    Udp(UdpConfig),
    TcpServer(ServerConfig),
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Ssh(_) => "ssh",
            Self::Udp(_) => "udp",
            Self::TcpServer(_) => "tcp-server",
        }
    }
}

impl DeviceFile {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let file: Self = toml::from_str(text)?;
        let mut seen = HashSet::new();
        for device in &file.devices {
            if device.key.trim().is_empty() {
                bail!("device with empty key");
            }
            if !seen.insert(device.key.as_str()) {
                bail!("duplicate device key {:?}", device.key);
            }
        }
        Ok(file)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Keep only the device named `key`.
    pub fn select(mut self, key: &str) -> anyhow::Result<Self> {
        self.devices.retain(|d| d.key == key);
        if self.devices.is_empty() {
            bail!("no device named {key:?}");
        }
        Ok(self)
    }
}
