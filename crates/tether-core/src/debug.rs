//! Payload tracing for troubleshooting a device link.

use serde::{Deserialize, Serialize};

/// Which directions of a stream are traced at `debug` level under the
/// `tether::stream` target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamDebug {
    #[default]
    Off,
    Rx,
    Tx,
    Both,
}

impl StreamDebug {
    pub fn rx(self) -> bool {
        matches!(self, Self::Rx | Self::Both)
    }

    pub fn tx(self) -> bool {
        matches!(self, Self::Tx | Self::Both)
    }

    /// Trace bytes received from `peer` on device `device`.
    pub fn trace_rx(self, device: &str, peer: &str, data: &[u8]) {
        if self.rx() {
            tracing::debug!(
                target: "tether::stream",
                device,
                peer,
                len = data.len(),
                "RX {:?}",
                String::from_utf8_lossy(data)
            );
        }
    }

    /// Trace bytes sent to `peer` on device `device`.
    pub fn trace_tx(self, device: &str, peer: &str, data: &[u8]) {
        if self.tx() {
            tracing::debug!(
                target: "tether::stream",
                device,
                peer,
                len = data.len(),
                "TX {:?}",
                String::from_utf8_lossy(data)
            );
        }
    }
}
