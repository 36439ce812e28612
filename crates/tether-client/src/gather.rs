//! Line gathering on top of a supervised link.

use tether_core::{ConnectionState, Framer};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::event::LinkEvent;

const LINE_CAPACITY: usize = 1024;

/// Subscribes to a link's received bytes and republishes complete messages.
///
/// The partial-message buffer is dropped whenever the link starts a new
/// connection, so a message is never stitched together from two sessions.
/// After [`Gather::stop`] (or drop) no further lines are published, even if a
/// partial message is still buffered.
pub struct Gather {
    lines: broadcast::Sender<String>,
    task: JoinHandle<()>,
}

impl Gather {
    /// Start framing `events` with `framer`.
    pub fn attach(
        device: impl Into<String>,
        mut events: broadcast::Receiver<LinkEvent>,
        mut framer: Framer,
    ) -> Self {
        let device = device.into();
        let (lines, _) = broadcast::channel(LINE_CAPACITY);
        let publisher = lines.clone();

        let task = tokio::spawn(async move {
            let mut complete = Vec::new();
            loop {
                match events.recv().await {
                    Ok(LinkEvent::Received(bytes)) => {
                        if let Err(e) = framer.push(&bytes, &mut complete) {
                            warn!(device = %device, error = %e, "partial message discarded");
                        }
                        for line in complete.drain(..) {
                            trace!(device = %device, line = %line, "line received");
                            let _ = publisher.send(line);
                        }
                    }
                    Ok(LinkEvent::ConnectionChanged {
                        current: ConnectionState::Connecting,
                        ..
                    }) => framer.reset(),
                    Ok(LinkEvent::ConnectionChanged { .. }) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(device = %device, skipped, "gather fell behind, partial message dropped");
                        framer.reset();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self { lines, task }
    }

    /// Subscribe to complete messages.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.lines.subscribe()
    }

    /// Stop gathering.
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Gather {
    fn drop(&mut self) {
        self.task.abort();
    }
}
