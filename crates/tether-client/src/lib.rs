//! Client-side device links.
//!
//! A [`Supervisor`] keeps one outgoing connection alive over any [`Channel`]
//! (plain TCP or an `ssh` shell), optionally gated by the shared-key
//! handshake, and publishes what it receives as [`LinkEvent`]s. A [`Gather`]
//! turns those bytes into delimited messages.
//!
//! ```no_run
//! use tether_client::{TcpClient, TcpChannel};
//! use tether_core::EndpointConfig;
//!
//! # async fn run() {
//! let client = TcpClient::new("projector", EndpointConfig::new("10.0.0.20", 4352), TcpChannel);
//! let gather = client.gather().expect("valid delimiter");
//! let mut lines = gather.subscribe();
//! client.connect();
//! client.send_text("%1POWR ?\r");
//! while let Ok(line) = lines.recv().await {
//!     println!("{line}");
//! }
//! # }
//! ```

mod channel;
mod event;
mod gather;
mod supervisor;

pub use channel::{Channel, Link, ShellChannel, TcpChannel};
pub use event::LinkEvent;
pub use gather::Gather;
pub use supervisor::{OUTBOUND_CAPACITY, Supervisor};

/// A supervised TCP connection.
pub type TcpClient = Supervisor<TcpChannel>;

/// A supervised `ssh` shell session.
pub type ShellClient = Supervisor<ShellChannel>;
