//! Byte channels a [`crate::Supervisor`] can drive.
//!
//! A channel only knows how to open a duplex byte stream to the configured
//! endpoint. Everything above that (reconnects, handshake, framing) is shared
//! by all channels.

use std::future::Future;
use std::io;
use std::process::Stdio;

use tether_core::EndpointConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

/// An open duplex stream.
///
/// Dropping the link closes it: socket halves are closed and a spawned
/// transport process is killed.
pub struct Link {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Description of the remote end, used in diagnostics.
    pub remote: String,
    process: Option<Child>,
}

impl Link {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        remote: impl Into<String>,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote: remote.into(),
            process: None,
        }
    }

    /// A link backed by a child process; the process dies with the link.
    pub fn with_process(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        remote: impl Into<String>,
        process: Child,
    ) -> Self {
        Self {
            process: Some(process),
            ..Self::new(reader, writer, remote)
        }
    }

    /// Whether a transport process is attached.
    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }
}

/// Something that can open a [`Link`] to an endpoint.
pub trait Channel: Send + Sync + 'static {
    /// Short transport name for diagnostics ("tcp", "ssh").
    fn kind(&self) -> &'static str;

    /// Open a new link. Called once per connection attempt.
    fn open(&self, config: &EndpointConfig) -> impl Future<Output = io::Result<Link>> + Send;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpChannel;

impl Channel for TcpChannel {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn open(&self, config: &EndpointConfig) -> io::Result<Link> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        stream.set_nodelay(true)?;
        let remote = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| format!("{}:{}", config.host, config.port));
        let (reader, writer) = stream.into_split();
        Ok(Link::new(reader, writer, remote))
    }
}

/// An interactive shell over the system `ssh` client.
///
/// Transport security and authentication are entirely up to the external
/// program. Key-based login works out of the box; when a password is
/// configured the client is run under `sshpass -e`.
#[derive(Debug, Clone)]
pub struct ShellChannel {
    program: String,
}

impl ShellChannel {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, config: &EndpointConfig) -> io::Result<(Command, String)> {
        let credentials = config.credentials.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "shell channel needs credentials")
        })?;
        let target = format!("{}@{}", credentials.username, config.host);

        let mut command = match &credentials.password {
            Some(password) => {
                let mut command = Command::new("sshpass");
                command.arg("-e").arg(&self.program).env("SSHPASS", password);
                command
            }
            None => Command::new(&self.program),
        };
        command
            .args(["-tt", "-o", "StrictHostKeyChecking=accept-new", "-p"])
            .arg(config.port.to_string())
            .arg(&target)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Ok((command, target))
    }
}

impl Default for ShellChannel {
    fn default() -> Self {
        Self::new("ssh")
    }
}

impl Channel for ShellChannel {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn open(&self, config: &EndpointConfig) -> io::Result<Link> {
        let (mut command, target) = self.command(config)?;
        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("shell stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("shell stdin not captured"))?;
        Ok(Link::with_process(stdout, stdin, target, child))
    }
}
