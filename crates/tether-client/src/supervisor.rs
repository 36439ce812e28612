//! Connection supervisor.
//!
//! A [`Supervisor`] owns one [`Channel`] and drives its lifecycle:
//!
//! - `connect` validates the configuration and spawns a session task that
//!   opens the channel, runs the shared-key handshake if configured, and
//!   then pumps bytes in both directions;
//! - every session carries an epoch; status reports from an older epoch are
//!   ignored, so a late callback can never resurrect a replaced connection;
//! - on an unplanned loss the supervisor schedules exactly one reconnect
//!   timer (a new request replaces the pending one) unless the user
//!   disconnected or auto-reconnect is off;
//! - `disconnect` cancels the timer and the session under the same lock.
//!
//! All state lives behind one `std::sync::Mutex` that is never held across an
//! `.await`. Methods that spawn tasks must be called inside a tokio runtime.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tether_core::handshake::Outcome;
use tether_core::{
    ClientGuard, ConnectionState, EndpointConfig, Framer, FramerError, HeartbeatPolicy,
};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, Link};
use crate::event::LinkEvent;
use crate::gather::Gather;

const EVENT_CAPACITY: usize = 1024;

/// Writes queued for one session before `send_bytes` starts refusing.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Supervised connection over a [`Channel`].
///
/// Cloning is cheap and every clone drives the same connection.
pub struct Supervisor<C: Channel> {
    shared: Arc<Shared<C>>,
}

impl<C: Channel> Clone for Supervisor<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<C> {
    key: String,
    channel: C,
    events: broadcast::Sender<LinkEvent>,
    machine: Mutex<Machine>,
}

struct Machine {
    config: Arc<EndpointConfig>,
    state: ConnectionState,
    /// Bumped whenever a session starts or the user disconnects.
    epoch: u64,
    user_disconnect: bool,
    retry: Option<JoinHandle<()>>,
    session: Option<Session>,
    connection_count: u64,
}

struct Session {
    outbound: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl<C: Channel> Supervisor<C> {
    /// Create an idle supervisor. `key` names the device in diagnostics.
    pub fn new(key: impl Into<String>, config: EndpointConfig, channel: C) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                key: key.into(),
                channel,
                events,
                machine: Mutex::new(Machine {
                    config: Arc::new(config),
                    state: ConnectionState::Idle,
                    epoch: 0,
                    user_disconnect: false,
                    retry: None,
                    session: None,
                    connection_count: 0,
                }),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.machine().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Successful connections (handshake included) since construction.
    pub fn connection_count(&self) -> u64 {
        self.shared.machine().connection_count
    }

    /// Whether a reconnect timer is armed.
    pub fn has_pending_reconnect(&self) -> bool {
        self.shared
            .machine()
            .retry
            .as_ref()
            .is_some_and(|retry| !retry.is_finished())
    }

    pub fn config(&self) -> EndpointConfig {
        EndpointConfig::clone(&self.shared.machine().config)
    }

    /// Replace the configuration. Refused while connected or connecting.
    pub fn set_config(&self, config: EndpointConfig) -> bool {
        let mut machine = self.shared.machine();
        if matches!(
            machine.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            warn!(device = %self.shared.key, "configuration can only change while disconnected");
            return false;
        }
        machine.config = Arc::new(config);
        true
    }

    /// Subscribe to state changes and received bytes.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Attach a framer built from this link's delimiter settings.
    pub fn gather(&self) -> Result<Gather, FramerError> {
        let config = self.config();
        let framer = Framer::new(&config.delimiter, config.include_delimiter)?
            .with_max_len(config.max_frame_len);
        Ok(Gather::attach(self.key(), self.subscribe(), framer))
    }

    /// Start connecting.
    ///
    /// Does nothing while connected or connecting. An incomplete configuration
    /// is logged and leaves the state untouched.
    pub fn connect(&self) {
        let shared = &self.shared;
        let mut machine = shared.machine();
        if matches!(
            machine.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            debug!(device = %shared.key, state = %machine.state, "connect ignored");
            return;
        }
        if let Err(e) = machine.config.validate() {
            warn!(device = %shared.key, error = %e, "cannot connect, configuration incomplete");
            return;
        }
        machine.user_disconnect = false;
        shared.start_session(&mut machine);
    }

    /// Close the link and stay closed.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let mut machine = shared.machine();
        machine.user_disconnect = true;
        if let Some(retry) = machine.retry.take() {
            retry.abort();
            debug!(device = %shared.key, "pending reconnect cancelled");
        }
        machine.epoch += 1;
        if let Some(session) = machine.session.take() {
            shared.transition(&mut machine, ConnectionState::Disconnecting);
            session.task.abort();
        }
        shared.transition(&mut machine, ConnectionState::DisconnectedByUser);
    }

    /// Queue text for sending. Returns `false` if not connected.
    pub fn send_text(&self, text: &str) -> bool {
        self.send_bytes(text.as_bytes())
    }

    /// Queue bytes for sending. Returns `false` if not connected or if the
    /// link has fallen [`OUTBOUND_CAPACITY`] writes behind.
    pub fn send_bytes(&self, data: &[u8]) -> bool {
        let machine = self.shared.machine();
        match (&machine.session, machine.state) {
            (Some(session), ConnectionState::Connected) => {
                match session.outbound.try_send(data.to_vec()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(device = %self.shared.key, len = data.len(), "send queue full, dropped");
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            }
            _ => {
                debug!(device = %self.shared.key, state = %machine.state, "not connected, send dropped");
                false
            }
        }
    }

    /// Report a transport status for the current connection attempt, exactly
    /// as the session task does when its channel changes state.
    pub fn report_status(&self, status: ConnectionState) {
        let epoch = self.shared.machine().epoch;
        self.shared.on_status(epoch, status);
    }
}

impl<C: Channel> Shared<C> {
    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, machine: &mut Machine, next: ConnectionState) {
        let previous = machine.state;
        if previous == next {
            return;
        }
        machine.state = next;
        info!(device = %self.key, %previous, current = %next, "connection state changed");
        let _ = self.events.send(LinkEvent::ConnectionChanged {
            previous,
            current: next,
        });
    }

    fn start_session(self: &Arc<Self>, machine: &mut Machine) {
        if let Some(retry) = machine.retry.take() {
            retry.abort();
        }
        if let Some(old) = machine.session.take() {
            old.task.abort();
        }
        machine.epoch += 1;
        let epoch = machine.epoch;
        self.transition(machine, ConnectionState::Connecting);

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let task = tokio::spawn(run_session(
            Arc::clone(self),
            epoch,
            Arc::clone(&machine.config),
            outbound_rx,
        ));
        machine.session = Some(Session { outbound, task });
    }

    fn on_status(self: &Arc<Self>, epoch: u64, status: ConnectionState) {
        let mut machine = self.machine();
        if epoch != machine.epoch {
            debug!(device = %self.key, %status, "ignoring status from a superseded connection");
            return;
        }

        if status.is_failure() {
            if machine.user_disconnect {
                debug!(device = %self.key, %status, "user disconnected, not reconnecting");
                return;
            }
            if let Some(session) = machine.session.take() {
                session.task.abort();
            }
            self.transition(&mut machine, status);
            if machine.config.auto_reconnect {
                self.schedule_retry(&mut machine);
            }
            return;
        }

        if status == ConnectionState::Connected {
            machine.connection_count += 1;
        }
        self.transition(&mut machine, status);
    }

    /// Arm the reconnect timer, replacing one that is already pending.
    fn schedule_retry(self: &Arc<Self>, machine: &mut Machine) {
        if let Some(pending) = machine.retry.take() {
            pending.abort();
            debug!(device = %self.key, "pending reconnect reset");
        }
        let interval = machine.config.reconnect_interval();
        let epoch = machine.epoch;
        let shared = Arc::clone(self);
        info!(
            device = %self.key,
            interval_ms = machine.config.auto_reconnect_interval_ms,
            "reconnect scheduled"
        );
        machine.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            shared.retry_due(epoch);
        }));
    }

    fn retry_due(self: &Arc<Self>, epoch: u64) {
        let mut machine = self.machine();
        if epoch != machine.epoch || machine.user_disconnect {
            return;
        }
        machine.retry = None;
        if let Err(e) = machine.config.validate() {
            warn!(device = %self.key, error = %e, "reconnect abandoned, configuration incomplete");
            return;
        }
        info!(device = %self.key, "reconnecting");
        self.start_session(&mut machine);
    }

    fn publish(&self, epoch: u64, bytes: Vec<u8>) {
        let machine = self.machine();
        if machine.epoch == epoch {
            let _ = self.events.send(LinkEvent::Received(bytes));
        }
    }
}

async fn run_session<C: Channel>(
    shared: Arc<Shared<C>>,
    epoch: u64,
    config: Arc<EndpointConfig>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
) {
    let device = shared.key.as_str();
    debug!(
        device,
        transport = shared.channel.kind(),
        host = %config.host,
        port = config.port,
        "opening channel"
    );

    let link = match tokio::time::timeout(config.connect_timeout(), shared.channel.open(&config)).await
    {
        Ok(Ok(link)) => link,
        Ok(Err(e)) => {
            warn!(device, host = %config.host, port = config.port, error = %e, "connect failed");
            shared.on_status(epoch, ConnectionState::ConnectFailed);
            return;
        }
        Err(_) => {
            warn!(
                device,
                host = %config.host,
                port = config.port,
                timeout_ms = config.connect_timeout_ms,
                "connect timed out"
            );
            shared.on_status(epoch, ConnectionState::ConnectFailed);
            return;
        }
    };

    let status = pump(&shared, epoch, &config, link, &mut outbound).await;
    shared.on_status(epoch, status);
}

/// Move bytes until the link fails; returns the state to report.
async fn pump<C: Channel>(
    shared: &Arc<Shared<C>>,
    epoch: u64,
    config: &EndpointConfig,
    mut link: Link,
    outbound: &mut mpsc::Receiver<Vec<u8>>,
) -> ConnectionState {
    let device = shared.key.as_str();
    let heartbeat = HeartbeatPolicy::from_config(&config.heartbeat);
    let terminator = config.delimiter.terminator();
    let mut handshake = config.handshake_key().map(ClientGuard::new);
    let mut handshake_deadline = None;
    let mut beat = None;

    if handshake.is_none() {
        shared.on_status(epoch, ConnectionState::Connected);
        beat = heartbeat_timer(heartbeat.as_ref());
    } else {
        debug!(device, remote = %link.remote, "awaiting shared key");
        handshake_deadline = Some(Instant::now() + config.connect_timeout());
    }

    let mut buf = vec![0u8; config.buffer_size];
    loop {
        tokio::select! {
            read = link.reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        info!(device, remote = %link.remote, "remote end closed the connection");
                        return ConnectionState::DisconnectedRemotely;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!(device, remote = %link.remote, error = %e, "read failed");
                        return ConnectionState::LinkDown;
                    }
                };
                let data = &buf[..n];
                config.stream_debug.trace_rx(device, &link.remote, data);

                let released = match handshake.as_mut() {
                    None => Some((data.to_vec(), false)),
                    Some(guard) => {
                        let step = match guard.feed(data) {
                            Ok(step) => step,
                            Err(e) => {
                                error!(
                                    device,
                                    remote = %link.remote,
                                    error = %e,
                                    "shared key handshake failed, disconnecting"
                                );
                                return ConnectionState::DisconnectedRemotely;
                            }
                        };
                        if let Some(reply) = step.reply {
                            config.stream_debug.trace_tx(device, &link.remote, &reply);
                            if let Err(e) = write(&mut link.writer, &reply).await {
                                warn!(device, remote = %link.remote, error = %e, "write failed");
                                return ConnectionState::LinkDown;
                            }
                        }
                        match step.outcome {
                            Outcome::Pending => None,
                            Outcome::Verified(rest) => Some((rest, true)),
                        }
                    }
                };

                let Some((bytes, verified_now)) = released else {
                    continue;
                };
                if verified_now {
                    handshake = None;
                    handshake_deadline = None;
                    info!(device, remote = %link.remote, "shared key verified");
                    shared.on_status(epoch, ConnectionState::Connected);
                    beat = heartbeat_timer(heartbeat.as_ref());
                }
                if !bytes.is_empty() {
                    shared.publish(epoch, bytes);
                }
            }
            Some(data) = outbound.recv() => {
                config.stream_debug.trace_tx(device, &link.remote, &data);
                if let Err(e) = write(&mut link.writer, &data).await {
                    warn!(device, remote = %link.remote, error = %e, "write failed");
                    return ConnectionState::LinkDown;
                }
            }
            _ = until(handshake_deadline) => {
                warn!(
                    device,
                    remote = %link.remote,
                    timeout_ms = config.connect_timeout_ms,
                    "shared key handshake timed out"
                );
                return ConnectionState::ConnectFailed;
            }
            _ = next_beat(&mut beat) => {
                if let Some(line) = heartbeat.as_ref().and_then(|p| p.beat(&terminator)) {
                    config.stream_debug.trace_tx(device, &link.remote, &line);
                    if let Err(e) = write(&mut link.writer, &line).await {
                        warn!(device, remote = %link.remote, error = %e, "heartbeat write failed");
                        return ConnectionState::LinkDown;
                    }
                }
            }
        }
    }
}

async fn write(writer: &mut (impl AsyncWrite + Unpin), data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

/// Client heartbeats only make sense with a token to send.
fn heartbeat_timer(policy: Option<&HeartbeatPolicy>) -> Option<Interval> {
    let policy = policy.filter(|p| p.token().is_some())?;
    let period = policy.send_interval();
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_beat(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
