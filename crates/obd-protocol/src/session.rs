//! OBD Session and Connection
//!
//! A [`Session`] owns everything one adapter link needs: configuration, the
//! PID registry, the host's connector, and the live [`Connection`]. The first
//! call to [`Session::connection`] opens the transport, spawns the connection
//! task and replays the adapter handshake.
//!
//! The connection task is the single timeline for the link. It owns the
//! transport, the [`CommandGate`] and the [`FrameParser`]; commands reach it
//! over an mpsc channel and parser output leaves over a broadcast channel.

use crate::config::SessionConfig;
use crate::connector::{Connector, Transport};
use crate::error::ObdError;
use crate::gate::CommandGate;
use crate::parser::{decode_frame, FrameParser};
use crate::registry::PidRegistry;
use crate::signal::Signal;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Read buffer size for transport chunks
const READ_CHUNK: usize = 256;

/// Events published by the connection task
#[derive(Debug, Clone, PartialEq)]
pub enum ObdEvent {
    /// A command was written to the adapter; carries the unframed command
    Sent(String),
    /// A complete response arrived; published before its lines are decoded
    LineBreak,
    /// A decoded (or raw) response line
    Signal(Signal),
    /// A line failed to decode, the gate timed out, or the link failed
    Error(ObdError),
}

/// Handle to a live adapter link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<String>,
    events: broadcast::Sender<ObdEvent>,
}

impl Connection {
    /// Send a command through the gate. It is framed and written as soon as
    /// no other command is awaiting a response.
    pub fn write(&self, msg: impl Into<String>) -> Result<(), ObdError> {
        self.cmd_tx
            .send(msg.into())
            .map_err(|_| ObdError::ConnectionClosed)
    }

    /// Receive every event from the connection task
    pub fn subscribe(&self) -> broadcast::Receiver<ObdEvent> {
        self.events.subscribe()
    }

    /// Wait for the first signal that satisfies `predicate`.
    ///
    /// The subscription starts now, so create the watch before writing the
    /// request it should catch.
    pub fn watch<F>(&self, predicate: F) -> SignalWatch<F>
    where
        F: Fn(&Signal) -> bool,
    {
        SignalWatch {
            rx: self.subscribe(),
            predicate,
        }
    }

    /// Whether the connection task has stopped
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// One-shot, filtered subscription to parser signals.
///
/// Consumed by [`recv`](Self::recv); the subscription ends when it resolves,
/// fails, or is dropped.
pub struct SignalWatch<F> {
    rx: broadcast::Receiver<ObdEvent>,
    predicate: F,
}

impl<F> SignalWatch<F>
where
    F: Fn(&Signal) -> bool,
{
    /// Resolve with the first matching signal, or fail if the link goes down
    pub async fn recv(mut self) -> Result<Signal, ObdError> {
        loop {
            match self.rx.recv().await {
                Ok(ObdEvent::Signal(signal)) if (self.predicate)(&signal) => return Ok(signal),
                Ok(ObdEvent::Error(e)) if e.is_transport() => return Err(e),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Signal watch lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => return Err(ObdError::ConnectionClosed),
            }
        }
    }

    /// Wait for `command` to reach the wire, then give the matching signal
    /// `timeout` to arrive.
    ///
    /// Time spent queued behind other commands does not count against
    /// `timeout`. Signals seen before the command was sent are ignored.
    pub async fn recv_after_send(mut self, command: &str, timeout: Duration) -> Result<Signal, ObdError> {
        loop {
            match self.rx.recv().await {
                Ok(ObdEvent::Sent(sent)) if sent == command => break,
                Ok(ObdEvent::Error(e)) if e.is_transport() => return Err(e),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    // The send may be among the skipped events
                    warn!("Signal watch lagged, {} events skipped; assuming {} was sent", skipped, command);
                    break;
                }
                Err(RecvError::Closed) => return Err(ObdError::ConnectionClosed),
            }
        }
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| ObdError::Timeout(millis(timeout)))?
    }
}

struct ActiveConnection {
    connection: Connection,
    task: JoinHandle<()>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct SessionInner {
    config: SessionConfig,
    registry: Arc<PidRegistry>,
    connector: Mutex<Option<Arc<dyn Connector>>>,
    active: tokio::sync::Mutex<Option<ActiveConnection>>,
}

/// Everything one adapter link needs. Cheap to clone; clones share the link.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session decoding with the standard PID catalogue
    pub fn new(config: SessionConfig) -> Self {
        Self::with_registry(config, PidRegistry::standard())
    }

    pub fn with_registry(config: SessionConfig, registry: PidRegistry) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                registry: Arc::new(registry),
                connector: Mutex::new(None),
                active: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Install the connector used to open the link
    pub fn set_connector(&self, connector: impl Connector + 'static) {
        info!("Setting connection function");
        *self.inner.connector.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::new(connector));
    }

    /// Install a connector and connect right away, so connection errors
    /// surface now rather than on the first poll. Any previous link is closed.
    pub async fn init(&self, connector: impl Connector + 'static) -> Result<Connection, ObdError> {
        info!("Initialising OBD session");
        self.close().await;
        self.set_connector(connector);
        let connection = self.connection().await?;
        info!("Initialised successfully");
        Ok(connection)
    }

    /// The live connection, opened and configured on first use.
    ///
    /// Fails with [`ObdError::NotConfigured`] if no connector was installed.
    pub async fn connection(&self) -> Result<Connection, ObdError> {
        let connector = self
            .inner
            .connector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ObdError::NotConfigured)?;

        let mut active = self.inner.active.lock().await;
        if let Some(active) = active.as_ref() {
            return Ok(active.connection.clone());
        }

        debug!("Getting connection");
        let transport = connector.connect().await?;
        let (connection, task) = self.configure(transport)?;
        *active = Some(ActiveConnection {
            connection: connection.clone(),
            task,
        });
        Ok(connection)
    }

    /// Stop the connection task and drop the link. The next call to
    /// [`connection`](Self::connection) connects again.
    pub async fn close(&self) {
        if let Some(active) = self.inner.active.lock().await.take() {
            info!("Closing OBD connection");
            let _ = active
                .connection
                .events
                .send(ObdEvent::Error(ObdError::ConnectionClosed));
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &PidRegistry {
        &self.inner.registry
    }

    /// Wrap a raw transport with the gate and parser, then queue the handshake
    fn configure(&self, transport: Box<dyn Transport>) -> Result<(Connection, JoinHandle<()>), ObdError> {
        info!("Configuring OBD connection");
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(self.inner.config.event_capacity.max(1));

        let task = tokio::spawn(run_connection(
            transport,
            self.inner.registry.clone(),
            self.inner.config.command_timeout(),
            cmd_rx,
            events.clone(),
        ));
        let connection = Connection { cmd_tx, events };

        for cmd in self.inner.config.handshake() {
            connection.write(cmd)?;
        }
        Ok((connection, task))
    }
}

/// Write what the gate released. Returns whether anything was written.
async fn send(
    writer: &mut WriteHalf<Box<dyn Transport>>,
    bytes: Option<Vec<u8>>,
) -> Result<bool, ObdError> {
    let Some(bytes) = bytes else {
        return Ok(false);
    };
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(true)
}

/// Publish the command now on the wire
fn announce(gate: &CommandGate, events: &broadcast::Sender<ObdEvent>) {
    if let Some(command) = gate.current() {
        let _ = events.send(ObdEvent::Sent(command.to_string()));
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Wait until `deadline`, or forever if there is none
async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The connection task: the only place that touches the transport
async fn run_connection(
    transport: Box<dyn Transport>,
    registry: Arc<PidRegistry>,
    command_timeout: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<String>,
    events: broadcast::Sender<ObdEvent>,
) {
    let (mut reader, mut writer) = tokio::io::split(transport);
    let mut gate = CommandGate::new();
    let mut parser = FrameParser::new();
    let mut buf = [0u8; READ_CHUNK];

    let result: Result<(), ObdError> = loop {
        let deadline = gate.locked_since().map(|t| t + command_timeout);
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(msg) => {
                    match send(&mut writer, gate.write(msg)).await {
                        Ok(true) => announce(&gate, &events),
                        Ok(false) => {}
                        Err(e) => break Err(e),
                    }
                }
                None => break Ok(()),
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Err(ObdError::ConnectionClosed),
                Ok(n) => {
                    let Some(frame) = parser.push(&buf[..n]) else {
                        continue;
                    };
                    // Unlock before decoding so the next command is not held up
                    let _ = events.send(ObdEvent::LineBreak);
                    let sent = match send(&mut writer, gate.on_line_break()).await {
                        Ok(sent) => sent,
                        Err(e) => break Err(e),
                    };
                    for result in decode_frame(&frame, &registry) {
                        let event = match result {
                            Ok(signal) => ObdEvent::Signal(signal),
                            Err(e) => {
                                warn!("{}", e);
                                ObdEvent::Error(e)
                            }
                        };
                        let _ = events.send(event);
                    }
                    // After the frame, so its lines are never taken as replies
                    // to the command just released
                    if sent {
                        announce(&gate, &events);
                    }
                }
                Err(e) => break Err(e.into()),
            },
            _ = sleep_until(deadline) => {
                let ms = millis(command_timeout);
                if gate.is_draining() {
                    warn!("Prompt still missing after another {}ms, discarding {:?}", ms, parser.pending());
                    parser.clear();
                } else {
                    let _ = events.send(ObdEvent::Error(ObdError::Timeout(ms)));
                }
                match send(&mut writer, gate.on_timeout()).await {
                    Ok(true) => announce(&gate, &events),
                    Ok(false) => {}
                    Err(e) => break Err(e),
                }
            }
        }
    };

    match result {
        Ok(()) => debug!("Connection task finished"),
        Err(e) => {
            error!("OBD connection failed: {}", e);
            let _ = events.send(ObdEvent::Error(e));
        }
    }
}
