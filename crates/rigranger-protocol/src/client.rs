//! TCP client for the `rigctld` control port.
//!
//! [`ProtocolClient`] owns one connection at a time. The read half of the
//! socket is driven by a spawned receive loop that splits the stream into
//! lines. While a command is outstanding, lines accumulate into its response
//! until a terminal `RPRT` status line arrives; lines that arrive with no
//! command outstanding are published as data events.
//!
//! Commands are serialized through an async mutex whose waiters are served
//! in FIFO order, so at most one command is ever in flight and concurrent
//! callers never see each other's responses.
//!
//! When the socket closes or errors without [`ProtocolClient::close`] having
//! been called, the client moves to [`LinkState::Disconnected`], emits a
//! `disconnected` status event and sends a [`LinkLost`] notification to
//! every receiver obtained from [`ProtocolClient::subscribe_link_lost`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rigranger_core::bus::EventBus;
use rigranger_core::error::{Error, Result};
use rigranger_core::events::LinkStatus;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::{self, CommandResponse, MAX_LINE};

/// Default time allowed for a response's status line to arrive.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunable timeouts for a [`ProtocolClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Deadline for writing a command and receiving its terminal status
    /// line.
    pub command_timeout: Duration,
    /// Deadline for establishing the TCP connection.
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Whether the client currently holds a live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

/// Sent when a connection ends without a call to `close()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLost {
    /// Connection generation that was lost; increments on every `connect`.
    pub generation: u64,
    /// Human-readable cause (EOF or the socket error).
    pub reason: String,
}

struct PendingCommand {
    lines: Vec<String>,
    reply: oneshot::Sender<CommandResponse>,
}

struct Link {
    state: LinkState,
    generation: u64,
    peer: Option<String>,
    writer: Option<Arc<tokio::sync::Mutex<OwnedWriteHalf>>>,
    cancel: Option<CancellationToken>,
    reader: Option<JoinHandle<()>>,
}

struct Shared {
    events: EventBus,
    options: ClientOptions,
    /// Serializes `execute`; tokio's mutex queues waiters fairly.
    exec_lock: tokio::sync::Mutex<()>,
    link: Mutex<Link>,
    pending: Mutex<Option<PendingCommand>>,
    lost_tx: broadcast::Sender<LinkLost>,
}

/// Line-protocol client for one `rigctld` control socket.
pub struct ProtocolClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let link = lock(&self.shared.link);
        f.debug_struct("ProtocolClient")
            .field("state", &link.state)
            .field("peer", &link.peer)
            .field("generation", &link.generation)
            .finish()
    }
}

impl ProtocolClient {
    /// Create a disconnected client that publishes to `events`.
    pub fn new(events: EventBus) -> Self {
        Self::with_options(events, ClientOptions::default())
    }

    /// Create a disconnected client with explicit timeouts.
    pub fn with_options(events: EventBus, options: ClientOptions) -> Self {
        let (lost_tx, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                events,
                options,
                exec_lock: tokio::sync::Mutex::new(()),
                link: Mutex::new(Link {
                    state: LinkState::Disconnected,
                    generation: 0,
                    peer: None,
                    writer: None,
                    cancel: None,
                    reader: None,
                }),
                pending: Mutex::new(None),
                lost_tx,
            }),
        }
    }

    pub fn options(&self) -> ClientOptions {
        self.shared.options
    }

    /// Connect using the configured connect timeout.
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.connect_with_timeout(host, port, self.shared.options.connect_timeout)
            .await
    }

    /// Open a connection to `host:port`, replacing any existing one.
    ///
    /// The previous socket, if any, is closed first without a loss
    /// notification.
    pub async fn connect_with_timeout(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        self.close().await;

        let addr = format!("{host}:{port}");
        let stream = open_stream(&addr, timeout).await?;
        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();

        let mut link = lock(&self.shared.link);
        link.generation += 1;
        let generation = link.generation;
        link.state = LinkState::Connected;
        link.peer = Some(addr.clone());
        link.writer = Some(Arc::new(tokio::sync::Mutex::new(write_half)));
        link.cancel = Some(cancel.clone());
        link.reader = Some(tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            read_half,
            generation,
            cancel,
        )));
        drop(link);

        tracing::info!(addr = %addr, generation, "connected to rigctld");
        Ok(())
    }

    /// Whether the client holds a live socket.
    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    pub fn link_state(&self) -> LinkState {
        lock(&self.shared.link).state
    }

    /// Generation of the current or most recent connection; 0 before the
    /// first `connect`.
    pub fn generation(&self) -> u64 {
        lock(&self.shared.link).generation
    }

    /// The `host:port` of the current or most recent connection.
    pub fn peer(&self) -> Option<String> {
        lock(&self.shared.link).peer.clone()
    }

    /// Receive a [`LinkLost`] for every connection that drops unexpectedly.
    pub fn subscribe_link_lost(&self) -> broadcast::Receiver<LinkLost> {
        self.shared.lost_tx.subscribe()
    }

    /// Send one command and wait for its complete response.
    ///
    /// Fails with [`Error::Protocol`] for a command that spans more than one
    /// line and [`Error::NotConnected`] when there is no live socket, both
    /// before any I/O. Fails with [`Error::CommandFailure`] when the status
    /// code is nonzero.
    ///
    /// Writing the command and receiving its status line share one
    /// deadline. When it passes, the connection is dropped as lost and
    /// [`Error::ProtocolTimeout`] is returned: a reply that is still owed
    /// would otherwise be taken for the answer to the next command.
    pub async fn execute(&self, command: &str) -> Result<CommandResponse> {
        protocol::check_single_line(command)?;
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let _turn = self.shared.exec_lock.lock().await;

        // The link may have dropped while queued.
        let (writer, generation) = {
            let link = lock(&self.shared.link);
            match (&link.writer, link.state) {
                (Some(writer), LinkState::Connected) => (Arc::clone(writer), link.generation),
                _ => return Err(Error::NotConnected),
            }
        };

        let wire = protocol::encode_command(command);
        let command = wire.trim_end();
        let timeout = self.shared.options.command_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        *lock(&self.shared.pending) = Some(PendingCommand {
            lines: Vec::new(),
            reply: tx,
        });

        tracing::debug!(command, "sending command");

        match tokio::time::timeout_at(deadline, write_line(&writer, &wire)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                lock(&self.shared.pending).take();
                tracing::warn!(command, error = %e, "failed to write command");
                return Err(map_io_error(e));
            }
            Err(_) => {
                lock(&self.shared.pending).take();
                tracing::warn!(command, timeout_ms = timeout.as_millis(), "command write stalled");
                self.shared
                    .link_lost(generation, format!("write of {command} timed out"));
                return Err(Error::ProtocolTimeout);
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => {
                tracing::trace!(command, code = response.code, lines = response.lines.len(), "response complete");
                response.into_result()
            }
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                lock(&self.shared.pending).take();
                tracing::warn!(
                    command,
                    timeout_ms = timeout.as_millis(),
                    "no status line before deadline, dropping connection"
                );
                self.shared
                    .link_lost(generation, format!("no status line for {command}"));
                Err(Error::ProtocolTimeout)
            }
        }
    }

    /// Close the socket and stop the receive loop.
    ///
    /// Idempotent. An intentional close never produces a [`LinkLost`].
    pub async fn close(&self) {
        let (writer, cancel, reader, peer) = {
            let mut link = lock(&self.shared.link);
            if link.state == LinkState::Disconnected && link.writer.is_none() && link.reader.is_none() {
                return;
            }
            link.state = LinkState::Disconnected;
            (link.writer.take(), link.cancel.take(), link.reader.take(), link.peer.clone())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(writer) = writer {
            let mut writer = writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "socket shutdown failed (continuing anyway)");
            }
        }
        if let Some(reader) = reader {
            let _ = reader.await;
        }

        tracing::info!(addr = peer.as_deref().unwrap_or("-"), "connection closed");
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        let link = lock(&self.shared.link);
        if let Some(cancel) = &link.cancel {
            tracing::debug!("ProtocolClient dropped, stopping receive loop");
            cancel.cancel();
        }
    }
}

impl Shared {
    /// Route one received line to the pending command or to the bus.
    fn dispatch_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let completed = {
            let mut pending = lock(&self.pending);
            let Some(command) = pending.as_mut() else {
                drop(pending);
                self.events.data(line);
                return;
            };
            match protocol::split_status_line(line) {
                Some((data, code)) => {
                    if !data.is_empty() {
                        command.lines.push(data.to_string());
                    }
                    pending.take().map(|c| (c, code))
                }
                None => {
                    command.lines.push(line.to_string());
                    None
                }
            }
        };

        if let Some((command, code)) = completed {
            let _ = command.reply.send(CommandResponse {
                lines: command.lines,
                code,
            });
        }
    }

    /// Record an unexpected end of connection `generation` and stop its
    /// receive loop.
    ///
    /// Ignored when a newer connection has replaced it or it was closed on
    /// purpose. The pending command, if any, is left to run into its
    /// deadline.
    fn link_lost(&self, generation: u64, reason: String) {
        let lost = {
            let mut link = lock(&self.link);
            if link.generation == generation && link.state == LinkState::Connected {
                link.state = LinkState::Disconnected;
                if let Some(cancel) = link.cancel.take() {
                    cancel.cancel();
                }
                // Dropping the last handle to the write half shuts it down.
                link.writer = None;
                link.reader = None;
                true
            } else {
                false
            }
        };
        if !lost {
            return;
        }

        tracing::warn!(generation, reason = %reason, "connection to rigctld lost");
        self.events.status(LinkStatus::Disconnected, "Connection lost");
        let _ = self.lost_tx.send(LinkLost { generation, reason });
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    read_half: OwnedReadHalf,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(256);
    let mut discarding = false;

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(generation, "receive loop cancelled");
                return;
            }
            read = read_line(&mut reader, &mut buf) => read,
        };

        match read {
            Ok(0) => {
                shared.link_lost(generation, "connection closed by rigctld".into());
                return;
            }
            Ok(_) => {
                let terminated = buf.ends_with(b"\n");
                if discarding {
                    discarding = !terminated;
                    continue;
                }
                if !terminated && buf.len() >= MAX_LINE {
                    tracing::warn!(generation, limit = MAX_LINE, "line exceeds limit, discarding");
                    discarding = true;
                    continue;
                }
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                tracing::trace!(generation, line, "received line");
                shared.dispatch_line(line);
            }
            Err(e) => {
                shared.events.debug(format!("Socket error: {e}"));
                shared.link_lost(generation, e.to_string());
                return;
            }
        }
    }
}

/// Read up to and including the next newline, at most [`MAX_LINE`] bytes.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = reader.take(MAX_LINE as u64);
    limited.read_until(b'\n', buf).await
}

async fn write_line(
    writer: &tokio::sync::Mutex<OwnedWriteHalf>,
    line: &str,
) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn open_stream(addr: &str, timeout: Duration) -> Result<TcpStream> {
    tracing::debug!(addr = %addr, timeout_ms = timeout.as_millis(), "connecting to rigctld");

    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            tracing::warn!(addr = %addr, "TCP connection timed out");
            Error::Transport(format!("connection timed out: {addr}"))
        })?
        .map_err(|e| {
            tracing::warn!(addr = %addr, error = %e, "TCP connection failed");
            map_connect_error(e, addr)
        })?;

    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(addr = %addr, error = %e, "failed to set TCP_NODELAY (continuing anyway)");
    }

    Ok(stream)
}

fn map_connect_error(e: std::io::Error, addr: &str) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => Error::Transport(format!("connection refused: {addr}")),
        _ => Error::Transport(format!("{addr}: {e}")),
    }
}

fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
