//! Mock `rigctld` control port for protocol-level testing.
//!
//! [`MockRigctld`] listens on a random localhost port and answers each
//! received command line through a handler closure, so tests can drive the
//! protocol client and session manager without Hamlib installed.
//!
//! # Example
//!
//! ```
//! use rigranger_test_harness::{MockReply, MockRigctld};
//!
//! # async fn example() -> rigranger_core::Result<()> {
//! let server = MockRigctld::start(|line: &str| match line {
//!     "\\get_freq" => MockReply::value(14_250_000),
//!     _ => MockReply::error(-4),
//! })
//! .await?;
//!
//! // Point a ProtocolClient at server.host():server.port()
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rigranger_core::error::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::simulator::SimulatedRig;

/// How the mock answers one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Write this text verbatim.
    Respond(String),
    /// Write this text after a pause.
    Delayed(Duration, String),
    /// Write nothing; the client will run into its deadline.
    Silent,
    /// Close the connection without answering.
    Hangup,
}

impl MockReply {
    /// `RPRT 0`.
    pub fn ok() -> Self {
        Self::Respond("RPRT 0\n".into())
    }

    /// One data line followed by `RPRT 0`.
    pub fn value(value: impl Display) -> Self {
        Self::Respond(format!("{value}\nRPRT 0\n"))
    }

    /// `RPRT <code>`.
    pub fn error(code: i32) -> Self {
        Self::Respond(format!("RPRT {code}\n"))
    }

    /// Arbitrary text, written as-is.
    pub fn raw(text: impl Into<String>) -> Self {
        Self::Respond(text.into())
    }
}

type Handler = Arc<dyn Fn(&str) -> MockReply + Send + Sync>;

/// Connected clients, kicked as a group by [`MockRigctld::disconnect_clients`].
struct Clients {
    kick: CancellationToken,
    pushers: Vec<mpsc::UnboundedSender<String>>,
}

/// A fake `rigctld` listening on `127.0.0.1`.
///
/// Accepts any number of connections. Every received line is recorded (see
/// [`received`](MockRigctld::received)) before the handler is consulted.
pub struct MockRigctld {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    clients: Arc<Mutex<Clients>>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl MockRigctld {
    /// Start listening, answering each line with `handler`.
    pub async fn start<F>(handler: F) -> Result<Self>
    where
        F: Fn(&str) -> MockReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock rigctld: {e}")))?;
        let addr = listener.local_addr()?;

        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let clients = Arc::new(Mutex::new(Clients {
            kick: CancellationToken::new(),
            pushers: Vec::new(),
        }));
        let shutdown = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::new(handler),
            Arc::clone(&received),
            Arc::clone(&connections),
            Arc::clone(&clients),
            shutdown.clone(),
        ));

        tracing::debug!(addr = %addr, "mock rigctld listening");

        Ok(Self {
            addr,
            received,
            connections,
            clients,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Answer an exact sequence of request/response pairs, in order.
    ///
    /// A request that does not match the next expectation is logged and
    /// the connection is closed.
    pub async fn scripted(script: Vec<(&str, &str)>) -> Result<Self> {
        let queue: VecDeque<(String, String)> = script
            .into_iter()
            .map(|(req, resp)| (req.to_string(), resp.to_string()))
            .collect();
        let queue = Mutex::new(queue);

        Self::start(move |line: &str| {
            let mut queue = lock(&queue);
            let expected = queue.front().map(|(request, _)| request.clone());
            match expected {
                Some(request) if request == line => {
                    let (_, response) = queue.pop_front().unwrap_or_default();
                    MockReply::Respond(response)
                }
                Some(request) => {
                    tracing::warn!(expected = %request, got = %line, "mock rigctld: request mismatch");
                    MockReply::Hangup
                }
                None => {
                    tracing::warn!(got = %line, "mock rigctld: unexpected request");
                    MockReply::Hangup
                }
            }
        })
        .await
    }

    /// Serve a stateful simulated radio.
    pub async fn simulator(rig: SimulatedRig) -> Result<Self> {
        let rig = Mutex::new(rig);
        Self::start(move |line: &str| lock(&rig).handle(line)).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> &str {
        "127.0.0.1"
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every line received so far, across all connections, in arrival order.
    pub fn received(&self) -> Vec<String> {
        lock(&self.received).clone()
    }

    /// Number of connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Send an unsolicited line to every connected client.
    pub fn push(&self, line: &str) {
        let mut clients = lock(&self.clients);
        clients
            .pushers
            .retain(|tx| tx.send(format!("{line}\n")).is_ok());
    }

    /// Drop every open connection. The listener keeps accepting.
    pub fn disconnect_clients(&self) {
        let mut clients = lock(&self.clients);
        clients.kick.cancel();
        clients.kick = CancellationToken::new();
        clients.pushers.clear();
    }

    /// Stop accepting and drop every open connection.
    ///
    /// After this returns, new connection attempts are refused.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.disconnect_clients();
        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for MockRigctld {
    fn drop(&mut self) {
        self.shutdown.cancel();
        lock(&self.clients).kick.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Handler,
    received: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    clients: Arc<Mutex<Clients>>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "mock rigctld: accept failed");
                continue;
            }
        };

        connections.fetch_add(1, Ordering::SeqCst);
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let kick = {
            let mut clients = lock(&clients);
            clients.pushers.push(push_tx);
            clients.kick.clone()
        };

        tracing::debug!(peer = %peer, "mock rigctld: client connected");
        tokio::spawn(serve(
            stream,
            Arc::clone(&handler),
            Arc::clone(&received),
            kick,
            push_rx,
        ));
    }
    tracing::debug!("mock rigctld: listener closed");
}

async fn serve(
    stream: TcpStream,
    handler: Handler,
    received: Arc<Mutex<Vec<String>>>,
    kick: CancellationToken,
    mut push_rx: mpsc::UnboundedReceiver<String>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            _ = kick.cancelled() => break,
            Some(pushed) = push_rx.recv() => {
                if write_half.write_all(pushed.as_bytes()).await.is_err() {
                    break;
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line.trim_end().to_string(),
                    Ok(None) | Err(_) => break,
                };
                lock(&received).push(line.clone());

                let text = match handler(&line) {
                    MockReply::Respond(text) => text,
                    MockReply::Delayed(delay, text) => {
                        tokio::time::sleep(delay).await;
                        text
                    }
                    MockReply::Silent => continue,
                    MockReply::Hangup => break,
                };
                if write_half.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn roundtrip(stream: &mut TcpStream, request: &str) -> String {
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn handler_answers_and_records() {
        let server = MockRigctld::start(|line: &str| {
            if line == "\\get_freq" {
                MockReply::value(7_074_000)
            } else {
                MockReply::error(-4)
            }
        })
        .await
        .unwrap();

        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        assert_eq!(roundtrip(&mut stream, "\\get_freq\n").await, "7074000\nRPRT 0\n");
        assert_eq!(roundtrip(&mut stream, "\\bogus\n").await, "RPRT -4\n");
        assert_eq!(server.received(), vec!["\\get_freq", "\\bogus"]);
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn scripted_mismatch_closes_connection() {
        let server = MockRigctld::scripted(vec![("\\get_freq", "14250000\nRPRT 0\n")])
            .await
            .unwrap();

        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream.write_all(b"\\get_mode\n").await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_connections() {
        let server = MockRigctld::start(|_: &str| MockReply::ok()).await.unwrap();
        let addr = server.addr();
        server.shutdown().await;

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_clients_closes_open_streams() {
        let server = MockRigctld::start(|_: &str| MockReply::ok()).await.unwrap();
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        assert_eq!(roundtrip(&mut stream, "\\get_ptt\n").await, "RPRT 0\n");

        server.disconnect_clients();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
