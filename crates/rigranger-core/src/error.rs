//! Error types for rigranger.
//!
//! All fallible operations across the session manager return [`Result<T>`],
//! which uses [`Error`] as the error type. Process supervision, transport,
//! protocol and state machine errors are all captured here.

use crate::state::ConnectionState;

/// The error type for all rigranger operations.
///
/// Variants cover the failure modes of driving a radio through the
/// `rigctld` control daemon: the daemon binary cannot be found or does not
/// stay up, the control socket is missing or drops, or the daemon answers a
/// command with a failure code or not at all.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The daemon binary could not be resolved by the configured locator.
    ///
    /// This is fatal until the binary is installed or its path is
    /// configured manually.
    #[error("rigctld binary not found: {0}")]
    BinaryNotFound(String),

    /// The daemon process exited during its startup grace period.
    #[error("rigctld failed to start ({status}): {stderr}")]
    StartFailure {
        /// Exit status reported by the operating system.
        status: String,
        /// Everything the daemon wrote to standard error before exiting.
        stderr: String,
    },

    /// An operation was attempted with no live connection to the daemon.
    #[error("not connected")]
    NotConnected,

    /// No terminal status line arrived within the command deadline.
    #[error("timed out waiting for RPRT status line")]
    ProtocolTimeout,

    /// The daemon answered with a nonzero `RPRT` code.
    #[error("command failed with RPRT {code}: {response}")]
    CommandFailure {
        /// The (negative) Hamlib error code.
        code: i32,
        /// The raw response text, status line included.
        response: String,
    },

    /// The control socket was closed or errored mid-session.
    #[error("connection lost")]
    ConnectionLost,

    /// Establishing the TCP connection failed (refused, unreachable, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// A response could not be parsed into the expected value.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A connection state change was requested along an undefined edge.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// The configuration could not be read or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
