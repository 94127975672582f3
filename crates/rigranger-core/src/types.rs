//! Value types shared between the session manager and its consumers.
//!
//! These are the shapes the HTTP/WebSocket layer serializes: status
//! snapshots, mode readings and the aggregated radio info.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::state::ConnectionState;

/// Default TCP control port of `rigctld`.
pub const DEFAULT_CONTROL_PORT: u16 = 4532;

/// Default control host; the daemon is launched on the loopback interface.
pub const DEFAULT_CONTROL_HOST: &str = "127.0.0.1";

/// Hamlib model number of the built-in dummy rig.
pub const DUMMY_MODEL: i32 = 1;

/// Operating mode and passband as reported by `\get_mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeInfo {
    /// Hamlib mode token, e.g. `USB`, `CW`, `PKTUSB`.
    pub mode: String,
    /// Passband in hertz; `0` means the rig's default for the mode.
    pub passband: i64,
}

impl fmt::Display for ModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.mode, self.passband)
    }
}

/// Aggregated radio information.
///
/// `frequency`, `mode` and `passband` are absent when the corresponding
/// query failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadioInfo {
    pub model: i32,
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passband: Option<i64>,
}

/// Point-in-time status of a radio session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub model: i32,
    pub device: Option<String>,
    pub host: String,
    pub port: u16,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub daemon_running: bool,
    pub binary_path: Option<PathBuf>,
}

/// Bounds for automatic reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPlan {
    /// Attempts made before giving up.
    pub max_attempts: u32,
    /// Fixed delay before each attempt.
    pub delay: Duration,
}

impl Default for ReconnectPlan {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}
