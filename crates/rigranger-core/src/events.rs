//! Session event types.
//!
//! Events are published through the [`EventBus`](crate::bus::EventBus) when
//! the session's connection state changes, when the daemon sends lines that
//! do not belong to any command, and for diagnostic output. The API layer
//! relays them to a realtime channel so clients can render live state
//! without polling.

use std::fmt;

use serde::Serialize;

/// The three event channels a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Connection lifecycle changes.
    Status,
    /// Unsolicited lines received from the daemon.
    Data,
    /// Diagnostic messages (socket errors, daemon stderr).
    Debug,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Status => "status",
            EventKind::Data => "data",
            EventKind::Debug => "debug",
        })
    }
}

/// Connection lifecycle status carried by a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    GiveUp,
    Error,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkStatus::Connecting => "connecting",
            LinkStatus::Connected => "connected",
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Reconnecting => "reconnecting",
            LinkStatus::GiveUp => "give-up",
            LinkStatus::Error => "error",
        })
    }
}

/// Payload of a status event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub status: LinkStatus,
    pub message: String,
    /// Reconnection attempt number (1-based), set on `reconnecting` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Configured attempt bound, set on `reconnecting` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl StatusEvent {
    pub fn new(status: LinkStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            attempt: None,
            max_attempts: None,
        }
    }

    pub fn reconnecting(attempt: u32, max_attempts: u32) -> Self {
        Self {
            status: LinkStatus::Reconnecting,
            message: format!("Reconnecting (attempt {attempt}/{max_attempts})"),
            attempt: Some(attempt),
            max_attempts: Some(max_attempts),
        }
    }
}

/// An event published by a radio session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum SessionEvent {
    /// A connection lifecycle change.
    Status(StatusEvent),
    /// A line from the daemon that did not belong to an in-flight command.
    Data(String),
    /// A diagnostic message.
    Debug(String),
}

impl SessionEvent {
    /// Shorthand for a status event without attempt counters.
    pub fn status(status: LinkStatus, message: impl Into<String>) -> Self {
        SessionEvent::Status(StatusEvent::new(status, message))
    }

    /// The channel this event is delivered on.
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Status(_) => EventKind::Status,
            SessionEvent::Data(_) => EventKind::Data,
            SessionEvent::Debug(_) => EventKind::Debug,
        }
    }

    /// The link status, if this is a status event.
    pub fn link_status(&self) -> Option<LinkStatus> {
        match self {
            SessionEvent::Status(s) => Some(s.status),
            _ => None,
        }
    }
}
