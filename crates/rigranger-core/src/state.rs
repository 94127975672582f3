//! Session connection state machine.
//!
//! A session is always in exactly one [`ConnectionState`]. Changes go
//! through [`StateMachine::transition`], which checks the edge against the
//! transition table and rejects anything else instead of overwriting the
//! current value.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::{Error, Result};

/// Connection state of a radio session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// No connection and no reconnection pending.
    Disconnected,
    /// An externally requested connect is in progress.
    Connecting,
    /// The control socket is up.
    Connected,
    /// The reconnection controller has an attempt pending or running.
    Reconnecting,
    /// Reconnection attempts were exhausted; waiting for an external connect.
    GaveUp,
}

impl ConnectionState {
    /// Whether `self -> to` is a defined edge.
    ///
    /// `Reconnecting -> Reconnecting` is the only self edge: each further
    /// attempt re-enters the state. `Disconnected -> GaveUp` is taken when
    /// the reconnect plan allows no attempts at all.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Disconnected, Reconnecting)
                | (Disconnected, GaveUp)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Reconnecting, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, GaveUp)
                | (Reconnecting, Disconnected)
                | (GaveUp, Connecting)
                | (GaveUp, Disconnected)
        )
    }

    /// The lowercase wire/display name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::GaveUp => "gave-up",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared holder of the current [`ConnectionState`].
///
/// Cheap to query from any task; every change is validated against
/// [`ConnectionState::can_transition_to`].
#[derive(Debug)]
pub struct StateMachine {
    current: Mutex<ConnectionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a state machine in [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        Self {
            current: Mutex::new(ConnectionState::Disconnected),
        }
    }

    /// The current state.
    pub fn current(&self) -> ConnectionState {
        *self.lock()
    }

    /// Move to `to`, returning the previous state.
    ///
    /// Fails with [`Error::InvalidTransition`] and leaves the state unchanged
    /// if the edge is not in the table.
    pub fn transition(&self, to: ConnectionState) -> Result<ConnectionState> {
        let mut current = self.lock();
        let from = *current;
        if !from.can_transition_to(to) {
            tracing::debug!(%from, %to, "rejected connection state transition");
            return Err(Error::InvalidTransition { from, to });
        }
        *current = to;
        tracing::debug!(%from, %to, "connection state changed");
        Ok(from)
    }

    /// Move to `to` only if the current state is `expected`.
    ///
    /// Returns `Ok(false)` without touching the state when the current
    /// state differs, which lets racing tasks detect that someone else
    /// already moved the session on.
    pub fn transition_from(
        &self,
        expected: ConnectionState,
        to: ConnectionState,
    ) -> Result<bool> {
        let mut current = self.lock();
        if *current != expected {
            return Ok(false);
        }
        if !expected.can_transition_to(to) {
            return Err(Error::InvalidTransition { from: expected, to });
        }
        *current = to;
        tracing::debug!(from = %expected, %to, "connection state changed");
        Ok(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        // The guarded value is a Copy enum; a poisoned lock still holds a
        // valid state.
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    const ALL: [ConnectionState; 5] = [Disconnected, Connecting, Connected, Reconnecting, GaveUp];

    #[test]
    fn initial_state_is_disconnected() {
        assert_eq!(StateMachine::new().current(), Disconnected);
    }

    #[test]
    fn defined_edges_are_accepted() {
        let sm = StateMachine::new();
        assert_eq!(sm.transition(Connecting).unwrap(), Disconnected);
        assert_eq!(sm.transition(Connected).unwrap(), Connecting);
        assert_eq!(sm.transition(Disconnected).unwrap(), Connected);
        assert_eq!(sm.transition(Reconnecting).unwrap(), Disconnected);
        assert_eq!(sm.transition(Reconnecting).unwrap(), Reconnecting);
        assert_eq!(sm.transition(GaveUp).unwrap(), Reconnecting);
        assert_eq!(sm.transition(Connecting).unwrap(), GaveUp);
    }

    #[test]
    fn empty_plan_gives_up_from_disconnected() {
        let sm = StateMachine::new();
        assert_eq!(sm.transition(GaveUp).unwrap(), Disconnected);
        assert_eq!(sm.current(), GaveUp);
    }

    #[test]
    fn undefined_edge_is_rejected_and_state_kept() {
        let sm = StateMachine::new();
        let err = sm.transition(Connected).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: Disconnected,
                to: Connected
            }
        ));
        assert_eq!(sm.current(), Disconnected);
    }

    #[test]
    fn gave_up_is_only_left_by_connect_or_stop() {
        for to in ALL {
            let allowed = GaveUp.can_transition_to(to);
            assert_eq!(allowed, matches!(to, Connecting | Disconnected), "GaveUp -> {to}");
        }
    }

    #[test]
    fn only_reconnecting_has_a_self_edge() {
        for s in ALL {
            assert_eq!(s.can_transition_to(s), s == Reconnecting, "{s} -> {s}");
        }
    }

    #[test]
    fn transition_from_skips_when_state_moved_on() {
        let sm = StateMachine::new();
        assert!(!sm.transition_from(Connected, Disconnected).unwrap());
        assert_eq!(sm.current(), Disconnected);

        sm.transition(Connecting).unwrap();
        assert!(sm.transition_from(Connecting, Connected).unwrap());
        assert_eq!(sm.current(), Connected);
    }

    #[test]
    fn display_names() {
        assert_eq!(GaveUp.to_string(), "gave-up");
        assert_eq!(Reconnecting.to_string(), "reconnecting");
    }
}
