//! rigranger-core: Core types, events and error definitions for rigranger.
//!
//! This crate defines the pieces every other rigranger crate shares: the
//! error taxonomy, the session event model and its fan-out bus, and the
//! connection state machine. The HTTP/WebSocket layer depends on these
//! types without pulling in the protocol client or process supervisor.
//!
//! # Key types
//!
//! - [`EventBus`] / [`SessionEvent`] -- status, data and debug notifications
//! - [`ConnectionState`] / [`StateMachine`] -- validated connection lifecycle
//! - [`Error`] / [`Result`] -- error handling

pub mod bus;
pub mod error;
pub mod events;
pub mod state;
pub mod types;

// Re-export key types at crate root for ergonomic `use rigranger_core::*`.
pub use bus::{EventBus, Observer};
pub use error::{Error, Result};
pub use events::{EventKind, LinkStatus, SessionEvent, StatusEvent};
pub use state::{ConnectionState, StateMachine};
pub use types::*;
