//! rigranger: network control of a radio through a supervised `rigctld`.
//!
//! A [`RadioSession`] launches Hamlib's `rigctld` daemon, connects to its
//! TCP control port, serializes commands onto the connection, and
//! reconnects with a bounded plan when the connection drops. Every state
//! change is published on an [`EventBus`] for the HTTP/WebSocket layer.
//!
//! # Quick start
//!
//! ```no_run
//! use rigranger::{EventKind, SessionBuilder, SessionEvent};
//!
//! # async fn example() -> rigranger::Result<()> {
//! let session = SessionBuilder::new()
//!     .model(3073)
//!     .device("/dev/ttyUSB0")
//!     .build()?;
//!
//! session.events().on(EventKind::Status, |event: &SessionEvent| {
//!     println!("{event:?}");
//! });
//!
//! session.start().await?;
//! session.set_frequency(14_250_000.0).await?;
//! println!("{} Hz", session.get_frequency().await?);
//! session.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Crate organization
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `rigranger-core` | Errors, events, [`EventBus`], connection state machine |
//! | `rigranger-protocol` | Wire codec and [`ProtocolClient`] |
//! | `rigranger-process` | Binary locators and [`ProcessSupervisor`] |
//! | `rigranger` (this crate) | Configuration, builder, reconnection, [`RadioSession`] |

pub mod builder;
pub mod config;
pub mod reconnect;
pub mod session;

pub use builder::SessionBuilder;
pub use config::SessionConfig;
pub use reconnect::ReconnectionController;
pub use session::RadioSession;

pub use rigranger_core::*;
pub use rigranger_process::{
    DaemonArgs, DaemonLocator, FixedPathLocator, ProcessSupervisor, SearchLocator,
};
pub use rigranger_protocol::{ClientOptions, CommandResponse, ProtocolClient};
