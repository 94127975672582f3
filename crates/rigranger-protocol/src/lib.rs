//! rigctld protocol client for rigranger.
//!
//! This crate speaks the line-oriented TCP protocol of Hamlib's `rigctld`
//! daemon. One tokio task owns the read half of the socket for the lifetime
//! of a connection; commands are serialized so exactly one is in flight and
//! responses are matched strictly in issue order.
//!
//! # Architecture
//!
//! - [`protocol`] -- command encoding, `RPRT` status lines, value parsers
//! - [`client`] -- [`ProtocolClient`]: connect, receive loop, execute

pub mod client;
pub mod protocol;

pub use client::{ClientOptions, LinkLost, LinkState, ProtocolClient};
pub use protocol::CommandResponse;
