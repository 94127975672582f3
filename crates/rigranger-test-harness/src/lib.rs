//! rigranger-test-harness: a simulated `rigctld` for testing rigranger.
//!
//! [`MockRigctld`] is a localhost TCP server that answers the control
//! protocol through a handler, a fixed script, or a stateful
//! [`SimulatedRig`]. It can push unsolicited lines, drop its clients and
//! stop listening, which is what the reconnection tests need.

pub mod mock_rigctld;
pub mod simulator;

pub use mock_rigctld::{MockReply, MockRigctld};
pub use simulator::SimulatedRig;
