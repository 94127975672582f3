//! rigranger-process: supervision of the external `rigctld` daemon.
//!
//! - [`locator`] -- finding the binary ([`FixedPathLocator`], [`SearchLocator`])
//! - [`supervisor`] -- launching, probing and terminating it ([`ProcessSupervisor`])

pub mod locator;
pub mod supervisor;

pub use locator::{BINARY_NAME, DaemonLocator, FixedPathLocator, SearchLocator};
pub use supervisor::{DaemonArgs, ProcessSupervisor, SupervisorOptions};
