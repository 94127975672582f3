//! SessionBuilder -- fluent builder for [`RadioSession`] instances.
//!
//! Starts from [`SessionConfig`] defaults (or a loaded configuration) and
//! lets callers override individual settings before wiring the event bus,
//! protocol client, process supervisor and reconnection controller together.
//!
//! # Example
//!
//! ```no_run
//! use rigranger::SessionBuilder;
//! use std::time::Duration;
//!
//! # async fn example() -> rigranger_core::Result<()> {
//! let session = SessionBuilder::new()
//!     .model(3073)
//!     .device("/dev/ttyUSB0")
//!     .retry_interval(Duration::from_secs(2))
//!     .build()?;
//! session.start().await?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rigranger_core::bus::EventBus;
use rigranger_core::error::Result;
use rigranger_process::{
    DaemonLocator, FixedPathLocator, ProcessSupervisor, SearchLocator, SupervisorOptions,
};
use rigranger_protocol::{ClientOptions, ProtocolClient};

use crate::config::SessionConfig;
use crate::session::RadioSession;

/// Fluent builder for [`RadioSession`].
pub struct SessionBuilder {
    config: SessionConfig,
    locator: Option<Arc<dyn DaemonLocator>>,
    launch_daemon: bool,
    supervisor: SupervisorOptions,
    events: Option<EventBus>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// A builder with default configuration (dummy rig on port 4532).
    pub fn new() -> Self {
        Self::from_config(SessionConfig::default())
    }

    /// Start from an existing configuration.
    pub fn from_config(config: SessionConfig) -> Self {
        Self {
            config,
            locator: None,
            launch_daemon: true,
            supervisor: SupervisorOptions::default(),
            events: None,
        }
    }

    /// Set the Hamlib rig model number.
    pub fn model(mut self, model: i32) -> Self {
        self.config.model = model;
        self
    }

    /// Set the radio device path (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn device(mut self, device: &str) -> Self {
        self.config.device = Some(device.to_string());
        self
    }

    /// Set the control host (default `127.0.0.1`).
    pub fn host(mut self, host: &str) -> Self {
        self.config.host = host.to_string();
        self
    }

    /// Set the control port (default 4532).
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Pass a serial speed to the daemon.
    pub fn baud(mut self, baud: u32) -> Self {
        self.config.baud = Some(baud);
        self
    }

    /// Use this daemon binary instead of searching for one.
    pub fn binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.binary_path = Some(path.into());
        self
    }

    /// Use a custom binary locator. Takes precedence over `binary_path`.
    pub fn locator(mut self, locator: impl DaemonLocator + 'static) -> Self {
        self.locator = Some(Arc::new(locator));
        self
    }

    /// Whether `start()` launches the daemon (default) or only connects to
    /// one that is already running.
    pub fn launch_daemon(mut self, launch: bool) -> Self {
        self.launch_daemon = launch;
        self
    }

    /// Set the number of reconnection attempts before giving up (default 5).
    pub fn reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect_attempts = attempts;
        self
    }

    /// Set the delay between reconnection attempts (default 2s).
    pub fn retry_interval(mut self, delay: Duration) -> Self {
        self.config.retry_interval = delay.as_secs_f64();
        self
    }

    /// Set the deadline for a command's status line (default 2s).
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout.as_secs_f64();
        self
    }

    /// Set the TCP connect timeout (default 5s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout.as_secs_f64();
        self
    }

    /// Set how long a freshly launched daemon must stay up (default 1s).
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.supervisor.grace_period = grace;
        self
    }

    /// Set how long the daemon gets to exit before it is killed (default 2s).
    pub fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.supervisor.terminate_timeout = timeout;
        self
    }

    /// Publish to an existing event bus instead of a new one.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the configuration and assemble the session.
    ///
    /// Nothing is launched or connected until [`RadioSession::start`] or
    /// [`RadioSession::connect`].
    pub fn build(self) -> Result<RadioSession> {
        self.config.validate()?;

        let plan = self.config.reconnect_plan()?;
        let client_options = ClientOptions {
            command_timeout: self.config.command_timeout()?,
            connect_timeout: self.config.connect_timeout()?,
        };

        let locator: Arc<dyn DaemonLocator> = match (self.locator, &self.config.binary_path) {
            (Some(locator), _) => locator,
            (None, Some(path)) => Arc::new(FixedPathLocator::new(path)),
            (None, None) => Arc::new(SearchLocator::new()),
        };

        let events = self.events.unwrap_or_default();
        let client = Arc::new(ProtocolClient::with_options(events.clone(), client_options));
        let supervisor = ProcessSupervisor::with_options(locator, events.clone(), self.supervisor);

        tracing::debug!(
            model = self.config.model,
            host = %self.config.host,
            port = self.config.port,
            launch = self.launch_daemon,
            "building radio session"
        );

        Ok(RadioSession::from_parts(
            self.config,
            self.launch_daemon,
            events,
            client,
            supervisor,
            plan,
        ))
    }
}
