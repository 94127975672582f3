//! Session configuration.
//!
//! [`SessionConfig`] mirrors the `hamlib` section of the server's JSON
//! configuration file:
//!
//! ```json
//! {
//!   "server": { "port": 8080 },
//!   "hamlib": {
//!     "model": 3073,
//!     "device": "/dev/ttyUSB0",
//!     "port": 4532,
//!     "baud": 19200,
//!     "retry_interval": 2,
//!     "reconnect_attempts": 5
//!   }
//! }
//! ```
//!
//! Every key is optional. Other sections belong to other components and are
//! ignored here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rigranger_core::error::{Error, Result};
use rigranger_core::types::{DEFAULT_CONTROL_HOST, DEFAULT_CONTROL_PORT, DUMMY_MODEL, ReconnectPlan};
use serde::{Deserialize, Serialize};

/// Name of the configuration section read by [`SessionConfig::load`].
pub const SECTION: &str = "hamlib";

/// Settings for one radio session. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hamlib rig model number.
    pub model: i32,
    /// Radio device path (serial port or network address).
    pub device: Option<String>,
    /// Control host the client connects to.
    pub host: String,
    /// Control port the daemon listens on.
    pub port: u16,
    /// Serial speed passed to the daemon; omitted when unset.
    pub baud: Option<u32>,
    /// Delay between reconnection attempts.
    pub retry_interval: f64,
    /// Reconnection attempts before giving up.
    pub reconnect_attempts: u32,
    /// Explicit daemon binary; searched for when unset.
    pub binary_path: Option<PathBuf>,
    /// Deadline for a command's status line.
    pub command_timeout: f64,
    /// TCP connect timeout.
    pub connect_timeout: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let plan = ReconnectPlan::default();
        Self {
            model: DUMMY_MODEL,
            device: None,
            host: DEFAULT_CONTROL_HOST.to_string(),
            port: DEFAULT_CONTROL_PORT,
            baud: None,
            retry_interval: plan.delay.as_secs_f64(),
            reconnect_attempts: plan.max_attempts,
            binary_path: None,
            command_timeout: 2.0,
            connect_timeout: 5.0,
        }
    }
}

impl SessionConfig {
    /// Read the `hamlib` section of a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_json_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), model = config.model, port = config.port, "configuration loaded");
        Ok(config)
    }

    /// Parse a whole configuration document and extract the `hamlib` section.
    ///
    /// A document without the section yields the defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let mut document: serde_json::Value =
            serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid JSON: {e}")))?;

        let config = match document.get_mut(SECTION).map(serde_json::Value::take) {
            Some(serde_json::Value::Null) | None => Self::default(),
            Some(section) => serde_json::from_value(section)
                .map_err(|e| Error::Config(format!("invalid {SECTION} section: {e}")))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config("port must be nonzero".into()));
        }
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        seconds("retry_interval", self.retry_interval)?;
        seconds("command_timeout", self.command_timeout)?;
        seconds("connect_timeout", self.connect_timeout)?;
        Ok(())
    }

    pub fn reconnect_plan(&self) -> Result<ReconnectPlan> {
        Ok(ReconnectPlan {
            max_attempts: self.reconnect_attempts,
            delay: seconds("retry_interval", self.retry_interval)?,
        })
    }

    pub fn command_timeout(&self) -> Result<Duration> {
        seconds("command_timeout", self.command_timeout)
    }

    pub fn connect_timeout(&self) -> Result<Duration> {
        seconds("connect_timeout", self.connect_timeout)
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative number of seconds, got {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = SessionConfig::from_json_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.model, 1);
        assert_eq!(config.port, 4532);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.reconnect_plan().unwrap(), ReconnectPlan::default());
    }

    #[test]
    fn partial_section_fills_in_defaults() {
        let config = SessionConfig::from_json_str(
            r#"{"server": {"port": 8080}, "hamlib": {"model": 3073, "device": "/dev/ttyUSB0", "baud": 19200}}"#,
        )
        .unwrap();
        assert_eq!(config.model, 3073);
        assert_eq!(config.device.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.baud, Some(19200));
        assert_eq!(config.port, 4532);
        assert_eq!(config.reconnect_attempts, 5);
    }

    #[test]
    fn null_device_is_none() {
        let config = SessionConfig::from_json_str(r#"{"hamlib": {"device": null}}"#).unwrap();
        assert!(config.device.is_none());
    }

    #[test]
    fn fractional_retry_interval() {
        let config = SessionConfig::from_json_str(r#"{"hamlib": {"retry_interval": 0.5, "reconnect_attempts": 3}}"#)
            .unwrap();
        let plan = config.reconnect_plan().unwrap();
        assert_eq!(plan.delay, Duration::from_millis(500));
        assert_eq!(plan.max_attempts, 3);
    }

    #[test]
    fn negative_interval_is_rejected() {
        let err = SessionConfig::from_json_str(r#"{"hamlib": {"retry_interval": -1}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_port_is_rejected() {
        let err = SessionConfig::from_json_str(r#"{"hamlib": {"port": 0}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn wrong_type_is_config_error() {
        let err = SessionConfig::from_json_str(r#"{"hamlib": {"model": "ic-7300"}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = SessionConfig::from_json_str("{ hamlib").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"hamlib": {{"model": 2, "port": 4600}}}}"#).unwrap();

        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.model, 2);
        assert_eq!(config.port, 4600);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = SessionConfig::load("/no/such/config.json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
