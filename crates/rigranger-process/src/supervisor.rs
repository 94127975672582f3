//! Launch, liveness and shutdown of the `rigctld` daemon.
//!
//! [`ProcessSupervisor`] spawns the daemon with tokio's process API, gives
//! it a grace period to open the radio and bind its control port, and fails
//! with [`Error::StartFailure`] (carrying the daemon's stderr) if it exits
//! within that window. While the daemon runs, its stderr is forwarded to
//! the log and to `debug` events.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rigranger_core::bus::EventBus;
use rigranger_core::error::{Error, Result};
use rigranger_core::events::LinkStatus;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use crate::locator::DaemonLocator;

/// Time the daemon must stay up after spawning to count as started.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Time allowed for a graceful exit before the daemon is killed.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Cap on how long a failed daemon's stderr is drained.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Command line parameters for one daemon instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonArgs {
    /// Hamlib rig model number (`-m`).
    pub model: i32,
    /// Serial device or network address of the radio (`-r`).
    pub device: Option<String>,
    /// TCP control port (`-t`).
    pub port: u16,
    /// Serial speed in baud (`-s`).
    pub serial_speed: Option<u32>,
}

impl DaemonArgs {
    pub fn new(model: i32, port: u16) -> Self {
        Self {
            model,
            device: None,
            port,
            serial_speed: None,
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_serial_speed(mut self, baud: u32) -> Self {
        self.serial_speed = Some(baud);
        self
    }

    /// The argument vector passed to the binary.
    ///
    /// ```
    /// use rigranger_process::DaemonArgs;
    ///
    /// let args = DaemonArgs::new(3073, 4532).with_device("/dev/ttyUSB0");
    /// assert_eq!(args.to_args(), ["-m", "3073", "-t", "4532", "-r", "/dev/ttyUSB0"]);
    /// ```
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.model.to_string(),
            "-t".to_string(),
            self.port.to_string(),
        ];
        if let Some(device) = &self.device {
            args.push("-r".to_string());
            args.push(device.clone());
        }
        if let Some(baud) = self.serial_speed {
            args.push("-s".to_string());
            args.push(baud.to_string());
        }
        args
    }
}

/// Timing knobs for a [`ProcessSupervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    pub grace_period: Duration,
    pub terminate_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
        }
    }
}

/// Owns at most one running daemon process.
pub struct ProcessSupervisor {
    locator: Arc<dyn DaemonLocator>,
    options: SupervisorOptions,
    events: EventBus,
    /// Serializes launch/terminate.
    lifecycle: tokio::sync::Mutex<()>,
    child: Mutex<Option<Child>>,
    binary: Mutex<Option<PathBuf>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("locator", &self.locator)
            .field("options", &self.options)
            .field("pid", &self.pid())
            .finish()
    }
}

impl ProcessSupervisor {
    pub fn new(locator: Arc<dyn DaemonLocator>, events: EventBus) -> Self {
        Self::with_options(locator, events, SupervisorOptions::default())
    }

    pub fn with_options(locator: Arc<dyn DaemonLocator>, events: EventBus, options: SupervisorOptions) -> Self {
        Self {
            locator,
            options,
            events,
            lifecycle: tokio::sync::Mutex::new(()),
            child: Mutex::new(None),
            binary: Mutex::new(None),
        }
    }

    /// Resolve the daemon binary and remember it for status reports.
    pub fn locate(&self) -> Result<PathBuf> {
        let path = self.locator.locate()?;
        *lock(&self.binary) = Some(path.clone());
        Ok(path)
    }

    /// The most recently resolved binary, if any.
    pub fn binary_path(&self) -> Option<PathBuf> {
        lock(&self.binary).clone()
    }

    /// Start the daemon and confirm it survives the grace period.
    ///
    /// A daemon launched earlier by this supervisor is terminated first.
    pub async fn launch(&self, args: &DaemonArgs) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let binary = match self.locate() {
            Ok(path) => path,
            Err(e) => {
                self.events.status(LinkStatus::Error, e.to_string());
                return Err(e);
            }
        };

        let previous = lock(&self.child).take();
        if let Some(previous) = previous {
            tracing::info!("replacing running rigctld");
            stop_child(previous, self.options.terminate_timeout).await;
        }

        let argv = args.to_args();
        tracing::info!(binary = %binary.display(), args = ?argv, "starting rigctld");

        let mut child = Command::new(&binary)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let err = match e.kind() {
                    std::io::ErrorKind::NotFound => Error::BinaryNotFound(binary.display().to_string()),
                    _ => Error::StartFailure {
                        status: "spawn failed".to_string(),
                        stderr: e.to_string(),
                    },
                };
                self.events.status(LinkStatus::Error, err.to_string());
                err
            })?;

        tokio::time::sleep(self.options.grace_period).await;

        match child.try_wait()? {
            Some(status) => {
                let stderr = drain_stderr(&mut child).await;
                let err = Error::StartFailure {
                    status: status.to_string(),
                    stderr,
                };
                tracing::error!(error = %err, "rigctld exited during startup");
                self.events.status(LinkStatus::Error, err.to_string());
                Err(err)
            }
            None => {
                if let Some(stderr) = child.stderr.take() {
                    spawn_stderr_forwarder(stderr, self.events.clone());
                }
                tracing::info!(pid = child.id(), port = args.port, "rigctld running");
                *lock(&self.child) = Some(child);
                Ok(())
            }
        }
    }

    /// Stop the daemon: SIGTERM, then SIGKILL after the terminate timeout.
    ///
    /// Idempotent; a no-op when nothing is running.
    pub async fn terminate(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let child = lock(&self.child).take();
        if let Some(child) = child {
            stop_child(child, self.options.terminate_timeout).await;
        }
    }

    /// Whether the launched daemon is still alive.
    pub fn is_running(&self) -> bool {
        lock(&self.child)
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    /// Process id of the running daemon.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.child).as_ref().and_then(Child::id)
    }
}

async fn stop_child(mut child: Child, timeout: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(%status, "rigctld already exited");
        return;
    }

    let pid = child.id();
    request_exit(&mut child);

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(pid, %status, "rigctld stopped"),
        Ok(Err(e)) => tracing::warn!(pid, error = %e, "failed to reap rigctld"),
        Err(_) => {
            tracing::warn!(pid, "rigctld did not stop gracefully, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(pid, error = %e, "failed to kill rigctld");
            }
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    tracing::debug!(pid, "sending SIGTERM to rigctld");
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "failed to stop rigctld");
    }
}

async fn drain_stderr(child: &mut Child) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut text = String::new();
    if let Ok(Err(e)) = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr.read_to_string(&mut text)).await {
        tracing::debug!(error = %e, "failed to read rigctld stderr");
    }
    text.trim().to_string()
}

fn spawn_stderr_forwarder(stderr: ChildStderr, events: EventBus) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "rigctld", "{line}");
            events.debug(format!("rigctld: {line}"));
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
