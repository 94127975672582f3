//! RadioSession -- the facade over daemon, connection and reconnection.
//!
//! A session owns one [`ProtocolClient`], one [`ProcessSupervisor`] and one
//! [`ReconnectionController`], all publishing to the same [`EventBus`].
//! Typed radio operations are thin wrappers over raw command execution, so
//! they share its serialization and deadline.

use std::sync::Arc;

use rigranger_core::bus::EventBus;
use rigranger_core::error::{Error, Result};
use rigranger_core::events::LinkStatus;
use rigranger_core::state::{ConnectionState, StateMachine};
use rigranger_core::types::{ModeInfo, RadioInfo, ReconnectPlan, SessionStatus};
use rigranger_process::{DaemonArgs, ProcessSupervisor};
use rigranger_protocol::{CommandResponse, ProtocolClient, protocol};

use crate::config::SessionConfig;
use crate::reconnect::ReconnectionController;

/// A managed connection to one radio through `rigctld`.
///
/// Build one with [`SessionBuilder`](crate::SessionBuilder). All methods take
/// `&self`; share a session between tasks with `Arc`.
pub struct RadioSession {
    config: SessionConfig,
    launch_daemon: bool,
    events: EventBus,
    state: Arc<StateMachine>,
    client: Arc<ProtocolClient>,
    supervisor: ProcessSupervisor,
    reconnect: ReconnectionController,
}

impl std::fmt::Debug for RadioSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioSession")
            .field("model", &self.config.model)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state.current())
            .finish()
    }
}

impl RadioSession {
    pub(crate) fn from_parts(
        config: SessionConfig,
        launch_daemon: bool,
        events: EventBus,
        client: Arc<ProtocolClient>,
        supervisor: ProcessSupervisor,
        plan: ReconnectPlan,
    ) -> Self {
        let state = Arc::new(StateMachine::new());
        let reconnect = ReconnectionController::new(
            Arc::clone(&client),
            Arc::clone(&state),
            events.clone(),
            plan,
            config.host.clone(),
            config.port,
        );
        Self {
            config,
            launch_daemon,
            events,
            state,
            client,
            supervisor,
            reconnect,
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Launch the daemon (unless disabled) and connect to it.
    ///
    /// Daemon failures are returned. A failed connect is left to the
    /// reconnection controller and does not fail `start`.
    pub async fn start(&self) -> Result<()> {
        if self.launch_daemon {
            self.supervisor.launch(&self.daemon_args()).await?;
        }
        self.reconnect.cancel();
        self.reconnect.resume();
        if let Err(e) = self.open().await {
            tracing::warn!(error = %e, "initial connect failed, reconnection scheduled");
        }
        Ok(())
    }

    /// Connect to an already-running daemon.
    ///
    /// Clears a previous give-up and any pending attempt. On failure the
    /// error is returned and reconnection is scheduled.
    pub async fn connect(&self) -> Result<()> {
        self.reconnect.cancel();
        self.reconnect.resume();
        self.open().await
    }

    /// Cancel reconnection, close the socket and terminate the daemon.
    ///
    /// Each step is idempotent, so `stop` may be called repeatedly.
    pub async fn stop(&self) {
        self.reconnect.cancel();
        self.client.close().await;
        self.supervisor.terminate().await;

        if self.state.current() != ConnectionState::Disconnected {
            if let Err(e) = self.state.transition(ConnectionState::Disconnected) {
                tracing::warn!(error = %e, "state unchanged on stop");
            }
        }
        tracing::info!("radio session stopped");
        self.events.status(LinkStatus::Disconnected, "Manager stopped");
    }

    async fn open(&self) -> Result<()> {
        self.reconnect.watch_link();

        if self.state.current() == ConnectionState::Connected {
            self.client.close().await;
            self.state.transition(ConnectionState::Disconnected)?;
        }
        self.state.transition(ConnectionState::Connecting)?;

        let (host, port) = (self.config.host.as_str(), self.config.port);
        self.events
            .status(LinkStatus::Connecting, format!("Connecting to rigctld at {host}:{port}"));

        match self.client.connect(host, port).await {
            Ok(()) => {
                self.reconnect.reset_attempts();
                self.state.transition(ConnectionState::Connected)?;
                self.events.status(
                    LinkStatus::Connected,
                    format!("Connected to radio model {} on port {port}", self.config.model),
                );
                Ok(())
            }
            Err(e) => {
                self.state.transition(ConnectionState::Disconnected)?;
                self.events
                    .status(LinkStatus::Error, format!("Failed to connect to rigctld: {e}"));
                self.reconnect.schedule();
                Err(e)
            }
        }
    }

    fn daemon_args(&self) -> DaemonArgs {
        let mut args = DaemonArgs::new(self.config.model, self.config.port);
        if let Some(device) = &self.config.device {
            args = args.with_device(device.clone());
        }
        if let Some(baud) = self.config.baud {
            args = args.with_serial_speed(baud);
        }
        args
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    /// The event bus every component of this session publishes to.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Point-in-time status snapshot.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            connected: self.client.is_connected(),
            state: self.state.current(),
            model: self.config.model,
            device: self.config.device.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            reconnect_attempts: self.reconnect.attempts(),
            max_reconnect_attempts: self.reconnect.plan().max_attempts,
            daemon_running: self.supervisor.is_running(),
            binary_path: self.supervisor.binary_path(),
        }
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    async fn execute(&self, command: &str) -> Result<CommandResponse> {
        self.client.execute(command).await
    }

    /// Send a raw command line and return the response text, status line
    /// included.
    pub async fn execute_raw(&self, command: &str) -> Result<String> {
        Ok(self.execute(command).await?.raw())
    }

    /// Current frequency in hertz.
    pub async fn get_frequency(&self) -> Result<f64> {
        let response = self.execute(&protocol::get_freq()).await?;
        protocol::parse_frequency(&response)
    }

    pub async fn set_frequency(&self, hz: f64) -> Result<()> {
        self.execute(&protocol::set_freq(hz)).await?;
        Ok(())
    }

    pub async fn get_mode(&self) -> Result<ModeInfo> {
        let response = self.execute(&protocol::get_mode()).await?;
        protocol::parse_mode(&response)
    }

    /// Set mode and passband; a passband of 0 selects the rig's default.
    pub async fn set_mode(&self, mode: &str, passband: i64) -> Result<()> {
        check_token("mode token", mode)?;
        self.execute(&protocol::set_mode(mode, passband)).await?;
        Ok(())
    }

    pub async fn get_ptt(&self) -> Result<bool> {
        let response = self.execute(&protocol::get_ptt()).await?;
        protocol::parse_ptt(&response)
    }

    pub async fn set_ptt(&self, enabled: bool) -> Result<()> {
        self.execute(&protocol::set_ptt(enabled)).await?;
        Ok(())
    }

    pub async fn get_level(&self, name: &str) -> Result<f64> {
        check_token("level name", name)?;
        let response = self.execute(&protocol::get_level(name)).await?;
        protocol::parse_level(&response)
    }

    pub async fn set_level(&self, name: &str, value: f64) -> Result<()> {
        check_token("level name", name)?;
        self.execute(&protocol::set_level(name, value)).await?;
        Ok(())
    }

    /// Model, device, and whatever of frequency and mode could be read.
    ///
    /// A failed frequency or mode query is logged and left out of the
    /// result; only a missing connection fails the call.
    pub async fn get_info(&self) -> Result<RadioInfo> {
        if !self.client.is_connected() {
            return Err(Error::NotConnected);
        }

        let mut info = RadioInfo {
            model: self.config.model,
            device: self.config.device.clone(),
            frequency: None,
            mode: None,
            passband: None,
        };

        match self.get_frequency().await {
            Ok(hz) => info.frequency = Some(hz),
            Err(e) => tracing::warn!(error = %e, "frequency unavailable for info"),
        }
        match self.get_mode().await {
            Ok(mode) => {
                info.mode = Some(mode.mode);
                info.passband = Some(mode.passband);
            }
            Err(e) => tracing::warn!(error = %e, "mode unavailable for info"),
        }

        Ok(info)
    }
}

/// Command arguments are single whitespace-free tokens.
fn check_token(what: &str, token: &str) -> Result<()> {
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(Error::Protocol(format!("invalid {what} {token:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::SessionBuilder;
    use rigranger_core::events::{SessionEvent, StatusEvent};
    use rigranger_test_harness::{MockReply, MockRigctld, SimulatedRig};
    use tokio::sync::broadcast;

    fn builder_for(mock: &MockRigctld) -> SessionBuilder {
        SessionBuilder::new()
            .launch_daemon(false)
            .host(mock.host())
            .port(mock.port())
            .command_timeout(Duration::from_millis(300))
            .connect_timeout(Duration::from_millis(500))
            .retry_interval(Duration::from_millis(20))
    }

    async fn simulated() -> (MockRigctld, RadioSession) {
        let mock = MockRigctld::simulator(SimulatedRig::default()).await.unwrap();
        let session = builder_for(&mock).build().unwrap();
        session.start().await.unwrap();
        (mock, session)
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_for(rx: &mut broadcast::Receiver<SessionEvent>, wanted: LinkStatus) -> StatusEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("timed out waiting for status event")
                .unwrap();
            if let SessionEvent::Status(status) = event {
                if status.status == wanted {
                    return status;
                }
            }
        }
    }

    #[tokio::test]
    async fn start_connects_and_reports_status() {
        let mock = MockRigctld::simulator(SimulatedRig::default()).await.unwrap();
        let session = builder_for(&mock).build().unwrap();
        let mut rx = session.events().subscribe();

        session.start().await.unwrap();

        assert_eq!(wait_for(&mut rx, LinkStatus::Connecting).await.status, LinkStatus::Connecting);
        let connected = wait_for(&mut rx, LinkStatus::Connected).await;
        assert_eq!(connected.message, format!("Connected to radio model 1 on port {}", mock.port()));

        let status = session.status();
        assert!(status.connected);
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(!status.daemon_running);
    }

    #[tokio::test]
    async fn set_then_get_frequency() {
        let (_mock, session) = simulated().await;

        session.set_frequency(14_250_000.0).await.unwrap();
        assert_eq!(session.get_frequency().await.unwrap(), 14_250_000.0);
    }

    #[tokio::test]
    async fn mode_ptt_and_levels() {
        let (mock, session) = simulated().await;

        session.set_mode("CW", 500).await.unwrap();
        assert_eq!(
            session.get_mode().await.unwrap(),
            ModeInfo {
                mode: "CW".into(),
                passband: 500
            }
        );

        assert!(!session.get_ptt().await.unwrap());
        session.set_ptt(true).await.unwrap();
        assert!(session.get_ptt().await.unwrap());

        session.set_level("RFPOWER", 0.25).await.unwrap();
        assert_eq!(session.get_level("RFPOWER").await.unwrap(), 0.25);

        assert!(mock.received().contains(&"\\set_mode CW 500".to_string()));
        assert!(mock.received().contains(&"\\set_ptt 1".to_string()));
    }

    #[tokio::test]
    async fn bad_mode_token_is_rejected_locally() {
        let (mock, session) = simulated().await;
        let before = mock.received().len();

        assert!(matches!(session.set_mode("", 0).await, Err(Error::Protocol(_))));
        assert!(matches!(session.set_mode("USB 2400", 0).await, Err(Error::Protocol(_))));
        assert_eq!(mock.received().len(), before);
    }

    #[tokio::test]
    async fn bad_level_name_is_rejected_locally() {
        let (mock, session) = simulated().await;
        let before = mock.received().len();

        assert!(matches!(session.get_level("").await, Err(Error::Protocol(_))));
        assert!(matches!(
            session.get_level("STRENGTH\n\\set_ptt 1").await,
            Err(Error::Protocol(_))
        ));
        assert!(matches!(session.set_level("AF 1", 0.5).await, Err(Error::Protocol(_))));
        assert_eq!(mock.received().len(), before);
        assert!(!session.get_ptt().await.unwrap());
    }

    #[tokio::test]
    async fn execute_raw_sends_exactly_one_line() {
        let (mock, session) = simulated().await;
        let before = mock.received().len();

        let err = session
            .execute_raw("\\set_freq 7000000\n\\get_mode")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(mock.received().len(), before);

        assert_eq!(session.execute_raw("\\get_mode").await.unwrap(), "USB\n2400\nRPRT 0");
        assert_eq!(mock.received().len(), before + 1);
    }

    #[tokio::test]
    async fn timed_out_reply_does_not_answer_later_query() {
        let mock = MockRigctld::start(|line: &str| match line {
            "\\get_freq" => MockReply::Delayed(Duration::from_millis(450), "14250000\nRPRT 0\n".into()),
            "\\get_ptt" => MockReply::value(0),
            _ => MockReply::error(-4),
        })
        .await
        .unwrap();
        let session = builder_for(&mock).build().unwrap();
        session.start().await.unwrap();
        let mut rx = session.events().subscribe();

        let err = session.get_frequency().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolTimeout));

        // The session resynchronizes on a fresh connection.
        wait_for(&mut rx, LinkStatus::Connected).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!session.get_ptt().await.unwrap());
        assert_eq!(mock.connection_count(), 2);
    }

    #[tokio::test]
    async fn command_failure_surfaces_code() {
        let (_mock, session) = simulated().await;

        let err = session.get_level("NOPE").await.unwrap_err();
        assert!(matches!(err, Error::CommandFailure { code: -1, .. }));
    }

    #[tokio::test]
    async fn execute_raw_returns_response_text() {
        let (_mock, session) = simulated().await;

        session.set_frequency(7_074_000.0).await.unwrap();
        assert_eq!(session.execute_raw("\\get_freq").await.unwrap(), "7074000\nRPRT 0");
    }

    #[tokio::test]
    async fn execute_raw_while_disconnected_touches_nothing() {
        let mock = MockRigctld::simulator(SimulatedRig::default()).await.unwrap();
        let session = builder_for(&mock).build().unwrap();

        let err = session.execute_raw("\\get_freq").await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert_eq!(mock.connection_count(), 0);
        assert!(mock.received().is_empty());
    }

    #[tokio::test]
    async fn silent_daemon_times_out() {
        let mock = MockRigctld::start(|_: &str| MockReply::Silent).await.unwrap();
        let session = builder_for(&mock).build().unwrap();
        session.start().await.unwrap();

        let err = session.get_frequency().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolTimeout));
    }

    #[tokio::test]
    async fn slow_daemon_times_out_too() {
        let mock = MockRigctld::start(|_: &str| {
            MockReply::Delayed(Duration::from_millis(600), "14250000\nRPRT 0\n".into())
        })
        .await
        .unwrap();
        let session = builder_for(&mock).build().unwrap();
        session.start().await.unwrap();

        let err = session.get_frequency().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolTimeout));
    }

    #[tokio::test]
    async fn info_tolerates_failed_mode_query() {
        let mock = MockRigctld::start(|line: &str| match line {
            "\\get_freq" => MockReply::value(14_250_000),
            _ => MockReply::error(-11),
        })
        .await
        .unwrap();
        let session = builder_for(&mock).build().unwrap();
        session.start().await.unwrap();

        let info = session.get_info().await.unwrap();
        assert_eq!(info.model, 1);
        assert_eq!(info.frequency, Some(14_250_000.0));
        assert!(info.mode.is_none());
        assert!(info.passband.is_none());
    }

    #[tokio::test]
    async fn info_with_everything_available() {
        let (_mock, session) = simulated().await;

        let info = session.get_info().await.unwrap();
        assert_eq!(info.frequency, Some(14_074_000.0));
        assert_eq!(info.mode.as_deref(), Some("USB"));
        assert_eq!(info.passband, Some(2400));
    }

    #[tokio::test]
    async fn info_requires_connection() {
        let session = SessionBuilder::new().launch_daemon(false).build().unwrap();
        assert!(matches!(session.get_info().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn concurrent_operations_stay_paired() {
        let (mock, session) = simulated().await;
        let session = Arc::new(session);
        let before = mock.received().len();

        let mut tasks = Vec::new();
        for i in 0..16u32 {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                let name = format!("TEST{i}");
                session.set_level(&name, f64::from(i) / 10.0).await.unwrap();
                session.get_level(&name).await.unwrap()
            }));
        }

        for (i, task) in tasks.into_iter().enumerate() {
            let expected = f64::from(u32::try_from(i).unwrap()) / 10.0;
            assert_eq!(task.await.unwrap(), expected);
        }
        assert_eq!(mock.received().len() - before, 32);
    }

    #[tokio::test]
    async fn stop_closes_and_does_not_reconnect() {
        let (mock, session) = simulated().await;
        let mut rx = session.events().subscribe();

        session.stop().await;

        let stopped = wait_for(&mut rx, LinkStatus::Disconnected).await;
        assert_eq!(stopped.message, "Manager stopped");
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mock.connection_count(), 1);

        session.stop().await;
        assert!(matches!(session.execute_raw("\\get_freq").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn daemon_restart_is_recovered() {
        let (mock, session) = simulated().await;
        let mut rx = session.events().subscribe();

        mock.disconnect_clients();

        wait_for(&mut rx, LinkStatus::Disconnected).await;
        let reconnecting = wait_for(&mut rx, LinkStatus::Reconnecting).await;
        assert_eq!(reconnecting.attempt, Some(1));
        wait_for(&mut rx, LinkStatus::Connected).await;

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.status().reconnect_attempts, 0);
        session.set_frequency(3_573_000.0).await.unwrap();
        assert_eq!(session.get_frequency().await.unwrap(), 3_573_000.0);
    }

    #[tokio::test]
    async fn unreachable_daemon_gives_up_once() {
        let port = closed_port().await;
        let session = SessionBuilder::new()
            .launch_daemon(false)
            .port(port)
            .reconnect_attempts(2)
            .retry_interval(Duration::from_millis(10))
            .connect_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let mut rx = session.events().subscribe();

        // The failed initial connect does not fail start().
        session.start().await.unwrap();

        wait_for(&mut rx, LinkStatus::Error).await;
        wait_for(&mut rx, LinkStatus::GiveUp).await;
        assert_eq!(session.state(), ConnectionState::GaveUp);
        assert_eq!(session.status().reconnect_attempts, 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut give_ups = 0;
        while let Ok(event) = rx.try_recv() {
            if event.link_status() == Some(LinkStatus::GiveUp) {
                give_ups += 1;
            }
        }
        assert_eq!(give_ups, 0);

        // An explicit connect starts a fresh plan.
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        let reconnecting = wait_for(&mut rx, LinkStatus::Reconnecting).await;
        assert_eq!(reconnecting.attempt, Some(1));
        session.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_launches_daemon_then_connects() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("rigctld");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        // The mock stands in for the control port the daemon would open.
        let mock = MockRigctld::simulator(SimulatedRig::default()).await.unwrap();
        let session = builder_for(&mock)
            .launch_daemon(true)
            .binary_path(&script)
            .grace_period(Duration::from_millis(200))
            .terminate_timeout(Duration::from_millis(500))
            .build()
            .unwrap();

        session.start().await.unwrap();
        let status = session.status();
        assert!(status.connected);
        assert!(status.daemon_running);
        assert_eq!(status.binary_path.as_deref(), Some(script.as_path()));

        session.stop().await;
        assert!(!session.status().daemon_running);
    }

    #[tokio::test]
    async fn missing_daemon_fails_start() {
        let session = SessionBuilder::new()
            .binary_path("/no/such/rigctld")
            .build()
            .unwrap();

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::BinaryNotFound(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
