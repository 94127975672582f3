//! Bounded automatic reconnection.
//!
//! The [`ReconnectionController`] watches the protocol client for
//! unexpected connection loss and retries the control port at a fixed
//! interval. At most one attempt is ever pending. The attempt counter is
//! incremented when an attempt is scheduled and reset to zero by any
//! successful connect; once it reaches the plan's maximum, a single
//! `give-up` status event is emitted and nothing further is scheduled until
//! [`resume`](ReconnectionController::resume) is called.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rigranger_core::bus::EventBus;
use rigranger_core::error::Result;
use rigranger_core::events::{LinkStatus, SessionEvent, StatusEvent};
use rigranger_core::state::{ConnectionState, StateMachine};
use rigranger_core::types::ReconnectPlan;
use rigranger_protocol::{LinkLost, ProtocolClient};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Inner {
    client: Arc<ProtocolClient>,
    state: Arc<StateMachine>,
    events: EventBus,
    plan: ReconnectPlan,
    host: String,
    port: u16,
    attempts: AtomicU32,
    gave_up: AtomicBool,
    suspended: AtomicBool,
    /// The pending attempt; `Some` is the re-entrancy guard.
    timer: Mutex<Option<JoinHandle<()>>>,
    /// Cancels in-flight attempts; replaced on `resume`.
    epoch: Mutex<CancellationToken>,
}

/// Retries the control connection after it drops.
pub struct ReconnectionController {
    inner: Arc<Inner>,
    watcher: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for ReconnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionController")
            .field("plan", &self.inner.plan)
            .field("attempts", &self.attempts())
            .field("pending", &self.is_pending())
            .field("gave_up", &self.has_given_up())
            .finish()
    }
}

impl ReconnectionController {
    pub fn new(
        client: Arc<ProtocolClient>,
        state: Arc<StateMachine>,
        events: EventBus,
        plan: ReconnectPlan,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                state,
                events,
                plan,
                host: host.into(),
                port,
                attempts: AtomicU32::new(0),
                gave_up: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
                timer: Mutex::new(None),
                epoch: Mutex::new(CancellationToken::new()),
            }),
            watcher: Mutex::new(None),
        }
    }

    pub fn plan(&self) -> ReconnectPlan {
        self.inner.plan
    }

    /// Attempts made since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Whether an attempt is waiting to run.
    pub fn is_pending(&self) -> bool {
        lock(&self.inner.timer).is_some()
    }

    pub fn has_given_up(&self) -> bool {
        self.inner.gave_up.load(Ordering::SeqCst)
    }

    /// Start reacting to connection loss reported by the client.
    ///
    /// Idempotent. Must be called from within a tokio runtime.
    pub fn watch_link(&self) {
        let mut watcher = lock(&self.watcher);
        if watcher.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();
        let rx = self.inner.client.subscribe_link_lost();
        tokio::spawn(watch_loop(Arc::clone(&self.inner), rx, shutdown.clone()));
        *watcher = Some(shutdown);
    }

    /// Schedule one attempt after the plan's delay.
    ///
    /// No-op while an attempt is pending or while suspended. Gives up when
    /// the plan is exhausted.
    pub fn schedule(&self) {
        self.inner.schedule();
    }

    /// Cancel any pending attempt and suspend scheduling until [`resume`].
    ///
    /// [`resume`]: ReconnectionController::resume
    pub fn cancel(&self) {
        self.inner.suspended.store(true, Ordering::SeqCst);
        lock(&self.inner.epoch).cancel();
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.abort();
            tracing::debug!("pending reconnect cancelled");
        }
        if let Err(e) = self
            .inner
            .state
            .transition_from(ConnectionState::Reconnecting, ConnectionState::Disconnected)
        {
            tracing::debug!(error = %e, "state unchanged on cancel");
        }
    }

    /// Re-enable scheduling with a fresh plan: zero attempts, give-up cleared.
    pub fn resume(&self) {
        *lock(&self.inner.epoch) = CancellationToken::new();
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.gave_up.store(false, Ordering::SeqCst);
        self.inner.suspended.store(false, Ordering::SeqCst);
    }

    /// Record a successful connect made outside the controller.
    pub fn reset_attempts(&self) {
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.gave_up.store(false, Ordering::SeqCst);
    }
}

impl Drop for ReconnectionController {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.cancel();
        }
        lock(&self.inner.epoch).cancel();
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.abort();
        }
    }
}

enum Next {
    Skip,
    GiveUp,
    Attempt(u32, oneshot::Sender<()>),
}

impl Inner {
    fn schedule(self: &Arc<Self>) {
        let next = {
            let mut timer = lock(&self.timer);
            self.decide(&mut timer)
        };
        self.follow(next);
    }

    /// Pick the next step. Runs under the timer lock, so every state change
    /// made by the controller is ordered against the others.
    fn decide(self: &Arc<Self>, timer: &mut Option<JoinHandle<()>>) -> Next {
        if self.suspended.load(Ordering::SeqCst) || timer.is_some() {
            return Next::Skip;
        }
        if self.attempts.load(Ordering::SeqCst) >= self.plan.max_attempts {
            return Next::GiveUp;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(e) = self.state.transition(ConnectionState::Reconnecting) {
            tracing::warn!(error = %e, "scheduling reconnect from unexpected state");
        }
        // The attempt waits for the event emitted in `follow` so observers
        // see `reconnecting` before its outcome.
        let (release, gate) = oneshot::channel();
        let epoch = lock(&self.epoch).clone();
        *timer = Some(tokio::spawn(run_attempt(Arc::clone(self), attempt, gate, epoch)));
        Next::Attempt(attempt, release)
    }

    fn follow(&self, next: Next) {
        match next {
            Next::Skip => tracing::trace!("reconnect already pending or suspended"),
            Next::GiveUp => self.give_up(),
            Next::Attempt(attempt, release) => {
                tracing::info!(
                    attempt,
                    max_attempts = self.plan.max_attempts,
                    delay_ms = self.plan.delay.as_millis(),
                    "scheduling reconnect"
                );
                self.events.emit(SessionEvent::Status(StatusEvent::reconnecting(
                    attempt,
                    self.plan.max_attempts,
                )));
                let _ = release.send(());
            }
        }
    }

    fn give_up(&self) {
        if self.gave_up.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.state.transition(ConnectionState::GaveUp) {
            tracing::debug!(error = %e, "state unchanged on give-up");
        }
        let attempts = self.attempts.load(Ordering::SeqCst);
        tracing::warn!(attempts, "giving up on rigctld");
        self.events.status(
            LinkStatus::GiveUp,
            format!("Giving up after {attempts} reconnection attempts"),
        );
    }

    /// Settle attempt `attempt` and free the pending slot.
    ///
    /// A connect only counts as a reconnect if the link is still up; one
    /// that dropped again in the meantime is retried like a failure.
    fn attempt_finished(self: &Arc<Self>, attempt: u32, result: Result<()>, epoch: &CancellationToken) {
        let next = {
            let mut timer = lock(&self.timer);
            if epoch.is_cancelled() {
                return;
            }
            timer.take();
            match result {
                Ok(()) if self.client.is_connected() => {
                    self.attempts.store(0, Ordering::SeqCst);
                    self.gave_up.store(false, Ordering::SeqCst);
                    if let Err(e) = self.state.transition(ConnectionState::Connected) {
                        tracing::warn!(error = %e, "reconnected from unexpected state");
                    }
                    None
                }
                Ok(()) => {
                    tracing::warn!(attempt, "connection dropped right after reconnecting");
                    Some(self.decide(&mut timer))
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    self.events.debug(format!("Reconnect attempt {attempt} failed: {e}"));
                    Some(self.decide(&mut timer))
                }
            }
        };

        match next {
            Some(next) => self.follow(next),
            None => {
                tracing::info!(host = %self.host, port = self.port, "reconnected to rigctld");
                self.events.status(
                    LinkStatus::Connected,
                    format!("Reconnected to rigctld at {}:{}", self.host, self.port),
                );
            }
        }
    }

    fn link_lost(self: &Arc<Self>, generation: u64) {
        let next = {
            let mut timer = lock(&self.timer);
            if generation < self.client.generation() {
                tracing::debug!(generation, "loss of a replaced connection ignored");
                return;
            }
            match self
                .state
                .transition_from(ConnectionState::Connected, ConnectionState::Disconnected)
            {
                Ok(true) => {}
                Ok(false) => tracing::debug!(state = %self.state.current(), "link lost outside Connected"),
                Err(e) => tracing::warn!(error = %e, "link lost"),
            }
            self.decide(&mut timer)
        };
        self.follow(next);
    }
}

async fn run_attempt(inner: Arc<Inner>, attempt: u32, gate: oneshot::Receiver<()>, epoch: CancellationToken) {
    let _ = gate.await;

    tokio::select! {
        biased;
        _ = epoch.cancelled() => return,
        _ = tokio::time::sleep(inner.plan.delay) => {}
    }

    // The slot stays occupied until the outcome is settled, so a loss
    // reported meanwhile cannot schedule a second attempt.
    let result = tokio::select! {
        biased;
        _ = epoch.cancelled() => return,
        result = inner.client.connect(&inner.host, inner.port) => result,
    };

    inner.attempt_finished(attempt, result, &epoch);
}

async fn watch_loop(inner: Arc<Inner>, mut rx: broadcast::Receiver<LinkLost>, shutdown: CancellationToken) {
    loop {
        let lost = tokio::select! {
            _ = shutdown.cancelled() => break,
            lost = rx.recv() => lost,
        };
        match lost {
            Ok(lost) => {
                tracing::debug!(generation = lost.generation, reason = %lost.reason, "connection lost");
                inner.link_lost(lost.generation);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "link-loss notifications lagged");
                if !inner.client.is_connected() {
                    inner.link_lost(inner.client.generation());
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigranger_protocol::ClientOptions;
    use rigranger_test_harness::{MockRigctld, SimulatedRig};
    use std::time::Duration;

    fn fast_plan(max_attempts: u32) -> ReconnectPlan {
        ReconnectPlan {
            max_attempts,
            delay: Duration::from_millis(20),
        }
    }

    fn client(events: &EventBus) -> Arc<ProtocolClient> {
        Arc::new(ProtocolClient::with_options(
            events.clone(),
            ClientOptions {
                command_timeout: Duration::from_millis(500),
                connect_timeout: Duration::from_millis(500),
            },
        ))
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn next_status(rx: &mut broadcast::Receiver<SessionEvent>) -> StatusEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("timed out waiting for a status event")
                .unwrap();
            if let SessionEvent::Status(status) = event {
                return status;
            }
        }
    }

    #[tokio::test]
    async fn attempts_are_bounded_and_give_up_is_emitted_once() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let state = Arc::new(StateMachine::new());
        let port = closed_port().await;
        let controller =
            ReconnectionController::new(client(&events), Arc::clone(&state), events.clone(), fast_plan(3), "127.0.0.1", port);

        controller.schedule();

        let mut statuses = Vec::new();
        loop {
            let status = next_status(&mut rx).await;
            let done = status.status == LinkStatus::GiveUp;
            statuses.push(status);
            if done {
                break;
            }
        }

        let reconnecting: Vec<_> = statuses
            .iter()
            .filter(|s| s.status == LinkStatus::Reconnecting)
            .collect();
        assert_eq!(reconnecting.len(), 3);
        assert_eq!(reconnecting[0].attempt, Some(1));
        assert_eq!(reconnecting[2].attempt, Some(3));
        assert_eq!(reconnecting[2].max_attempts, Some(3));
        assert_eq!(controller.attempts(), 3);
        assert_eq!(state.current(), ConnectionState::GaveUp);

        // Nothing further happens, even when asked.
        controller.schedule();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let extra = rx.try_recv();
        assert!(extra.is_err(), "unexpected event after give-up: {extra:?}");
        assert_eq!(controller.attempts(), 3);
        assert!(!controller.is_pending());
    }

    #[tokio::test]
    async fn only_one_attempt_pending_at_a_time() {
        let events = EventBus::new();
        let state = Arc::new(StateMachine::new());
        let port = closed_port().await;
        let controller = ReconnectionController::new(
            client(&events),
            state,
            events.clone(),
            ReconnectPlan {
                max_attempts: 5,
                delay: Duration::from_secs(5),
            },
            "127.0.0.1",
            port,
        );

        controller.schedule();
        controller.schedule();
        controller.schedule();

        assert_eq!(controller.attempts(), 1);
        assert!(controller.is_pending());
        controller.cancel();
    }

    #[tokio::test]
    async fn recovers_after_link_loss() {
        let mock = MockRigctld::simulator(SimulatedRig::default()).await.unwrap();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let state = Arc::new(StateMachine::new());
        let client = client(&events);
        let controller = ReconnectionController::new(
            Arc::clone(&client),
            Arc::clone(&state),
            events.clone(),
            fast_plan(5),
            mock.host(),
            mock.port(),
        );
        controller.watch_link();

        client.connect(mock.host(), mock.port()).await.unwrap();
        state.transition(ConnectionState::Connecting).unwrap();
        state.transition(ConnectionState::Connected).unwrap();
        client.execute("\\get_freq").await.unwrap();

        mock.disconnect_clients();

        assert_eq!(next_status(&mut rx).await.status, LinkStatus::Disconnected);
        let reconnecting = next_status(&mut rx).await;
        assert_eq!(reconnecting.status, LinkStatus::Reconnecting);
        assert_eq!(reconnecting.attempt, Some(1));
        let connected = next_status(&mut rx).await;
        assert_eq!(connected.status, LinkStatus::Connected);

        assert_eq!(controller.attempts(), 0);
        assert_eq!(state.current(), ConnectionState::Connected);
        assert!(client.is_connected());
        assert_eq!(mock.connection_count(), 2);
        client.execute("\\get_freq").await.unwrap();
    }

    #[tokio::test]
    async fn cancel_stops_pending_attempt() {
        let mock = MockRigctld::simulator(SimulatedRig::default()).await.unwrap();
        let events = EventBus::new();
        let state = Arc::new(StateMachine::new());
        let controller = ReconnectionController::new(
            client(&events),
            Arc::clone(&state),
            events.clone(),
            ReconnectPlan {
                max_attempts: 5,
                delay: Duration::from_millis(100),
            },
            mock.host(),
            mock.port(),
        );

        controller.schedule();
        assert_eq!(state.current(), ConnectionState::Reconnecting);
        controller.cancel();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(mock.connection_count(), 0);
        assert!(!controller.is_pending());
        assert_eq!(state.current(), ConnectionState::Disconnected);

        // Suspended until resumed.
        controller.schedule();
        assert!(!controller.is_pending());
        controller.resume();
        controller.schedule();
        assert!(controller.is_pending());
        controller.cancel();
    }

    #[tokio::test]
    async fn resume_clears_give_up() {
        let events = EventBus::new();
        let state = Arc::new(StateMachine::new());
        let port = closed_port().await;
        let controller = ReconnectionController::new(
            client(&events),
            Arc::clone(&state),
            events.clone(),
            fast_plan(0),
            "127.0.0.1",
            port,
        );

        controller.schedule();
        assert!(controller.has_given_up());
        assert_eq!(state.current(), ConnectionState::GaveUp);

        controller.resume();
        assert!(!controller.has_given_up());
        assert_eq!(controller.attempts(), 0);
    }

    #[tokio::test]
    async fn connect_that_already_dropped_is_not_a_reconnect() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let state = Arc::new(StateMachine::new());
        let port = closed_port().await;
        let controller = ReconnectionController::new(
            client(&events),
            Arc::clone(&state),
            events.clone(),
            ReconnectPlan {
                max_attempts: 5,
                delay: Duration::from_secs(5),
            },
            "127.0.0.1",
            port,
        );

        controller.schedule();
        assert_eq!(controller.attempts(), 1);
        let first = lock(&controller.inner.timer).take().unwrap();
        first.abort();

        // The connect returned Ok but the client has no live link.
        let epoch = lock(&controller.inner.epoch).clone();
        controller.inner.attempt_finished(1, Ok(()), &epoch);

        assert_eq!(state.current(), ConnectionState::Reconnecting);
        assert_eq!(controller.attempts(), 2);
        assert!(controller.is_pending());
        let statuses: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| event.link_status())
            .collect();
        assert_eq!(statuses, vec![LinkStatus::Reconnecting, LinkStatus::Reconnecting]);
        controller.cancel();
    }

    #[tokio::test]
    async fn loss_of_replaced_connection_is_ignored() {
        let mock = MockRigctld::simulator(SimulatedRig::default()).await.unwrap();
        let events = EventBus::new();
        let state = Arc::new(StateMachine::new());
        let client = client(&events);
        let controller = ReconnectionController::new(
            Arc::clone(&client),
            Arc::clone(&state),
            events.clone(),
            fast_plan(5),
            mock.host(),
            mock.port(),
        );

        client.connect(mock.host(), mock.port()).await.unwrap();
        client.connect(mock.host(), mock.port()).await.unwrap();
        state.transition(ConnectionState::Connecting).unwrap();
        state.transition(ConnectionState::Connected).unwrap();

        controller.inner.link_lost(1);

        assert_eq!(state.current(), ConnectionState::Connected);
        assert!(!controller.is_pending());
        assert_eq!(controller.attempts(), 0);
        assert!(client.is_connected());
    }
}
