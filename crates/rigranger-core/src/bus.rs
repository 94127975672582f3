//! Publish/subscribe fan-out for [`SessionEvent`]s.
//!
//! Handlers registered with [`EventBus::on`] are invoked synchronously, in
//! registration order, on the emitting task. A handler that panics is logged
//! and skipped; delivery continues with the next handler and the emitter
//! never sees the failure.
//!
//! For async consumers (e.g. a WebSocket relay) [`EventBus::subscribe`]
//! hands out a [`tokio::sync::broadcast`] receiver carrying every event.
//! Slow receivers may lag and miss events; the synchronous handlers never do.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::events::{EventKind, LinkStatus, SessionEvent};

/// Broadcast channel capacity for async subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A synchronous event handler.
///
/// Implemented for any `Fn(&SessionEvent) + Send + Sync` closure.
pub trait Observer: Send + Sync {
    fn notify(&self, event: &SessionEvent);
}

impl<F> Observer for F
where
    F: Fn(&SessionEvent) + Send + Sync,
{
    fn notify(&self, event: &SessionEvent) {
        self(event)
    }
}

struct Registration {
    kind: EventKind,
    observer: Arc<dyn Observer>,
}

struct BusInner {
    observers: RwLock<Vec<Registration>>,
    tx: broadcast::Sender<SessionEvent>,
}

/// Typed event fan-out shared by every component of a session.
///
/// Cloning is cheap; all clones publish to the same set of handlers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                observers: RwLock::new(Vec::new()),
                tx,
            }),
        }
    }

    /// Register `observer` for events of `kind`.
    pub fn on(&self, kind: EventKind, observer: impl Observer + 'static) {
        let mut observers = self
            .inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        observers.push(Registration {
            kind,
            observer: Arc::new(observer),
        });
    }

    /// Receive every event asynchronously.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.tx.subscribe()
    }

    /// Deliver `event` to every handler registered for its kind, then to
    /// async subscribers.
    pub fn emit(&self, event: SessionEvent) {
        let kind = event.kind();

        // Snapshot so handlers may register further handlers without
        // deadlocking on the registry lock.
        let targets: Vec<Arc<dyn Observer>> = {
            let observers = self
                .inner
                .observers
                .read()
                .unwrap_or_else(|e| e.into_inner());
            observers
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| Arc::clone(&r.observer))
                .collect()
        };

        for (index, observer) in targets.iter().enumerate() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer.notify(&event))) {
                tracing::error!(
                    %kind,
                    handler = index,
                    error = %panic_message(&panic),
                    "event handler panicked"
                );
            }
        }

        // No receivers is not an error.
        let _ = self.inner.tx.send(event);
    }

    /// Emit a status event.
    pub fn status(&self, status: LinkStatus, message: impl Into<String>) {
        self.emit(SessionEvent::status(status, message));
    }

    /// Emit a data event.
    pub fn data(&self, line: impl Into<String>) {
        self.emit(SessionEvent::Data(line.into()));
    }

    /// Emit a debug event.
    pub fn debug(&self, message: impl Into<String>) {
        self.emit(SessionEvent::Debug(message.into()));
    }

    /// Number of registered synchronous handlers.
    pub fn observer_count(&self) -> usize {
        self.inner
            .observers
            .read()
            .map(|o| o.len())
            .unwrap_or_default()
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
