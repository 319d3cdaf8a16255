//! Notification channel between the instrument stack and its observers.
//!
//! The original controller exposed assignable callback attributes
//! (`on_data_received`, `on_error`, ...). Here observers register through
//! [`EventHub::subscribe`] instead: the hub wraps a `tokio::sync::broadcast`
//! channel, so any number of observers (UI, logging, tests) can drain the
//! same stream without the device knowing about them, and an unset observer
//! is not a silent no-op.

use tokio::sync::broadcast;

use crate::device::{ConnectionState, StatusSnapshot};

/// Default broadcast capacity; slow observers lag rather than block the device.
const DEFAULT_CAPACITY: usize = 256;

/// Notifications emitted by the device facade and the sweep engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A command line was transmitted to the instrument.
    CommandSent(String),
    /// A raw reply line was received from the instrument.
    DataReceived(String),
    /// A failure was detected; one event per failure path.
    Error(String),
    /// The connection lifecycle state changed.
    ConnectionChanged(ConnectionState),
    /// A polled status snapshot, emitted by background monitoring.
    Status(StatusSnapshot),
    /// Counting was started or stopped.
    CountingChanged(bool),
    /// Sweep progress.
    Progress {
        /// Fractional completion in `0..=1`.
        fraction: f64,
        /// Human-readable status line.
        message: String,
    },
}

/// Clonable handle to the broadcast event channel.
///
/// # Example
///
/// ```
/// use sr400_daq::events::{Event, EventHub};
///
/// # tokio_test::block_on(async {
/// let hub = EventHub::default();
/// let mut rx = hub.subscribe();
/// hub.emit(Event::CountingChanged(true));
/// assert!(matches!(rx.recv().await, Ok(Event::CountingChanged(true))));
/// # })
/// ```
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<Event>,
}

impl EventHub {
    /// Create a hub with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Register a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event; absence of observers is not an error.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Log a failure and emit exactly one [`Event::Error`] for it.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{message}");
        self.emit(Event::Error(message));
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();

        hub.emit(Event::CountingChanged(true));
        match rx.recv().await {
            Ok(Event::CountingChanged(on)) => assert!(on),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_not_an_error() {
        let hub = EventHub::default();
        hub.emit(Event::Error("nobody listening".into()));
    }

    #[tokio::test]
    async fn multiple_observers_see_the_same_event() {
        let hub = EventHub::default();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.error("boom");

        assert!(matches!(a.recv().await, Ok(Event::Error(_))));
        assert!(matches!(b.recv().await, Ok(Event::Error(_))));
    }
}
