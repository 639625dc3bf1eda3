//! Engine events and observers.
//!
//! Every state change the presentation layer may care about is published
//! once, both on a broadcast channel and to each registered [`Observer`].

use parking_lot::RwLock;
use std::sync::Arc;
use tidesync_protocol::{ConnectionPhase, Record, RecordId};
use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Slow subscribers that fall further
/// behind see `RecvError::Lagged`.
const EVENT_CAPACITY: usize = 256;

/// Something observable happened inside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A record was written.
    RecordChanged(Record),
    /// A record no longer exists.
    RecordRemoved(RecordId),
    /// The server refused an operation for good.
    Rejected {
        /// Record concerned.
        record_id: RecordId,
        /// HTTP status.
        status: u16,
        /// Server-provided reason.
        message: String,
        /// The payload that was refused.
        payload: Vec<u8>,
    },
    /// An optimistic change was undone in favour of the server.
    RolledBack {
        /// Record concerned.
        record_id: RecordId,
        /// The local payload that was discarded.
        discarded_payload: Vec<u8>,
    },
    /// A conflict is waiting for the application.
    ConflictUnresolved(RecordId),
    /// A body could not be encoded or decoded.
    SerializationFailed {
        /// Record concerned.
        record_id: RecordId,
        /// Error message.
        message: String,
    },
    /// The session cannot be refreshed; a new login is required.
    SessionExpired,
    /// The realtime channel changed phase.
    ConnectionPhase(ConnectionPhase),
    /// Data arrived on the realtime channel.
    Realtime(Vec<u8>),
}

/// A consumer of engine events.
pub trait Observer: Send + Sync {
    /// Called for every event, on the task that produced it. Must not block.
    fn on_event(&self, event: &EngineEvent);
}

/// Fan-out of engine events.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    observers: RwLock<Vec<Arc<dyn Observer>>>,
}

impl EventBus {
    /// Creates an event bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sender,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Publishes an event.
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(?event, "event");
        for observer in self.observers.read().iter() {
            observer.on_event(&event);
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Registers an observer.
    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.write().push(observer);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// An observer that keeps every event, for tests and tooling.
#[derive(Debug, Default)]
pub struct EventLog {
    events: parking_lot::Mutex<Vec<EngineEvent>>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the events seen so far.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Counts events matching a predicate.
    pub fn count(&self, predicate: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl Observer for EventLog {
    fn on_event(&self, event: &EngineEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observers_and_subscribers_both_see_events() {
        let bus = EventBus::new();
        let log = Arc::new(EventLog::new());
        bus.add_observer(log.clone());
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::SessionExpired);
        bus.publish(EngineEvent::RecordRemoved(RecordId::from("a")));

        assert_eq!(rx.recv().await.unwrap(), EngineEvent::SessionExpired);
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::RecordRemoved(RecordId::from("a"))
        );
        assert_eq!(log.events().len(), 2);
        assert_eq!(log.count(|e| matches!(e, EngineEvent::SessionExpired)), 1);
    }

    #[test]
    fn publish_without_subscribers() {
        EventBus::new().publish(EngineEvent::SessionExpired);
    }
}
