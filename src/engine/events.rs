//! Typed engine notifications and the observer bus delivering them.

use super::state::SubscriptionState;
use crate::types::{DeliveredFile, EngineId, Timestamp};
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Notifications emitted by an engine.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// An accepted state transition.
    StateChanged {
        id: Option<EngineId>,
        from: SubscriptionState,
        to: SubscriptionState,
    },
    /// A file was appended to the history.
    HistoryAppended {
        id: Option<EngineId>,
        file: DeliveredFile,
    },
    /// The history was cleared.
    HistoryCleared { id: Option<EngineId> },
    /// The session client was replaced (or dropped while reconnecting).
    ClientChanged { id: Option<EngineId>, connected: bool },
    /// A pull query window was fully processed.
    QueryCompleted { id: Option<EngineId>, at: Timestamp },
}

impl EngineEvent {
    pub fn engine_id(&self) -> Option<EngineId> {
        match self {
            EngineEvent::StateChanged { id, .. }
            | EngineEvent::HistoryAppended { id, .. }
            | EngineEvent::HistoryCleared { id }
            | EngineEvent::ClientChanged { id, .. }
            | EngineEvent::QueryCompleted { id, .. } => *id,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

type Observer<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Synchronous observer list.
///
/// Observers run on the emitting thread in registration order, outside the
/// bus lock, so an observer may subscribe or unsubscribe re-entrantly. They
/// must not block.
pub struct EventBus<E> {
    observers: Mutex<Vec<(ObserverId, Observer<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.observers.lock().push((id, Arc::new(observer)));
        id
    }

    /// Subscribe through a channel; events are queued for the receiver.
    ///
    /// The observer removes itself once the receiver is dropped.
    pub fn subscribe_channel(self: &Arc<Self>) -> (ObserverId, Receiver<E>) {
        let (sender, receiver) = unbounded();
        let bus = Arc::downgrade(self);
        let slot: Arc<Mutex<Option<ObserverId>>> = Arc::new(Mutex::new(None));
        let own_id = Arc::clone(&slot);
        let id = self.subscribe(move |event: &E| {
            if sender.send(event.clone()).is_err() {
                if let (Some(bus), Some(id)) = (bus.upgrade(), *own_id.lock()) {
                    bus.unsubscribe(id);
                }
            }
        });
        *slot.lock() = Some(id);
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn emit(&self, event: &E) {
        let observers: Vec<Observer<E>> = self
            .observers
            .lock()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            observer(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_observers_in_registration_order() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |v: &u32| seen.lock().push(format!("{tag}{v}")));
        }
        bus.emit(&1);
        assert_eq!(*seen.lock(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let id = {
            let count = Arc::clone(&count);
            bus.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        bus.emit(&1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_unsubscribe() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let slot = Arc::new(Mutex::new(None));
        let id = {
            let weak = Arc::downgrade(&bus);
            let slot = Arc::clone(&slot);
            bus.subscribe(move |_| {
                if let (Some(bus), Some(id)) = (weak.upgrade(), *slot.lock()) {
                    bus.unsubscribe(id);
                }
            })
        };
        *slot.lock() = Some(id);
        bus.emit(&1);
        assert_eq!(bus.observer_count(), 0);
    }

    #[test]
    fn test_channel_subscription() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let (_, rx) = bus.subscribe_channel();
        bus.emit(&7);
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)).unwrap(), 7);

        drop(rx);
        bus.emit(&8);
        assert_eq!(bus.observer_count(), 0);
    }
}
