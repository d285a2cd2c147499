//! Bounded-channel fan-out to manager listeners.

use super::types::{DropReason, ListenerConfig, ListenerHandle, ListenerId, ManagerEvent};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

struct Listener {
    config: ListenerConfig,
    sender: Sender<ManagerEvent>,
}

impl Listener {
    /// Returns false if the buffer is full or the receiver is gone.
    fn try_send(&self, event: ManagerEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn wants(&self, event: &ManagerEvent) -> bool {
        match event {
            ManagerEvent::Engine(_) => self.config.include_engine_events,
            _ => true,
        }
    }
}

/// Listener registry. Slow or disconnected listeners are dropped rather
/// than allowed to block an engine thread.
pub(crate) struct ListenerSet {
    listeners: RwLock<HashMap<ListenerId, Listener>>,
    next_id: AtomicU64,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, config: ListenerConfig) -> ListenerHandle {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));
        self.listeners.write().insert(id, Listener { config, sender });
        ListenerHandle { id, receiver }
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.drop_listener(id, DropReason::Unsubscribed);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Send `event` to every interested listener.
    pub fn broadcast(&self, event: &ManagerEvent) {
        let mut to_remove = Vec::new();
        {
            let listeners = self.listeners.read();
            for (id, listener) in listeners.iter() {
                if listener.wants(event) && !listener.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }
        for id in to_remove {
            debug!(listener = id.0, "dropping slow listener");
            self.drop_listener(id, DropReason::BufferOverflow);
        }
    }

    /// Drop every listener with `reason`.
    pub fn close_all(&self, reason: DropReason) {
        let drained: Vec<Listener> = self.listeners.write().drain().map(|(_, l)| l).collect();
        for listener in drained {
            // Best effort; a full buffer simply misses the notice.
            let _ = listener.sender.try_send(ManagerEvent::Dropped {
                reason: reason.clone(),
            });
        }
    }

    fn drop_listener(&self, id: ListenerId, reason: DropReason) {
        let removed = self.listeners.write().remove(&id);
        if let Some(listener) = removed {
            let _ = listener.sender.try_send(ManagerEvent::Dropped { reason });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn set_changed() -> ManagerEvent {
        ManagerEvent::SetChanged {
            added: vec![],
            removed: vec![],
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let set = ListenerSet::new();
        let handle = set.subscribe(ListenerConfig::default());
        assert_eq!(set.len(), 1);

        set.unsubscribe(handle.id);
        assert_eq!(set.len(), 0);
        assert!(matches!(
            handle.recv_timeout(Duration::from_millis(50)).unwrap(),
            ManagerEvent::Dropped {
                reason: DropReason::Unsubscribed
            }
        ));
    }

    #[test]
    fn test_drop_slow_listener() {
        let set = ListenerSet::new();
        let _handle = set.subscribe(ListenerConfig {
            buffer_size: 2,
            ..Default::default()
        });
        for _ in 0..10 {
            set.broadcast(&set_changed());
        }
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_engine_events_filtered() {
        let set = ListenerSet::new();
        let handle = set.subscribe(ListenerConfig {
            include_engine_events: false,
            ..Default::default()
        });
        set.broadcast(&ManagerEvent::Engine(crate::engine::EngineEvent::HistoryCleared { id: None }));
        assert!(handle.try_recv().is_err());
        set.broadcast(&set_changed());
        assert_eq!(handle.try_recv().unwrap(), set_changed());
    }
}
