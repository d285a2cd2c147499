//! Push-mode plumbing: the notifier contract, the bounded event queue and
//! the acknowledged-item cache.

use crate::client::SharedClient;
use crate::error::Result;
use crate::params::SubscriptionParameters;
use crate::signal::ControlSignal;
use crate::types::{FileResult, Timestamp};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::warn;

/// Default capacity of the push queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Default number of acknowledged names remembered.
pub const DEFAULT_ACK_CAPACITY: usize = 4096;

/// Long-lived source of file-available events.
///
/// `run` blocks, offering events to the queue until `close` is called or
/// the notifier fails. `is_alive` must hold from creation until `run`
/// returns; a dead notifier is replaced by a fresh one from its factory.
pub trait PushNotifier: Send + Sync {
    fn run(&self, queue: PushQueue);

    fn is_alive(&self) -> bool;

    fn close(&self);
}

/// Creates notifiers for push-mode engines.
pub trait NotifierFactory: Send + Sync {
    fn create(
        &self,
        params: &SubscriptionParameters,
        client: Option<SharedClient>,
    ) -> Result<Arc<dyn PushNotifier>>;
}

/// One queued event.
#[derive(Clone, Debug, PartialEq)]
pub struct PushEvent {
    /// Queue sequence number, unique per queue.
    pub seq: u64,
    pub file: FileResult,
    pub received: Timestamp,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<PushEvent>,
    next_seq: u64,
    dropped: u64,
}

struct QueueShared {
    state: Mutex<QueueState>,
    capacity: usize,
    signal: Option<Arc<ControlSignal>>,
}

/// Bounded FIFO between a notifier and its engine.
///
/// The engine takes a snapshot with [`PushQueue::advance`]; anything offered
/// afterwards waits for the next advance. Items stay queued until
/// [`PushQueue::commit`] removes them, so an uncommitted item is seen again
/// by the next advance.
#[derive(Clone)]
pub struct PushQueue {
    shared: Arc<QueueShared>,
}

impl PushQueue {
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// A queue that nudges `signal` whenever an event arrives.
    pub fn with_signal(capacity: usize, signal: Arc<ControlSignal>) -> Self {
        Self::build(capacity, Some(signal))
    }

    fn build(capacity: usize, signal: Option<Arc<ControlSignal>>) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                capacity: capacity.max(1),
                signal,
            }),
        }
    }

    /// Enqueue a file-available event. Returns false (and drops the event)
    /// when the queue is full.
    pub fn offer(&self, file: FileResult) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.items.len() >= self.shared.capacity {
                state.dropped += 1;
                warn!(file = %file.name, capacity = self.shared.capacity, "push queue full, event dropped");
                return false;
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            state.items.push_back(PushEvent {
                seq,
                file,
                received: Timestamp::now(),
            });
        }
        if let Some(signal) = &self.shared.signal {
            signal.wake();
        }
        true
    }

    /// Snapshot every queued event as the next working set.
    pub fn advance(&self) -> Vec<PushEvent> {
        self.shared.state.lock().items.iter().cloned().collect()
    }

    /// Remove a delivered event. Returns false if it was not queued.
    pub fn commit(&self, seq: u64) -> bool {
        let mut state = self.shared.state.lock();
        match state.items.iter().position(|e| e.seq == seq) {
            Some(pos) => {
                state.items.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Events rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }
}

/// Remembers recently acknowledged file names so a notifier announcing the
/// same file twice does not cause a second delivery.
pub struct AckCache {
    names: Mutex<LruCache<String, Timestamp>>,
}

impl AckCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            names: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn acknowledge(&self, name: &str) {
        self.names.lock().put(name.to_string(), Timestamp::now());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
