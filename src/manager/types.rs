//! Manager configuration and listener types.

use crate::engine::EngineEvent;
use crate::types::EngineId;

/// Manager configuration.
#[derive(Clone, Debug, Default)]
pub struct ManagerConfig {
    /// Allow two live engines with the same task type, source and target.
    /// Default: false
    pub allow_duplicates: bool,
}

/// Listener configuration.
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Max buffered events before the listener is dropped.
    /// Default: 1000
    pub buffer_size: usize,

    /// Forward every managed engine's events, not just set changes.
    /// Default: true
    pub include_engine_events: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            include_engine_events: true,
        }
    }
}

/// Events delivered to manager listeners.
#[derive(Clone, Debug, PartialEq)]
pub enum ManagerEvent {
    /// Engines joined or left the managed set.
    SetChanged {
        added: Vec<EngineId>,
        removed: Vec<EngineId>,
    },

    /// An event emitted by a managed engine.
    Engine(EngineEvent),

    /// The listener was dropped; nothing follows.
    Dropped { reason: DropReason },
}

/// Why a listener was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The manager was terminated.
    ManagerTerminated,
}

/// Unique identifier for a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Handle to receive manager events.
pub struct ListenerHandle {
    pub id: ListenerId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<ManagerEvent>,
}

impl ListenerHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<ManagerEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<ManagerEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<ManagerEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
