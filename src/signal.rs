//! Cooperative pause/terminate signalling.
//!
//! Engines never get preempted. They check their [`ControlSignal`] at the top
//! of every loop iteration and wait on it instead of sleeping, so a pause,
//! resume, terminate request or new push item wakes them immediately.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Flags {
    paused: bool,
    terminate: bool,
    /// Bumped by `wake`; lets waiters notice a nudge that happened while
    /// they were not yet waiting.
    generation: u64,
}

/// Why a wait on a [`ControlSignal`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    /// The full duration elapsed.
    Elapsed,
    /// Termination was requested.
    Terminated,
    /// The pause flag was raised.
    Paused,
    /// Someone called [`ControlSignal::wake`] (new work, resumed, ...).
    Nudged,
}

/// Condition-variable backed control flags for one engine.
#[derive(Debug, Default)]
pub struct ControlSignal {
    flags: Mutex<Flags>,
    cond: Condvar,
}

impl ControlSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination; wakes every waiter.
    pub fn terminate(&self) {
        let mut flags = self.flags.lock();
        flags.terminate = true;
        flags.generation += 1;
        self.cond.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.flags.lock().terminate
    }

    /// Raise or lower the pause flag; wakes every waiter.
    pub fn set_paused(&self, paused: bool) {
        let mut flags = self.flags.lock();
        if flags.paused != paused {
            flags.paused = paused;
            flags.generation += 1;
            self.cond.notify_all();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.flags.lock().paused
    }

    /// Wake waiters without changing any flag.
    pub fn wake(&self) {
        let mut flags = self.flags.lock();
        flags.generation += 1;
        self.cond.notify_all();
    }

    /// Sleep up to `timeout`, returning early on terminate, pause or wake.
    pub fn wait(&self, timeout: Duration) -> Wake {
        let deadline = Instant::now() + timeout;
        let mut flags = self.flags.lock();
        let start_generation = flags.generation;
        loop {
            if flags.terminate {
                return Wake::Terminated;
            }
            if flags.paused {
                return Wake::Paused;
            }
            if flags.generation != start_generation {
                return Wake::Nudged;
            }
            if self.cond.wait_until(&mut flags, deadline).timed_out() {
                return if flags.terminate {
                    Wake::Terminated
                } else {
                    Wake::Elapsed
                };
            }
        }
    }

    /// Sleep up to `timeout`, returning early only on terminate.
    ///
    /// Used where pausing must not cut a wait short (reconnect backoff).
    pub fn wait_uninterrupted_by_pause(&self, timeout: Duration) -> Wake {
        let deadline = Instant::now() + timeout;
        let mut flags = self.flags.lock();
        while !flags.terminate {
            if self.cond.wait_until(&mut flags, deadline).timed_out() {
                break;
            }
        }
        if flags.terminate {
            Wake::Terminated
        } else {
            Wake::Elapsed
        }
    }

    /// Block while paused. Returns false if termination was requested.
    pub fn wait_while_paused(&self) -> bool {
        let mut flags = self.flags.lock();
        while flags.paused && !flags.terminate {
            self.cond.wait(&mut flags);
        }
        !flags.terminate
    }
}
