//! Shared reconnection throttle.

use crate::signal::{ControlSignal, Wake};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Throttle configuration.
#[derive(Clone, Debug)]
pub struct ThrottleConfig {
    /// Delay after the first failure.
    /// Default: 1s
    pub base_delay: Duration,

    /// Upper bound on the delay.
    /// Default: 5 minutes
    pub max_delay: Duration,

    /// Growth factor per consecutive failure.
    /// Default: 2
    pub multiplier: u32,

    /// Waits at least this long are reported to stall reporters.
    /// Default: 60s
    pub stall_threshold: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2,
            stall_threshold: Duration::from_secs(60),
        }
    }
}

/// Sink told about long reconnect stalls (report buffers, operators).
pub trait StallReporter: Send + Sync {
    fn on_stall(&self, endpoint: &str, wait: Duration, consecutive_failures: u32);
}

/// Outcome of [`ReconnectThrottle::await_permit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permit {
    Granted,
    /// The caller's signal asked for termination while waiting.
    Interrupted,
    /// The caller's deadline passes before the next allowed attempt.
    DeadlineReached,
}

#[derive(Debug)]
struct ThrottleState {
    consecutive_failures: u32,
    next_allowed: Instant,
}

/// Rate limiter for connection attempts against one endpoint.
///
/// Shared via `Arc` between every engine that talks to the same endpoint;
/// while failures persist, each granted attempt reserves the next slot so
/// concurrent engines take turns instead of stampeding.
pub struct ReconnectThrottle {
    endpoint: String,
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
    reporters: RwLock<Vec<Arc<dyn StallReporter>>>,
}

impl ReconnectThrottle {
    pub fn new(endpoint: impl Into<String>, config: ThrottleConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            state: Mutex::new(ThrottleState {
                consecutive_failures: 0,
                next_allowed: Instant::now(),
            }),
            reporters: RwLock::new(Vec::new()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn add_reporter(&self, reporter: Arc<dyn StallReporter>) {
        self.reporters.write().push(reporter);
    }

    /// Detach a reporter added with [`ReconnectThrottle::add_reporter`].
    pub fn remove_reporter(&self, reporter: &Arc<dyn StallReporter>) -> bool {
        let target = Arc::as_ptr(reporter) as *const ();
        let mut reporters = self.reporters.write();
        let before = reporters.len();
        reporters.retain(|r| Arc::as_ptr(r) as *const () != target);
        reporters.len() != before
    }

    pub fn reporter_count(&self) -> usize {
        self.reporters.read().len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Delay applied after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = self.config.multiplier.max(1).saturating_pow(failures - 1);
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    /// Block until an attempt is permitted.
    pub fn await_permit(&self, signal: Option<&ControlSignal>, deadline: Option<Instant>) -> Permit {
        let mut reported = false;
        loop {
            let (wait, failures) = {
                let mut state = self.state.lock();
                let now = Instant::now();
                if now >= state.next_allowed {
                    if state.consecutive_failures > 0 {
                        state.next_allowed = now + self.delay_for(state.consecutive_failures);
                    }
                    return Permit::Granted;
                }
                (state.next_allowed - now, state.consecutive_failures)
            };

            if let Some(deadline) = deadline {
                if Instant::now() + wait > deadline {
                    return Permit::DeadlineReached;
                }
            }

            if !reported && wait >= self.config.stall_threshold {
                reported = true;
                self.report_stall(wait, failures);
            }

            debug!(endpoint = %self.endpoint, ?wait, failures, "waiting for reconnect permit");
            match signal {
                Some(signal) => {
                    if signal.wait_uninterrupted_by_pause(wait) == Wake::Terminated {
                        return Permit::Interrupted;
                    }
                }
                None => std::thread::sleep(wait),
            }
        }
    }

    /// Reset the backoff after a successful connection.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.next_allowed = Instant::now();
    }

    /// Push the next allowed attempt out after a failed connection.
    pub fn record_failure(&self) -> Duration {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let delay = self.delay_for(state.consecutive_failures);
        let candidate = Instant::now() + delay;
        if candidate > state.next_allowed {
            state.next_allowed = candidate;
        }
        delay
    }

    fn report_stall(&self, wait: Duration, failures: u32) {
        warn!(endpoint = %self.endpoint, ?wait, failures, "reconnect stalled");
        let reporters = self.reporters.read().clone();
        for reporter in reporters {
            reporter.on_stall(&self.endpoint, wait, failures);
        }
    }
}
