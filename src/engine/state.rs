//! Engine lifecycle states and the transition table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a subscription engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Initialized,
    Running,
    Paused,
    /// Processing a query window or push batch.
    Busy,
    /// Rebuilding a lost connection.
    Repair,
    Error,
    Terminated,
}

impl SubscriptionState {
    pub const ALL: [SubscriptionState; 7] = [
        SubscriptionState::Initialized,
        SubscriptionState::Running,
        SubscriptionState::Paused,
        SubscriptionState::Busy,
        SubscriptionState::Repair,
        SubscriptionState::Error,
        SubscriptionState::Terminated,
    ];

    pub fn is_terminal(self) -> bool {
        self == SubscriptionState::Terminated
    }

    /// Whether `self -> target` is an accepted transition.
    ///
    /// Running is entered from Initialized, Paused or Busy; Paused only from
    /// Running; Busy from Running or Repair; Repair only from Busy. Error
    /// and Terminated are accepted from anywhere else. Nothing leaves
    /// Terminated, Initialized is never re-entered and self-transitions
    /// are rejected.
    ///
    /// This is narrower than "any other target is accepted": a
    /// self-transition such as `Error -> Error` is refused and emits nothing.
    pub fn can_transition_to(self, target: SubscriptionState) -> bool {
        use SubscriptionState::*;

        if self == Terminated || target == Initialized || self == target {
            return false;
        }
        match target {
            Running => matches!(self, Initialized | Paused | Busy),
            Paused => self == Running,
            Busy => matches!(self, Running | Repair),
            Repair => self == Busy,
            Error | Terminated => true,
            Initialized => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionState::Initialized => "initialized",
            SubscriptionState::Running => "running",
            SubscriptionState::Paused => "paused",
            SubscriptionState::Busy => "busy",
            SubscriptionState::Repair => "repair",
            SubscriptionState::Error => "error",
            SubscriptionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
