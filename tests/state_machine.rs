//! Property tests for the engine lifecycle.

mod common;

use archive_subscriber::{EngineEvent, SubscriptionParameters, SubscriptionState};
use common::Harness;
use proptest::prelude::*;

fn any_state() -> impl Strategy<Value = SubscriptionState> {
    prop::sample::select(SubscriptionState::ALL.to_vec())
}

/// Accepted transitions, rows `from` and columns `to`, both in the order
/// Initialized, Running, Paused, Busy, Repair, Error, Terminated.
const ACCEPTS: [[bool; 7]; 7] = {
    const O: bool = true;
    const X: bool = false;
    [
        [X, O, X, X, X, O, O], // Initialized
        [X, X, O, O, X, O, O], // Running
        [X, O, X, X, X, O, O], // Paused
        [X, O, X, X, O, O, O], // Busy
        [X, X, X, O, X, O, O], // Repair
        [X, X, X, X, X, X, O], // Error
        [X, X, X, X, X, X, X], // Terminated
    ]
};

fn index(state: SubscriptionState) -> usize {
    SubscriptionState::ALL
        .iter()
        .position(|s| *s == state)
        .unwrap()
}

fn accepts(from: SubscriptionState, to: SubscriptionState) -> bool {
    ACCEPTS[index(from)][index(to)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every accepted transition emits exactly one event; rejected ones
    /// leave the state alone and emit nothing.
    #[test]
    fn test_transitions_follow_table(targets in prop::collection::vec(any_state(), 1..40)) {
        let harness = Harness::new();
        let engine = harness
            .factory
            .build(SubscriptionParameters::notification("RAW"), None)
            .unwrap();
        let (_, events) = engine.subscribe_channel();

        let mut expected = SubscriptionState::Initialized;
        let mut accepted = Vec::new();
        for target in targets {
            let allowed = accepts(expected, target);
            let result = engine.transition(target);
            if allowed {
                accepted.push((expected, target));
                expected = target;
            }
            prop_assert_eq!(result, expected);
            prop_assert_eq!(engine.state(), expected);
        }

        let emitted: Vec<_> = events
            .try_iter()
            .map(|e| match e {
                EngineEvent::StateChanged { from, to, .. } => (from, to),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        prop_assert_eq!(emitted, accepted);
    }

    #[test]
    fn test_terminated_is_final(target in any_state()) {
        prop_assert!(!SubscriptionState::Terminated.can_transition_to(target));
        prop_assert!(!target.can_transition_to(SubscriptionState::Initialized));
    }
}

#[test]
fn test_every_pair_matches_table() {
    for from in SubscriptionState::ALL {
        for to in SubscriptionState::ALL {
            assert_eq!(from.can_transition_to(to), accepts(from, to), "{from} -> {to}");
        }
    }
}

#[test]
fn test_recovery_path_allowed() {
    use SubscriptionState::*;
    for (from, to) in [
        (Initialized, Running),
        (Running, Busy),
        (Busy, Repair),
        (Repair, Busy),
        (Busy, Running),
        (Running, Paused),
        (Paused, Running),
        (Repair, Error),
        (Error, Terminated),
    ] {
        assert!(from.can_transition_to(to), "{from} -> {to}");
    }
    for (from, to) in [(Paused, Busy), (Running, Repair), (Error, Running), (Busy, Busy)] {
        assert!(!from.can_transition_to(to), "{from} -> {to}");
    }
}
