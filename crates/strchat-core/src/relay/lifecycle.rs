//! Per-relay listener state machine.

use std::time::Duration;

/// How much a relay matters when its stream breaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayRole {
    /// Anchors, geo relays and fallbacks. Retried before giving up.
    Required,
    /// Discovered relays. Dropped on first failure.
    Opportunistic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Live,
    Degraded { attempt: u32 },
    Abandoned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    StreamClosed,
    ResubscribeOk,
    ResubscribeFailed,
}

/// Next state for `state` after `event`. `ceiling` is the number of
/// resubscribe attempts allowed before abandoning a required relay.
pub fn transition(state: LinkState, event: LinkEvent, role: RelayRole, ceiling: u32) -> LinkState {
    match (state, event) {
        (LinkState::Abandoned, _) => LinkState::Abandoned,
        (LinkState::Live, LinkEvent::StreamClosed) => match role {
            RelayRole::Opportunistic => LinkState::Abandoned,
            RelayRole::Required if ceiling == 0 => LinkState::Abandoned,
            RelayRole::Required => LinkState::Degraded { attempt: 1 },
        },
        (LinkState::Live, _) => LinkState::Live,
        (LinkState::Degraded { .. }, LinkEvent::ResubscribeOk) => LinkState::Live,
        (LinkState::Degraded { attempt }, LinkEvent::ResubscribeFailed | LinkEvent::StreamClosed) => {
            if attempt >= ceiling {
                LinkState::Abandoned
            } else {
                LinkState::Degraded {
                    attempt: attempt + 1,
                }
            }
        }
    }
}

/// Delay before resubscribe attempt `attempt` (1-based):
/// `min(base * 2^(attempt-1), max)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}
