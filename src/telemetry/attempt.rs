//! Attempt span helpers.
//!
//! One span per attempt; state writes made by the state machine are
//! recorded as events inside it.

use tracing::Span;

use crate::model::{ArgKey, State};

/// Start a span for one attempt.
///
/// The `attempt.state` field is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_attempt_span(key: &ArgKey) -> Span {
    tracing::info_span!(
        "attempt",
        "attempt.key" = %key,
        "attempt.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the attempt's span.
///
/// Transitions outside the normal lifecycle are logged at `warn`.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.record("attempt.state", to.as_str());
    span.in_scope(|| {
        if from.can_transition_to(to) {
            tracing::debug!(from = %from, to = %to, "state_transition");
        } else {
            tracing::warn!(from = %from, to = %to, "unexpected state_transition");
        }
    });
}
