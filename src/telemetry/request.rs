//! Span helpers for the two sides of a request.
//!
//! Field names follow the OTel messaging conventions where one exists.

use crate::model::WorkerState;
use tracing::Span;

/// Start a span covering one caller request, publish to outcome.
///
/// `request.outcome` is declared empty and filled via [`record_outcome`].
pub fn start_request_span(correlation_id: &str, queue: &str) -> Span {
    tracing::info_span!(
        "request.send",
        "messaging.system" = "rabbitmq",
        "messaging.destination.name" = queue,
        "messaging.message.conversation_id" = correlation_id,
        "request.outcome" = tracing::field::Empty,
    )
}

/// Record how a request resolved ("replied", "timed_out", "error").
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("request.outcome", outcome);
}

/// Start a span for one worker's lifetime.
pub fn start_worker_span(worker_id: &str, queue: &str) -> Span {
    tracing::info_span!(
        "worker.run",
        "worker.id" = worker_id,
        "messaging.system" = "rabbitmq",
        "messaging.destination.name" = queue,
    )
}

/// Emit a `state_transition` event for the worker state machine.
pub fn record_worker_state(span: &Span, from: WorkerState, to: WorkerState) {
    debug_assert!(
        from.can_transition_to(to),
        "invalid worker transition {from} -> {to}"
    );
    span.in_scope(|| {
        tracing::debug!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
}
