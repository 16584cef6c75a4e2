//! Metric instrument factories for replyq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op, so these are
//! always safe to call.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("replyq")
}

/// Counter: requests published by callers.
/// Labels: `queue`.
pub fn requests_published() -> Counter<u64> {
    meter()
        .u64_counter("replyq.requests.published")
        .with_description("Number of requests published by callers")
        .build()
}

/// Counter: replies matched to their pending request.
pub fn replies_received() -> Counter<u64> {
    meter()
        .u64_counter("replyq.replies.received")
        .with_description("Number of correlated replies received")
        .build()
}

/// Counter: caller deadlines that fired before a reply.
pub fn requests_timed_out() -> Counter<u64> {
    meter()
        .u64_counter("replyq.requests.timed_out")
        .with_description("Number of requests whose deadline elapsed")
        .build()
}

/// Counter: replies whose correlation id did not match the pending request.
pub fn replies_mismatched() -> Counter<u64> {
    meter()
        .u64_counter("replyq.replies.mismatched")
        .with_description("Replies discarded for a correlation id mismatch")
        .build()
}

/// Counter: messages taken off the work queue and acknowledged.
/// Labels: `worker`.
pub fn messages_processed() -> Counter<u64> {
    meter()
        .u64_counter("replyq.messages.processed")
        .with_description("Number of work queue messages processed")
        .build()
}

/// Counter: replies a worker failed to publish.
pub fn reply_publish_failures() -> Counter<u64> {
    meter()
        .u64_counter("replyq.replies.publish_failed")
        .with_description("Replies that could not be published")
        .build()
}

/// Counter: queued messages whose body failed to decode.
/// Labels: `policy`.
pub fn decode_failures() -> Counter<u64> {
    meter()
        .u64_counter("replyq.messages.decode_failed")
        .with_description("Work queue messages with an undecodable body")
        .build()
}

/// Histogram: per-message processing time in milliseconds.
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("replyq.processing.duration_ms")
        .with_description("Time spent processing one message")
        .with_unit("ms")
        .build()
}
