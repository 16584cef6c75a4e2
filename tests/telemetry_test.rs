//! Integration tests for telemetry initialization and span helpers.

use replyq::model::WorkerState;
use replyq::telemetry::request;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = replyq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "replyq-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    if let Ok(guard) = replyq::telemetry::init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn request_span_records_outcome() {
    let span = request::start_request_span("c0ffee", "work");
    request::record_outcome(&span, "replied");
}

#[test]
fn worker_span_records_full_cycle() {
    use WorkerState::*;
    let span = request::start_worker_span("worker-0", "work");
    let cycle = [Idle, Consuming, Processing, Replying, Acking, Idle, Stopped];
    for pair in cycle.windows(2) {
        request::record_worker_state(&span, pair[0], pair[1]);
    }
}

#[test]
fn metric_instruments_are_usable_without_a_provider() {
    use replyq::telemetry::metrics;
    metrics::requests_published().add(1, &[]);
    metrics::replies_received().add(1, &[]);
    metrics::requests_timed_out().add(1, &[]);
    metrics::processing_duration_ms().record(1.5, &[]);
}
