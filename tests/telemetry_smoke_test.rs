//! Smoke tests for the full observability stack.
//!
//! These tests require an OTLP collector on localhost:4317 feeding Tempo
//! (traces, :3200) and Prometheus (metrics, :9090).
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use replyq::broker::ReplyMode;
use replyq::broker::memory::MemoryBroker;
use replyq::correlator::ReplyCorrelator;
use replyq::model::Payload;
use replyq::worker::{EchoProcessor, PoolConfig, WorkerPool};
use tokio_util::sync::CancellationToken;

static TELEMETRY: OnceLock<replyq::telemetry::TelemetryGuard> = OnceLock::new();

fn ensure_telemetry() -> &'static replyq::telemetry::TelemetryGuard {
    TELEMETRY.get_or_init(|| {
        replyq::telemetry::init_telemetry(replyq::telemetry::TelemetryConfig {
            endpoint: Some("http://localhost:4317".to_string()),
            service_name: "replyq-smoke-test".to_string(),
            log_level: "debug".to_string(),
        })
        .expect("failed to init telemetry")
    })
}

/// Force-flush all providers and give backends time to ingest.
async fn flush_and_wait(guard: &replyq::telemetry::TelemetryGuard) {
    guard.force_flush();
    tokio::time::sleep(Duration::from_secs(8)).await;
}

/// One request-reply exchange over the in-memory broker, which emits spans,
/// counters, the processing histogram and logs.
async fn exchange() {
    let broker = MemoryBroker::new();
    broker.declare_queue("smoke");
    let broker = Arc::new(broker);

    let pool = WorkerPool::new(
        Arc::clone(&broker),
        Arc::new(EchoProcessor::new(Duration::from_millis(20))),
        PoolConfig::new("smoke"),
    );
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { pool.run(1, token).await });

    let correlator =
        ReplyCorrelator::new(Arc::clone(&broker), "smoke", ReplyMode::Direct, CancellationToken::new());
    let outcome = correlator
        .send(&Payload::new("smoke"), Duration::from_secs(5))
        .await
        .expect("exchange failed");
    assert!(outcome.reply().is_some());

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[test]
#[ignore]
fn smoke_traces() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        exchange().await;
        flush_and_wait(guard).await;

        let client = reqwest::Client::new();
        let resp = client
            .get("http://localhost:3200/api/search")
            .query(&[("tags", "service.name=replyq-smoke-test"), ("limit", "5")])
            .send()
            .await
            .expect("failed to query Tempo");
        assert!(
            resp.status().is_success(),
            "Tempo query failed: {}",
            resp.status()
        );

        let body: serde_json::Value = resp.json().await.expect("failed to parse Tempo response");
        let traces = body["traces"].as_array();
        assert!(
            traces.is_some_and(|t| !t.is_empty()),
            "expected traces in Tempo, got: {body}"
        );
        println!("Tempo: found {} trace(s)", traces.unwrap().len());
    });
}

#[test]
#[ignore]
fn smoke_metrics() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        exchange().await;
        flush_and_wait(guard).await;

        let client = reqwest::Client::new();
        let resp = client
            .get("http://localhost:9090/api/v1/query")
            .query(&[("query", "replyq_requests_published_total")])
            .send()
            .await
            .expect("failed to query Prometheus");
        assert!(
            resp.status().is_success(),
            "Prometheus query failed: {}",
            resp.status()
        );

        let body: serde_json::Value = resp
            .json()
            .await
            .expect("failed to parse Prometheus response");
        let results = body["data"]["result"].as_array();
        assert!(
            results.is_some_and(|r| !r.is_empty()),
            "expected metric results in Prometheus, got: {body}"
        );
    });
}
