//! Worker pool behaviour against the in-memory broker.

mod common;

use common::{FixedDelay, QUEUE, broker, spawn_pool, wait_until};
use futures::StreamExt;
use replyq::broker::memory::MemoryBroker;
use replyq::broker::{Broker, Channel, DIRECT_REPLY_TO, ReplyMode};
use replyq::correlator::ReplyCorrelator;
use replyq::error::Error;
use replyq::model::{CONTENT_TYPE_JSON, MessageProperties, Payload, ReplyEnvelope};
use replyq::worker::{DecodeFailurePolicy, EchoProcessor, PoolConfig, StopReason, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Publish `count` requests that expect no reply.
async fn enqueue(broker: &MemoryBroker, count: usize) {
    let channel = broker.open_channel().await.unwrap();
    for i in 0..count {
        let body = serde_json::to_vec(&Payload::new(format!("job-{i}"))).unwrap();
        let properties = MessageProperties {
            correlation_id: Some(format!("job-{i}")),
            ..MessageProperties::default()
        };
        channel.publish(QUEUE, &body, properties).await.unwrap();
    }
    channel.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Concurrency and acknowledgment
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_workers_process_at_most_two_messages_at_once() {
    let broker = broker();
    let processor = Arc::new(FixedDelay::new(Duration::from_millis(200)));
    enqueue(&broker, 3).await;

    let pool = spawn_pool(&broker, Arc::clone(&processor), PoolConfig::new(QUEUE), 2);
    wait_until(|| broker.queue_stats(QUEUE).unwrap().acked == 3).await;
    let report = pool.stop().await;

    assert_eq!(processor.max_in_flight(), 2);
    let spans = processor.spans();
    assert_eq!(spans.len(), 3);
    let first_finish = spans[0].1.min(spans[1].1);
    assert!(
        spans[2].0 >= first_finish,
        "third message must start only after one of the first two finished"
    );
    assert_eq!(report.processed(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_message_is_acked_exactly_once() {
    let broker = broker();
    enqueue(&broker, 25).await;

    let pool = spawn_pool(
        &broker,
        Arc::new(EchoProcessor::new(Duration::from_millis(5))),
        PoolConfig::new(QUEUE).seed(3),
        3,
    );
    wait_until(|| broker.queue_stats(QUEUE).unwrap().acked == 25).await;
    let report = pool.stop().await;

    let stats = broker.queue_stats(QUEUE).unwrap();
    assert_eq!((stats.ready, stats.acked, stats.rejected), (0, 25, 0));
    assert_eq!(report.acked(), 25);
    assert_eq!(report.workers.len(), 3);
    assert!(
        report
            .workers
            .iter()
            .all(|w| w.stop_reason == StopReason::Cancelled)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_reply_publish_still_acks() {
    let broker = broker();
    broker.fail_reply_publishes(true);
    let pool = spawn_pool(
        &broker,
        Arc::new(EchoProcessor::new(Duration::ZERO)),
        PoolConfig::new(QUEUE),
        1,
    );

    let correlator = ReplyCorrelator::new(
        Arc::clone(&broker),
        QUEUE,
        ReplyMode::Direct,
        CancellationToken::new(),
    );
    let outcome = correlator
        .send(&Payload::new("lost"), Duration::from_millis(200))
        .await
        .unwrap();
    assert!(outcome.reply().is_none(), "caller times out instead");

    wait_until(|| broker.queue_stats(QUEUE).unwrap().acked == 1).await;
    let report = pool.stop().await;
    assert_eq!(report.workers[0].replies_failed, 1);
    assert_eq!(report.workers[0].acked, 1);
    assert_eq!(broker.queue_stats(QUEUE).unwrap().ready, 0);
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_lets_the_current_message_finish() {
    let broker = broker();
    let processor = Arc::new(FixedDelay::new(Duration::from_millis(200)));
    enqueue(&broker, 2).await;

    let pool = spawn_pool(&broker, Arc::clone(&processor), PoolConfig::new(QUEUE), 1);
    wait_until(|| processor.in_flight() == 1).await;
    let report = pool.stop().await;

    assert_eq!(report.processed(), 1);
    assert_eq!(report.acked(), 1);
    let stats = broker.queue_stats(QUEUE).unwrap();
    assert_eq!((stats.ready, stats.acked), (1, 1), "second message untouched");
    assert_eq!(broker.open_channels(), 0, "worker channels closed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_pool_stops_promptly() {
    let broker = broker();
    let pool = spawn_pool(
        &broker,
        Arc::new(EchoProcessor::default()),
        PoolConfig::new(QUEUE),
        4,
    );
    wait_until(|| broker.open_channels() == 8).await;

    let report = tokio::time::timeout(Duration::from_secs(1), pool.stop())
        .await
        .expect("idle workers must stop at once");
    assert_eq!(report.processed(), 0);
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broker_close_ends_workers() {
    let broker = broker();
    let pool = spawn_pool(
        &broker,
        Arc::new(EchoProcessor::default()),
        PoolConfig::new(QUEUE),
        2,
    );
    wait_until(|| broker.open_channels() == 4).await;
    // Let the workers get past queue declaration and start consuming.
    tokio::time::sleep(Duration::from_millis(100)).await;

    broker.close().await.unwrap();
    let report = pool.handle.await.unwrap().unwrap();
    assert!(
        report
            .workers
            .iter()
            .all(|w| w.stop_reason == StopReason::StreamClosed)
    );
}

#[tokio::test]
async fn worker_setup_failure_is_returned() {
    let broker = broker();
    broker.refuse_channels(true);
    let pool = WorkerPool::new(
        Arc::clone(&broker),
        Arc::new(EchoProcessor::default()),
        PoolConfig::new(QUEUE),
    );

    let err = pool.run(3, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Channel(_)));
}

#[tokio::test]
async fn empty_pool_is_a_config_error() {
    let broker = broker();
    let pool = WorkerPool::new(
        broker,
        Arc::new(EchoProcessor::default()),
        PoolConfig::new(QUEUE),
    );
    let err = pool.run(0, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

// ---------------------------------------------------------------------------
// Undecodable messages
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undecodable_message_is_processed_as_empty_by_default() {
    let broker = broker();
    let pool = spawn_pool(
        &broker,
        Arc::new(EchoProcessor::new(Duration::ZERO)),
        PoolConfig::new(QUEUE),
        1,
    );

    let caller = broker.open_channel().await.unwrap();
    let mut subscription = caller.consume_replies(ReplyMode::Direct).await.unwrap();
    caller
        .publish(
            QUEUE,
            b"\x00garbage",
            MessageProperties {
                correlation_id: Some("bad-1".to_string()),
                reply_to: Some(DIRECT_REPLY_TO.to_string()),
                content_type: Some(CONTENT_TYPE_JSON.to_string()),
            },
        )
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(5), subscription.replies.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.properties.correlation_id.as_deref(), Some("bad-1"));
    assert_eq!(
        delivery.properties.content_type.as_deref(),
        Some(CONTENT_TYPE_JSON)
    );
    let reply: ReplyEnvelope = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(reply.payload, Payload::default());
    assert_eq!(reply.correlation_id.as_str(), "bad-1");

    wait_until(|| broker.queue_stats(QUEUE).unwrap().acked == 1).await;
    caller.close().await.unwrap();
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undecodable_message_is_rejected_under_reject_policy() {
    let broker = broker();
    let pool = spawn_pool(
        &broker,
        Arc::new(EchoProcessor::new(Duration::ZERO)),
        PoolConfig::new(QUEUE).decode_failure_policy(DecodeFailurePolicy::Reject),
        1,
    );

    let channel = broker.open_channel().await.unwrap();
    channel
        .publish(QUEUE, b"not json", MessageProperties::default())
        .await
        .unwrap();
    channel.close().await.unwrap();
    enqueue(&broker, 1).await;

    wait_until(|| {
        let stats = broker.queue_stats(QUEUE).unwrap();
        stats.rejected == 1 && stats.acked == 1
    })
    .await;
    let report = pool.stop().await;

    assert_eq!(report.workers[0].rejected, 1);
    assert_eq!(report.processed(), 1);
    assert_eq!(broker.queue_stats(QUEUE).unwrap().ready, 0);
}
