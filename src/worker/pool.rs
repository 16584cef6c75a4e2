//! Worker pool: N workers, each with its own channels, draining one queue.
//!
//! Every worker owns a consumption channel (prefetch 1) and a publication
//! channel. Nothing mutable is shared between workers. Cancellation is only
//! observed between messages: a message that has been received is always
//! processed, replied to and acknowledged before the worker stops.

use crate::broker::{Broker, Channel, Delivery, DeliveryStream};
use crate::error::{Error, Result};
use crate::model::{CorrelationId, MessageProperties, Payload, ReplyEnvelope, WorkerState};
use crate::telemetry::metrics;
use crate::telemetry::request::{record_worker_state, start_worker_span};
use futures::StreamExt;
use opentelemetry::KeyValue;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::processor::Processor;

/// What a worker does with a queued message whose body is not a valid request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeFailurePolicy {
    /// Process it as an empty payload and reply as usual.
    #[default]
    ProcessEmpty,
    /// Reject without requeue, leaving it to the broker's dead-letter policy.
    Reject,
}

impl DecodeFailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessEmpty => "process-empty",
            Self::Reject => "reject",
        }
    }
}

impl FromStr for DecodeFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "process-empty" => Ok(Self::ProcessEmpty),
            "reject" => Ok(Self::Reject),
            other => Err(format!(
                "unknown decode failure policy {other:?} (expected process-empty|reject)"
            )),
        }
    }
}

/// Configuration shared by every worker in a pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Durable work queue (also the routing key requests are published with).
    pub queue: String,
    /// Unacknowledged deliveries per worker.
    pub prefetch: u16,
    pub decode_failure_policy: DecodeFailurePolicy,
    /// Seed for the per-worker generators; `None` seeds from OS entropy.
    pub seed: Option<u64>,
    /// Prefix of the `source` field in replies.
    pub source: String,
}

impl PoolConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: 1,
            decode_failure_policy: DecodeFailurePolicy::default(),
            seed: None,
            source: "replyq".to_string(),
        }
    }

    pub fn decode_failure_policy(mut self, policy: DecodeFailurePolicy) -> Self {
        self.decode_failure_policy = policy;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Why a worker left its loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    /// The broker ended the consumer (e.g. the connection closed).
    StreamClosed,
    StreamError(String),
}

/// Counters for one worker, returned when it stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: String,
    /// Messages taken off the queue and run through the processor.
    pub processed: u64,
    /// Messages acknowledged.
    pub acked: u64,
    /// Messages rejected under [`DecodeFailurePolicy::Reject`].
    pub rejected: u64,
    pub replies_failed: u64,
    pub stop_reason: StopReason,
}

impl WorkerReport {
    fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            processed: 0,
            acked: 0,
            rejected: 0,
            replies_failed: 0,
            stop_reason: StopReason::Cancelled,
        }
    }
}

/// Per-worker reports, ordered by worker id.
#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    pub workers: Vec<WorkerReport>,
}

impl PoolReport {
    pub fn processed(&self) -> u64 {
        self.workers.iter().map(|w| w.processed).sum()
    }

    pub fn acked(&self) -> u64 {
        self.workers.iter().map(|w| w.acked).sum()
    }
}

/// A fixed-size pool of queue workers.
pub struct WorkerPool<B: Broker, P: Processor> {
    broker: Arc<B>,
    processor: Arc<P>,
    config: PoolConfig,
}

impl<B: Broker, P: Processor> Clone for WorkerPool<B, P> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            processor: Arc::clone(&self.processor),
            config: self.config.clone(),
        }
    }
}

impl<B: Broker, P: Processor> WorkerPool<B, P> {
    pub fn new(broker: Arc<B>, processor: Arc<P>, config: PoolConfig) -> Self {
        Self {
            broker,
            processor,
            config,
        }
    }

    /// Run `pool_size` workers until `cancel` fires and every worker has
    /// finished its current message.
    ///
    /// If a worker cannot open its channels, the remaining workers are
    /// cancelled and joined, and that error is returned.
    pub async fn run(&self, pool_size: usize, cancel: CancellationToken) -> Result<PoolReport> {
        if pool_size == 0 {
            return Err(Error::Config("worker pool size must be at least 1".to_string()));
        }

        let stop = cancel.child_token();
        let mut workers = JoinSet::new();
        for index in 0..pool_size {
            let worker = Worker {
                id: format!("worker-{index}"),
                broker: Arc::clone(&self.broker),
                processor: Arc::clone(&self.processor),
                config: self.config.clone(),
                rng: self.rng_for(index),
            };
            workers.spawn(worker.run(stop.clone()));
        }
        info!(pool_size, queue = %self.config.queue, "worker pool started");

        let mut reports = Vec::with_capacity(pool_size);
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined
                .map_err(|e| Error::Other(format!("worker task failed: {e}")))
                .and_then(|result| result);
            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!("worker stopped with error: {e}");
                    stop.cancel();
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        reports.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        let report = PoolReport { workers: reports };
        info!(
            processed = report.processed(),
            acked = report.acked(),
            "worker pool stopped"
        );
        Ok(report)
    }

    fn rng_for(&self, index: usize) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
            None => StdRng::from_os_rng(),
        }
    }
}

/// Tracks the worker state machine and records each transition on the span.
struct StateTracker {
    span: Span,
    state: WorkerState,
}

impl StateTracker {
    fn to(&mut self, next: WorkerState) {
        record_worker_state(&self.span, self.state, next);
        self.state = next;
    }
}

struct Worker<B: Broker, P: Processor> {
    id: String,
    broker: Arc<B>,
    processor: Arc<P>,
    config: PoolConfig,
    rng: StdRng,
}

impl<B: Broker, P: Processor> Worker<B, P> {
    async fn run(mut self, cancel: CancellationToken) -> Result<WorkerReport> {
        let span = start_worker_span(&self.id, &self.config.queue);
        async move {
            let consumer = self.broker.open_channel().await?;
            let publisher = match self.broker.open_channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    close_channel(&consumer, "consumer").await;
                    return Err(e);
                }
            };

            let result = self.serve(&consumer, &publisher, &cancel).await;

            close_channel(&consumer, "consumer").await;
            close_channel(&publisher, "publisher").await;
            result
        }
        .instrument(span)
        .await
    }

    async fn serve(
        &mut self,
        consumer: &B::Channel,
        publisher: &B::Channel,
        cancel: &CancellationToken,
    ) -> Result<WorkerReport> {
        consumer.declare_work_queue(&self.config.queue).await?;
        consumer.set_prefetch(self.config.prefetch).await?;
        let mut deliveries = consumer.consume(&self.config.queue, &self.id).await?;
        debug!(prefetch = self.config.prefetch, "worker consuming");

        let mut report = WorkerReport::new(&self.id);
        let mut state = StateTracker {
            span: Span::current(),
            state: WorkerState::Idle,
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }
            state.to(WorkerState::Consuming);

            let Some(next) = next_or_cancelled(&mut deliveries, cancel).await else {
                state.to(WorkerState::Idle);
                break;
            };
            match next {
                Some(Ok(delivery)) => {
                    self.handle(publisher, delivery, &mut report, &mut state)
                        .await;
                }
                Some(Err(e)) => {
                    error!("delivery stream failed: {e}");
                    state.to(WorkerState::Stopped);
                    report.stop_reason = StopReason::StreamError(e.to_string());
                    return Ok(report);
                }
                None => {
                    warn!("delivery stream closed by broker");
                    state.to(WorkerState::Stopped);
                    report.stop_reason = StopReason::StreamClosed;
                    return Ok(report);
                }
            }
        }

        state.to(WorkerState::Stopped);
        info!(processed = report.processed, "worker stopped");
        Ok(report)
    }

    /// Process one delivery to completion. Never observes cancellation.
    async fn handle(
        &mut self,
        publisher: &B::Channel,
        delivery: Delivery,
        report: &mut WorkerReport,
        state: &mut StateTracker,
    ) {
        state.to(WorkerState::Processing);
        let started = Instant::now();
        let correlation_id = delivery.properties.correlation_id.clone().unwrap_or_default();
        let reply_to = delivery
            .properties
            .reply_to
            .clone()
            .filter(|addr| !addr.is_empty());

        info!(
            correlation_id = %correlation_id,
            body = %flatten_body(&delivery.body),
            reply_to = reply_to.as_deref().unwrap_or(""),
            "message received"
        );

        let payload = match serde_json::from_slice::<Payload>(&delivery.body) {
            Ok(payload) => payload,
            Err(e) => {
                let policy = self.config.decode_failure_policy;
                metrics::decode_failures().add(1, &[KeyValue::new("policy", policy.as_str())]);
                match policy {
                    DecodeFailurePolicy::ProcessEmpty => {
                        warn!(correlation_id = %correlation_id, "undecodable payload, processing as empty: {e}");
                        Payload::default()
                    }
                    DecodeFailurePolicy::Reject => {
                        warn!(correlation_id = %correlation_id, "undecodable payload, rejecting: {e}");
                        state.to(WorkerState::Acking);
                        match delivery.reject(false).await {
                            Ok(()) => report.rejected += 1,
                            Err(e) => error!(correlation_id = %correlation_id, "reject failed: {e}"),
                        }
                        state.to(WorkerState::Idle);
                        return;
                    }
                }
            }
        };

        let result = self.processor.process(payload, &mut self.rng).await;
        let elapsed = started.elapsed();
        report.processed += 1;
        metrics::processing_duration_ms().record(elapsed.as_secs_f64() * 1000.0, &[]);

        if let Some(reply_to) = reply_to {
            state.to(WorkerState::Replying);
            let reply = ReplyEnvelope::new(
                format!("{}/{}", self.config.source, self.id),
                CorrelationId(correlation_id.clone()),
                elapsed,
                result,
            );
            match publish_reply(publisher, &reply_to, &reply, &delivery.properties).await {
                Ok(()) => debug!(correlation_id = %correlation_id, "reply published"),
                Err(e) => {
                    // Not requeued or retried.
                    error!(correlation_id = %correlation_id, "publish reply failed: {e}");
                    metrics::reply_publish_failures().add(1, &[]);
                    report.replies_failed += 1;
                }
            }
        }

        state.to(WorkerState::Acking);
        match delivery.ack().await {
            Ok(()) => {
                report.acked += 1;
                metrics::messages_processed()
                    .add(1, &[KeyValue::new("worker", self.id.clone())]);
            }
            Err(e) => error!(correlation_id = %correlation_id, "ack failed: {e}"),
        }
        state.to(WorkerState::Idle);
    }
}

/// `None` if cancelled first; otherwise whatever the stream yielded.
async fn next_or_cancelled(
    deliveries: &mut DeliveryStream,
    cancel: &CancellationToken,
) -> Option<Option<Result<Delivery>>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        next = deliveries.next() => Some(next),
    }
}

async fn publish_reply<C: Channel>(
    publisher: &C,
    reply_to: &str,
    reply: &ReplyEnvelope,
    request: &MessageProperties,
) -> Result<()> {
    let body = serde_json::to_vec(reply)?;
    let properties = MessageProperties {
        correlation_id: Some(reply.correlation_id.0.clone()),
        reply_to: None,
        content_type: request.content_type.clone(),
    };
    publisher.publish(reply_to, &body, properties).await
}

async fn close_channel<C: Channel>(channel: &C, role: &str) {
    if let Err(e) = channel.close().await {
        warn!(role, "closing channel: {e}");
    }
}

/// Body as one log line: newlines and tabs removed.
fn flatten_body(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .filter(|c| !matches!(c, '\n' | '\r' | '\t'))
        .collect()
}
