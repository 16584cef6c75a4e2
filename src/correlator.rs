//! Caller side of request-reply.
//!
//! Every [`ReplyCorrelator::send`] opens its own channel, so the reply
//! consumer on it only ever sees replies to that one call. The correlation
//! id is still compared on receipt, and a mismatch is a protocol fault.

use crate::broker::{Broker, Channel, Delivery, ReplyMode};
use crate::error::{Error, Result};
use crate::model::{CorrelationId, Payload, ReplyEnvelope, ReplyOutcome, RequestEnvelope};
use crate::telemetry::metrics;
use crate::telemetry::request::{record_outcome, start_request_span};
use futures::StreamExt;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

/// Publishes requests to one work queue and waits for the correlated reply.
pub struct ReplyCorrelator<B: Broker> {
    broker: Arc<B>,
    queue: String,
    reply_mode: ReplyMode,
    cancel: CancellationToken,
}

impl<B: Broker> Clone for ReplyCorrelator<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            queue: self.queue.clone(),
            reply_mode: self.reply_mode,
            cancel: self.cancel.clone(),
        }
    }
}

impl<B: Broker> ReplyCorrelator<B> {
    pub fn new(
        broker: Arc<B>,
        queue: impl Into<String>,
        reply_mode: ReplyMode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            reply_mode,
            cancel,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Decode a raw request body, then [`send`](Self::send) it.
    ///
    /// An undecodable body fails with [`Error::Decode`] before the broker is
    /// touched.
    pub async fn send_raw(&self, body: &[u8], timeout: Duration) -> Result<ReplyOutcome> {
        let payload: Payload = serde_json::from_slice(body)?;
        self.send(&payload, timeout).await
    }

    /// Publish `payload` and wait up to `timeout` for its reply.
    ///
    /// Returns [`ReplyOutcome::TimedOut`] when the deadline fires first.
    /// Once shutdown has started, new calls fail with
    /// [`Error::ShuttingDown`]; calls already waiting run to completion.
    pub async fn send(&self, payload: &Payload, timeout: Duration) -> Result<ReplyOutcome> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let correlation_id = CorrelationId::generate();
        let span = start_request_span(correlation_id.as_str(), &self.queue);

        let result = async {
            let channel = self.broker.open_channel().await?;
            let result = self
                .exchange(&channel, payload, &correlation_id, timeout)
                .await;
            if let Err(e) = channel.close().await {
                warn!("closing reply channel: {e}");
            }
            result
        }
        .instrument(span.clone())
        .await;

        let outcome = match &result {
            Ok(ReplyOutcome::Replied(_)) => "replied",
            Ok(ReplyOutcome::TimedOut { .. }) => "timed_out",
            Err(_) => "error",
        };
        record_outcome(&span, outcome);
        result
    }

    /// Subscribe, publish, then race the reply against the timeout.
    async fn exchange(
        &self,
        channel: &B::Channel,
        payload: &Payload,
        correlation_id: &CorrelationId,
        timeout: Duration,
    ) -> Result<ReplyOutcome> {
        let mut subscription = channel.consume_replies(self.reply_mode).await?;

        let request = RequestEnvelope::new(
            payload.clone(),
            correlation_id.clone(),
            subscription.address.clone(),
        );
        let body = request.body()?;
        info!(
            correlation_id = %correlation_id,
            body = %String::from_utf8_lossy(&body),
            "publishing request"
        );
        channel
            .publish(&self.queue, &body, request.properties())
            .await?;
        metrics::requests_published().add(1, &[KeyValue::new("queue", self.queue.clone())]);

        match tokio::time::timeout(timeout, subscription.replies.next()).await {
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(correlation_id = %correlation_id, timeout_ms, "request timed out");
                metrics::requests_timed_out().add(1, &[]);
                Ok(ReplyOutcome::TimedOut {
                    correlation_id: correlation_id.clone(),
                    waited: timeout,
                })
            }
            Ok(None) => Err(Error::ReplyStreamClosed),
            Ok(Some(Err(e))) => Err(e),
            Ok(Some(Ok(delivery))) => accept_reply(&delivery, correlation_id).map(|reply| {
                debug!(correlation_id = %correlation_id, source = %reply.source, "reply received");
                metrics::replies_received().add(1, &[]);
                ReplyOutcome::Replied(reply)
            }),
        }
    }
}

/// Decode a reply and check it answers `expected`, both in the broker
/// properties (when set) and in the body.
fn accept_reply(delivery: &Delivery, expected: &CorrelationId) -> Result<ReplyEnvelope> {
    let mismatch = |actual: Option<String>| {
        warn!(
            expected = %expected,
            actual = actual.as_deref().unwrap_or(""),
            "reply correlation mismatch"
        );
        metrics::replies_mismatched().add(1, &[]);
        Error::CorrelationMismatch {
            expected: expected.0.clone(),
            actual,
        }
    };

    if let Some(actual) = &delivery.properties.correlation_id {
        if actual != expected.as_str() {
            return Err(mismatch(Some(actual.clone())));
        }
    }

    let reply: ReplyEnvelope = serde_json::from_slice(&delivery.body)?;
    if reply.correlation_id != *expected {
        return Err(mismatch(Some(reply.correlation_id.0)));
    }
    Ok(reply)
}
