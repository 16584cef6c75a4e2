//! The business-logic seam of a worker.

use crate::model::Payload;
use async_trait::async_trait;
use rand::Rng;
use rand::rngs::StdRng;
use std::time::Duration;

/// Computes the result for one request payload.
///
/// The generator is owned by the calling worker, so implementations never
/// share a random source and tests can seed it.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, payload: Payload, rng: &mut StdRng) -> Payload;
}

/// Echoes the payload back after a random delay in `[0, max_latency)`.
#[derive(Debug, Clone)]
pub struct EchoProcessor {
    max_latency: Duration,
}

impl EchoProcessor {
    pub const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(400);

    pub fn new(max_latency: Duration) -> Self {
        Self { max_latency }
    }

    /// Pick the simulated latency for one message.
    pub fn latency(&self, rng: &mut StdRng) -> Duration {
        let max_ms = u64::try_from(self.max_latency.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.random_range(0..max_ms))
    }
}

impl Default for EchoProcessor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_LATENCY)
    }
}

#[async_trait]
impl Processor for EchoProcessor {
    async fn process(&self, payload: Payload, rng: &mut StdRng) -> Payload {
        let latency = self.latency(rng);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        payload
    }
}
