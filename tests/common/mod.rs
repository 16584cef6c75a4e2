//! Shared fixtures for the in-memory integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use rand::rngs::StdRng;
use replyq::broker::memory::MemoryBroker;
use replyq::error::Result;
use replyq::model::Payload;
use replyq::worker::{PoolConfig, PoolReport, Processor, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const QUEUE: &str = "work";

/// Echoes after a fixed delay and records how many calls overlap.
#[derive(Default)]
pub struct FixedDelay {
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    spans: Mutex<Vec<(Instant, Instant)>>,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// `(start, end)` of every completed call, in start order.
    pub fn spans(&self) -> Vec<(Instant, Instant)> {
        let mut spans = self.spans.lock().unwrap().clone();
        spans.sort_by_key(|(start, _)| *start);
        spans
    }
}

#[async_trait]
impl Processor for FixedDelay {
    async fn process(&self, payload: Payload, _rng: &mut StdRng) -> Payload {
        let start = Instant::now();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.spans.lock().unwrap().push((start, Instant::now()));
        payload
    }
}

/// A running pool plus the token that stops it.
pub struct RunningPool {
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<PoolReport>>,
}

impl RunningPool {
    pub async fn stop(self) -> PoolReport {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap()
    }
}

pub fn broker() -> Arc<MemoryBroker> {
    let broker = MemoryBroker::new();
    broker.declare_queue(QUEUE);
    Arc::new(broker)
}

pub fn spawn_pool<P: Processor>(
    broker: &Arc<MemoryBroker>,
    processor: Arc<P>,
    config: PoolConfig,
    workers: usize,
) -> RunningPool {
    let pool = WorkerPool::new(Arc::clone(broker), processor, config);
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { pool.run(workers, token).await });
    RunningPool { cancel, handle }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}
