//! In-process broker with the delivery semantics the core relies on.
//!
//! - Named queues; a delivery goes to exactly one ready consumer.
//! - Per-consumer prefetch: a consumer holds at most `prefetch` unsettled
//!   deliveries. Settling (or dropping) a delivery frees the slot.
//! - Direct reply-to: publishing with `reply_to = amq.rabbitmq.reply-to`
//!   on a channel consuming replies rewrites the address to that channel's
//!   private route. Closing the channel removes the route.
//! - Messages for unknown routing keys are dropped silently, as the default
//!   exchange does without the mandatory flag.

use super::{
    Acknowledger, Broker, Channel, DIRECT_REPLY_TO, Delivery, DeliveryStream, ReplyMode,
    ReplySubscription,
};
use crate::error::{Error, Result};
use crate::model::MessageProperties;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    properties: MessageProperties,
}

#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<Message>>,
    available: Notify,
    acked: AtomicUsize,
    rejected: AtomicUsize,
}

impl MemoryQueue {
    fn push(&self, message: Message) {
        lock(&self.messages).push_back(message);
        self.available.notify_one();
    }

    fn push_front(&self, message: Message) {
        lock(&self.messages).push_front(message);
        self.available.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        lock(&self.messages).pop_front()
    }
}

/// Counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting for a consumer.
    pub ready: usize,
    pub acked: usize,
    pub rejected: usize,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    reply_routes: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
    shutdown: CancellationToken,
    refuse_channels: AtomicBool,
    fail_reply_publishes: AtomicBool,
    open_channels: AtomicUsize,
}

impl Inner {
    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        lock(&self.queues).get(name).cloned()
    }
}

/// In-process broker. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a queue outside of any channel. Idempotent.
    pub fn declare_queue(&self, name: &str) {
        lock(&self.inner.queues)
            .entry(name.to_string())
            .or_default();
    }

    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        self.inner.queue(name).map(|q| QueueStats {
            ready: lock(&q.messages).len(),
            acked: q.acked.load(Ordering::SeqCst),
            rejected: q.rejected.load(Ordering::SeqCst),
        })
    }

    /// Channels opened and not yet closed or dropped.
    pub fn open_channels(&self) -> usize {
        self.inner.open_channels.load(Ordering::SeqCst)
    }

    /// Live reply routes (one per active reply consumer).
    pub fn reply_routes(&self) -> usize {
        lock(&self.inner.reply_routes).len()
    }

    /// Fault injection: make `open_channel` fail.
    pub fn refuse_channels(&self, refuse: bool) {
        self.inner.refuse_channels.store(refuse, Ordering::SeqCst);
    }

    /// Fault injection: make every publish to a reply route fail.
    pub fn fail_reply_publishes(&self, fail: bool) {
        self.inner.fail_reply_publishes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Channel("connection closed".to_string()));
        }
        if self.inner.refuse_channels.load(Ordering::SeqCst) {
            return Err(Error::Channel("channel refused by broker".to_string()));
        }
        self.inner.open_channels.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryChannel {
            inner: Arc::clone(&self.inner),
            closed: self.inner.shutdown.child_token(),
            released: AtomicBool::new(false),
            prefetch: AtomicU16::new(0),
            reply_route: Mutex::new(None),
        })
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        lock(&self.inner.reply_routes).clear();
        Ok(())
    }
}

pub struct MemoryChannel {
    inner: Arc<Inner>,
    closed: CancellationToken,
    released: AtomicBool,
    /// 0 means unlimited.
    prefetch: AtomicU16,
    reply_route: Mutex<Option<String>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Channel("channel closed".to_string()));
        }
        Ok(())
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        if let Some(route) = lock(&self.reply_route).take() {
            lock(&self.inner.reply_routes).remove(&route);
        }
        self.inner.open_channels.fetch_sub(1, Ordering::SeqCst);
    }

    /// Resolve the reserved reply address to this channel's private route.
    fn resolve_reply_to(&self, reply_to: Option<String>) -> Result<Option<String>> {
        match reply_to {
            Some(addr) if addr == DIRECT_REPLY_TO => match lock(&self.reply_route).clone() {
                Some(route) => Ok(Some(route)),
                None => Err(Error::Publish(
                    "reply-to consumer not started on this channel".to_string(),
                )),
            },
            other => Ok(other),
        }
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_work_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        lock(&self.inner.queues)
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let queue = self
            .inner
            .queue(queue)
            .ok_or_else(|| Error::Channel(format!("no queue '{queue}'")))?;

        let permits = match self.prefetch.load(Ordering::SeqCst) {
            0 => Semaphore::MAX_PERMITS,
            n => usize::from(n),
        };
        debug!(consumer_tag, prefetch = permits, "memory consumer started");

        let state = ConsumerState {
            queue,
            permits: Arc::new(Semaphore::new(permits)),
            closed: self.closed.clone(),
        };
        Ok(stream::unfold(state, |state| async move {
            let delivery = state.next_delivery().await?;
            Some((Ok(delivery), state))
        })
        .boxed())
    }

    async fn consume_replies(&self, mode: ReplyMode) -> Result<ReplySubscription> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let route = match mode {
            ReplyMode::Direct => format!("{DIRECT_REPLY_TO}.{}", Uuid::new_v4()),
            ReplyMode::Queue => format!("amq.gen-{}", Uuid::new_v4()),
        };
        lock(&self.inner.reply_routes).insert(route.clone(), tx);
        *lock(&self.reply_route) = Some(route.clone());

        let address = match mode {
            ReplyMode::Direct => DIRECT_REPLY_TO.to_string(),
            ReplyMode::Queue => route,
        };
        let replies = stream::unfold(rx, |mut rx| async move {
            let delivery = rx.recv().await?;
            Some((Ok(delivery), rx))
        })
        .boxed();
        Ok(ReplySubscription { address, replies })
    }

    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()> {
        self.ensure_open()
            .map_err(|e| Error::Publish(e.to_string()))?;
        let properties = MessageProperties {
            reply_to: self.resolve_reply_to(properties.reply_to)?,
            ..properties
        };

        let route = lock(&self.inner.reply_routes).get(routing_key).cloned();
        if let Some(route) = route {
            if self.inner.fail_reply_publishes.load(Ordering::SeqCst) {
                return Err(Error::Publish("injected reply publish failure".to_string()));
            }
            // Receiver gone means the caller stopped listening; drop it.
            let _ = route.send(Delivery::auto_acked(body.to_vec(), properties));
            return Ok(());
        }

        match self.inner.queue(routing_key) {
            Some(queue) => queue.push(Message {
                body: body.to_vec(),
                properties,
            }),
            None => debug!(routing_key, "unroutable message dropped"),
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.release();
        Ok(())
    }
}

struct ConsumerState {
    queue: Arc<MemoryQueue>,
    permits: Arc<Semaphore>,
    closed: CancellationToken,
}

impl ConsumerState {
    /// Wait for a free prefetch slot, then for a message. `None` once the
    /// channel closes.
    async fn next_delivery(&self) -> Option<Delivery> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok()?,
            _ = self.closed.cancelled() => return None,
        };

        loop {
            let notified = self.queue.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.queue.pop() {
                let acker = MemoryAcker {
                    queue: Arc::clone(&self.queue),
                    message: Mutex::new(Some(message.clone())),
                    _permit: permit,
                };
                return Some(Delivery::new(message.body, message.properties, acker));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed.cancelled() => return None,
            }
        }
    }
}

/// Holds the prefetch slot until the delivery is settled or dropped.
/// An unsettled delivery that is dropped goes back to the head of the queue.
struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    message: Mutex<Option<Message>>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        lock(&self.message).take();
        self.queue.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        let message = lock(&self.message).take();
        self.queue.rejected.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = message.filter(|_| requeue) {
            self.queue.push_front(message);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(message) = lock(&self.message).take() {
            self.queue.push_front(message);
        }
    }
}

/// Poisoning only happens if a holder panicked; the data is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
