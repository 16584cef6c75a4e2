//! Broker abstraction: one shared connection, many exclusively owned channels.
//!
//! [`Broker`] is the long-lived connection and is shared behind an `Arc`.
//! Every [`Channel`] opened from it belongs to exactly one caller request or
//! one worker and is never used from two tasks at once.
//!
//! Two implementations: [`amqp::AmqpBroker`] (RabbitMQ via lapin) and
//! [`memory::MemoryBroker`] (in-process, for tests and local runs).

pub mod amqp;
pub mod memory;

use crate::error::{Error, Result};
use crate::model::MessageProperties;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

/// RabbitMQ's reserved pseudo-queue for direct reply-to.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// Where replies for one caller are routed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyMode {
    /// Broker-reserved ad-hoc reply address; no queue declared per request.
    #[default]
    Direct,
    /// Explicit server-named, exclusive, auto-delete reply queue.
    Queue,
}

impl FromStr for ReplyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "queue" => Ok(Self::Queue),
            other => Err(format!("unknown reply mode {other:?} (expected direct|queue)")),
        }
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// An active reply consumer: the address to put in `reply_to` and the
/// stream replies arrive on.
pub struct ReplySubscription {
    pub address: String,
    pub replies: DeliveryStream,
}

/// Backend-specific settlement of one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer.
///
/// Deliveries from a manual-ack consumer must be settled exactly once;
/// a second `ack`/`reject` is an error. Reply deliveries are auto-acked and
/// settling them is a no-op.
pub struct Delivery {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    acker: Option<Box<dyn Acknowledger>>,
    settled: AtomicBool,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        properties: MessageProperties,
        acker: impl Acknowledger + 'static,
    ) -> Self {
        Self {
            body,
            properties,
            acker: Some(Box::new(acker)),
            settled: AtomicBool::new(false),
        }
    }

    pub fn auto_acked(body: Vec<u8>, properties: MessageProperties) -> Self {
        Self {
            body,
            properties,
            acker: None,
            settled: AtomicBool::new(false),
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.settle()?;
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        match &self.acker {
            Some(acker) => acker.reject(requeue).await,
            None => Ok(()),
        }
    }

    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(Error::Channel("delivery already settled".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .field("auto_acked", &self.acker.is_none())
            .finish()
    }
}

/// The shared broker connection. Opening channels on it is safe from any task.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Channel: Channel;

    async fn open_channel(&self) -> Result<Self::Channel>;

    /// Release connection-level resources.
    async fn close(&self) -> Result<()>;
}

/// One exclusively owned consumption/publication handle.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Declare (or attach to) a durable quorum queue.
    async fn declare_work_queue(&self, queue: &str) -> Result<()>;

    /// Maximum unacknowledged deliveries per consumer on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Auto-ack consumer for replies addressed to this channel.
    async fn consume_replies(&self, mode: ReplyMode) -> Result<ReplySubscription>;

    /// Publish through the default exchange.
    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
