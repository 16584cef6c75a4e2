//! RabbitMQ binding over lapin.
//!
//! No reconnection: if the connection drops, the error is logged and every
//! channel operation fails from then on.

use super::{
    Acknowledger, Broker, Channel, DIRECT_REPLY_TO, Delivery, DeliveryStream, ReplyMode,
    ReplySubscription,
};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::model::MessageProperties;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use secrecy::ExposeSecret;
use tracing::{debug, error, info};
use uuid::Uuid;

const REPLY_CODE_SUCCESS: u16 = 200;

fn channel_err(e: lapin::Error) -> Error {
    Error::Channel(e.to_string())
}

fn publish_err(e: lapin::Error) -> Error {
    Error::Publish(e.to_string())
}

/// The process-wide AMQP connection.
pub struct AmqpBroker {
    connection: Connection,
}

impl AmqpBroker {
    /// Dial the broker. Failure here is fatal for the process.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let uri = format!(
            "{}?heartbeat={}",
            config.amqp_uri().expose_secret(),
            config.heartbeat.as_secs()
        );
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        connection.on_error(|e| {
            error!("broker connection lost: {e}");
        });

        info!(host = %config.host, port = config.port, "connected to broker");
        Ok(Self { connection })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<AmqpChannel> {
        let channel = self.connection.create_channel().await.map_err(channel_err)?;
        debug!(channel_id = channel.id(), "channel opened");
        Ok(AmqpChannel { channel })
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_CODE_SUCCESS, "shutdown")
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }
}

pub struct AmqpChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_work_queue(&self, queue: &str) -> Result<()> {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-queue-type"),
            AMQPValue::LongString("quorum".into()),
        );
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await
            .map_err(channel_err)?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(channel_err)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_err)?;

        Ok(consumer
            .map(|delivery| {
                delivery.map_err(channel_err).map(|d| {
                    let properties = properties_from_amqp(&d.properties);
                    Delivery::new(d.data, properties, AmqpAcker(d.acker))
                })
            })
            .boxed())
    }

    async fn consume_replies(&self, mode: ReplyMode) -> Result<ReplySubscription> {
        let address = match mode {
            ReplyMode::Direct => DIRECT_REPLY_TO.to_string(),
            ReplyMode::Queue => {
                let queue = self
                    .channel
                    .queue_declare(
                        "",
                        QueueDeclareOptions {
                            exclusive: true,
                            auto_delete: true,
                            ..QueueDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(channel_err)?;
                queue.name().as_str().to_string()
            }
        };

        let consumer = self
            .channel
            .basic_consume(
                &address,
                &format!("reply-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_err)?;

        let replies = consumer
            .map(|delivery| {
                delivery.map_err(channel_err).map(|d| {
                    let properties = properties_from_amqp(&d.properties);
                    Delivery::auto_acked(d.data, properties)
                })
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
        self.channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties_to_amqp(properties),
            )
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_CODE_SUCCESS, "done")
            .await
            .map_err(channel_err)
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(channel_err)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(channel_err)
    }
}

fn properties_from_amqp(props: &BasicProperties) -> MessageProperties {
    let field = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());
    MessageProperties {
        correlation_id: field(props.correlation_id()),
        reply_to: field(props.reply_to()),
        content_type: field(props.content_type()),
    }
}

fn properties_to_amqp(props: MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();
    if let Some(correlation_id) = props.correlation_id {
        amqp = amqp.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = props.reply_to {
        amqp = amqp.with_reply_to(reply_to.into());
    }
    if let Some(content_type) = props.content_type {
        amqp = amqp.with_content_type(content_type.into());
    }
    amqp
}
