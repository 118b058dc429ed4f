// src/rabbitmq/amqp_client.rs
// BrokerChannel/BrokerConnection over lapin

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection,
};
use std::sync::Arc;
use tracing::{debug, info};

use super::channel::{BrokerChannel, BrokerConnection, DeliveryStream};
use super::errors::{RabbitMQError, Result};
use super::message::{
    AckMode, ArgumentValue, Delivery, ExchangeKind, ExchangeOptions, MessageProperties,
    QueueArguments, QueueOptions,
};

fn field_table(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let value = match value {
            ArgumentValue::Bool(b) => AMQPValue::Boolean(*b),
            ArgumentValue::Int(i) => AMQPValue::LongLongInt(*i),
            ArgumentValue::Str(s) => AMQPValue::LongString(LongString::from(s.clone())),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.as_str().into());
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.as_str().into());
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(message_id.as_str().into());
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());
    MessageProperties {
        reply_to: text(basic.reply_to()),
        correlation_id: text(basic.correlation_id()),
        content_type: text(basic.content_type()),
        message_id: text(basic.message_id()),
        timestamp: *basic.timestamp(),
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data,
    }
}

/// A lapin channel. lapin channels are internally synchronized, so one
/// instance may serve concurrent tasks.
#[derive(Clone)]
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn is_healthy(&self) -> bool {
        self.channel.status().connected()
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.is_healthy()
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                field_table(&options.arguments),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        // the channel is in confirm mode, so this resolves once the broker
        // has taken the message or closed the channel over it
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| RabbitMQError::PublishFailure(e.to_string()))?
            .await
            .map_err(|e| RabbitMQError::PublishFailure(e.to_string()))?;

        match confirmation {
            Confirmation::Nack(_) => Err(RabbitMQError::PublishFailure(format!(
                "broker rejected message for exchange '{}' with routing key '{}'",
                exchange, routing_key
            ))),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        mode: AckMode,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: mode == AckMode::NoAck,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;
        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer created");

        let stream = consumer.map(|delivery| {
            delivery
                .map(from_lapin_delivery)
                .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn delete_queue(&self, name: &str) -> Result<u32> {
        Ok(self
            .channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?)
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "Closing channel").await?;
        }
        Ok(())
    }
}

/// A lapin connection handing out channels in confirm mode with a fixed
/// prefetch.
pub struct AmqpConnection {
    connection: Connection,
    prefetch_count: u16,
}

impl AmqpConnection {
    pub fn new(connection: Connection, prefetch_count: u16) -> Self {
        Self {
            connection,
            prefetch_count,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;

        if self.prefetch_count > 0 {
            channel
                .basic_qos(self.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))?;
        }

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
            })?;
        debug!(
            channel_id = channel.id(),
            prefetch = self.prefetch_count,
            "Channel opened in confirm mode"
        );

        let channel: Arc<dyn BrokerChannel> = Arc::new(AmqpChannel::new(channel));
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            info!("Closing RabbitMQ connection gracefully");
            self.connection.close(200, "Closing connection").await?;
        }
        Ok(())
    }
}
