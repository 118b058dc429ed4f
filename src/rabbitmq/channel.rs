// src/rabbitmq/channel.rs

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use super::errors::Result;
use super::message::{
    AckMode, Delivery, ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions,
};

/// Stream of deliveries produced by a consumer. Ends when the consumer is
/// cancelled, its queue is deleted or its channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Operations the RPC layer needs from one broker channel.
///
/// A channel-level error (unknown exchange, inequivalent redeclaration, ...)
/// closes the channel on the broker side; `is_open` reports that.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Declares a queue. An empty `name` asks the broker to generate one;
    /// the effective name is returned either way.
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publishes `body`. The empty exchange name is the default exchange,
    /// which routes by queue name.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        mode: AckMode,
    ) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Deletes a queue, returning the number of messages it still held.
    async fn delete_queue(&self, name: &str) -> Result<u32>;

    async fn close(&self) -> Result<()>;
}

/// A broker connection able to hand out independent channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}
