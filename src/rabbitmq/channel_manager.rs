// src/rabbitmq/channel_manager.rs
// A channel that replaces itself after the broker closes it

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::channel::{BrokerChannel, BrokerConnection, DeliveryStream};
use super::errors::{RabbitMQError, Result};
use super::message::{AckMode, ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions};

/// Hands out one channel of `connection`, opening a fresh one whenever the
/// current channel is no longer open.
///
/// Used for the caller side, where a failed publish or declaration must not
/// take every later call down with it. Delivery tags belong to the channel
/// that delivered them, so consumers should not go through this.
pub struct ChannelManager {
    connection: Arc<dyn BrokerConnection>,
    current: Mutex<Option<Arc<dyn BrokerChannel>>>,
    closed: AtomicBool,
}

impl ChannelManager {
    pub fn new(connection: Arc<dyn BrokerConnection>) -> Self {
        Self {
            connection,
            current: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Get a channel, creating one if needed
    pub async fn get_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RabbitMQError::ChannelError("channel manager is closed".to_string()));
        }
        let mut guard = self.current.lock().await;

        let needs_new_channel = match &*guard {
            Some(channel) => !channel.is_open(),
            None => true,
        };
        if needs_new_channel {
            if guard.is_some() {
                warn!("Channel was closed by the broker, opening a new one");
            }
            let channel = self.connection.create_channel().await?;
            debug!("Caller channel opened");
            *guard = Some(channel);
        }

        guard
            .clone()
            .ok_or_else(|| RabbitMQError::ChannelError("Channel not available".to_string()))
    }

    /// Drops `channel` from the slot if an error left it closed.
    async fn after<T>(&self, channel: &Arc<dyn BrokerChannel>, result: Result<T>) -> Result<T> {
        if result.is_err() && !channel.is_open() {
            let mut guard = self.current.lock().await;
            if guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, channel)) {
                *guard = None;
            }
        }
        result
    }
}

#[async_trait]
impl BrokerChannel for ChannelManager {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String> {
        let channel = self.get_channel().await?;
        let result = channel.declare_queue(name, options).await;
        self.after(&channel, result).await
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()> {
        let channel = self.get_channel().await?;
        let result = channel.declare_exchange(name, kind, options).await;
        self.after(&channel, result).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let channel = self.get_channel().await?;
        let result = channel.bind_queue(queue, exchange, routing_key).await;
        self.after(&channel, result).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        let channel = self.get_channel().await?;
        let result = channel.publish(exchange, routing_key, body, properties).await;
        self.after(&channel, result).await
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        mode: AckMode,
    ) -> Result<DeliveryStream> {
        let channel = self.get_channel().await?;
        let result = channel.consume(queue, consumer_tag, mode).await;
        self.after(&channel, result).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let channel = self.get_channel().await?;
        let result = channel.ack(delivery_tag).await;
        self.after(&channel, result).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let channel = self.get_channel().await?;
        let result = channel.nack(delivery_tag, requeue).await;
        self.after(&channel, result).await
    }

    async fn delete_queue(&self, name: &str) -> Result<u32> {
        let channel = self.get_channel().await?;
        let result = channel.delete_queue(name).await;
        self.after(&channel, result).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let current = self.current.lock().await.take();
        match current {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}
