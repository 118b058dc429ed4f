// src/rabbitmq/topology.rs
// Maps logical routes onto queue/exchange/binding declarations

use std::sync::Arc;
use tracing::{debug, info};

use super::channel::BrokerChannel;
use super::errors::Result;
use super::message::{ExchangeKind, ExchangeOptions, QueueOptions};

/// How a queue receives its traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeType {
    /// The broker's implicit default exchange; the routing key is the queue name.
    Default,
    /// A topic exchange bound to the queue with a (possibly wildcard) key.
    Topic { exchange: String, routing_key: String },
}

/// One declared route: where a queue's messages come from and how the
/// queue itself is declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDescriptor {
    pub exchange_type: ExchangeType,
    pub queue: String,
    pub options: QueueOptions,
}

impl BindingDescriptor {
    pub fn default_exchange(queue: impl Into<String>) -> Self {
        Self {
            exchange_type: ExchangeType::Default,
            queue: queue.into(),
            options: QueueOptions::default(),
        }
    }

    pub fn topic(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            exchange_type: ExchangeType::Topic {
                exchange: exchange.into(),
                routing_key: routing_key.into(),
            },
            queue: queue.into(),
            options: QueueOptions::topic_bound(),
        }
    }

    pub fn with_options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn exchange_name(&self) -> Option<&str> {
        match &self.exchange_type {
            ExchangeType::Default => None,
            ExchangeType::Topic { exchange, .. } => Some(exchange),
        }
    }

    /// The key a publisher uses to reach this queue.
    pub fn routing_key(&self) -> &str {
        match &self.exchange_type {
            ExchangeType::Default => &self.queue,
            ExchangeType::Topic { routing_key, .. } => routing_key,
        }
    }
}

/// Declares topology through one broker channel. Holds no state of its own
/// and never retries: broker errors go straight back to the caller.
#[derive(Clone)]
pub struct TopologyManager {
    channel: Arc<dyn BrokerChannel>,
}

impl TopologyManager {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self { channel }
    }

    /// Declares a queue and returns its name, generated by the broker when
    /// `name` is empty.
    pub async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String> {
        let queue = self.channel.declare_queue(name, options).await?;
        debug!(
            queue = %queue,
            durable = options.durable,
            exclusive = options.exclusive,
            auto_delete = options.auto_delete,
            "Queue declared"
        );
        Ok(queue)
    }

    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()> {
        self.channel.declare_exchange(name, kind, options).await?;
        debug!(exchange = %name, kind = ?kind, "Exchange declared");
        Ok(())
    }

    /// Declares an auto-delete topic exchange and a durable queue, then binds
    /// them with `routing_key`.
    pub async fn bind_topic(
        &self,
        exchange: &str,
        routing_key: &str,
        queue: &str,
    ) -> Result<String> {
        self.bind_topic_with(exchange, routing_key, queue, &QueueOptions::topic_bound())
            .await
    }

    async fn bind_topic_with(
        &self,
        exchange: &str,
        routing_key: &str,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<String> {
        let queue = self.declare_queue(queue, options).await?;
        self.declare_exchange(
            exchange,
            ExchangeKind::Topic,
            &ExchangeOptions {
                durable: false,
                auto_delete: true,
            },
        )
        .await?;
        self.channel.bind_queue(&queue, exchange, routing_key).await?;
        info!(
            exchange = %exchange,
            routing_key = %routing_key,
            queue = %queue,
            "Queue bound to topic exchange"
        );
        Ok(queue)
    }

    /// Brings the broker in line with `descriptor`, returning the queue name.
    pub async fn declare(&self, descriptor: &BindingDescriptor) -> Result<String> {
        match &descriptor.exchange_type {
            ExchangeType::Default => {
                self.declare_queue(&descriptor.queue, &descriptor.options)
                    .await
            }
            ExchangeType::Topic {
                exchange,
                routing_key,
            } => {
                self.bind_topic_with(exchange, routing_key, &descriptor.queue, &descriptor.options)
                    .await
            }
        }
    }

    pub async fn delete_queue(&self, name: &str) -> Result<u32> {
        let purged = self.channel.delete_queue(name).await?;
        debug!(queue = %name, purged, "Queue deleted");
        Ok(purged)
    }
}
