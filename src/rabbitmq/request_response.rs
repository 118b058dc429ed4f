// src/rabbitmq/request_response.rs
// Request/response over one-way publish: reply queue + correlation id

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::BrokerChannel;
use super::correlation::CorrelationTable;
use super::dispatcher::ReplyRouter;
use super::errors::{RabbitMQError, Result};
use super::message::{MessageProperties, QueueOptions};
use super::topology::TopologyManager;

/// Turns publish errors into `PublishFailure`, keeping the broker's text.
pub(crate) fn publish_failure(error: RabbitMQError) -> RabbitMQError {
    match error {
        RabbitMQError::PublishFailure(_) => error,
        other => RabbitMQError::PublishFailure(other.to_string()),
    }
}

/// Runs synchronous calls: each call gets its own exclusive reply queue and
/// a fresh correlation id, and waits for the dispatcher to hand the reply
/// back through the correlation table.
#[derive(Clone)]
pub struct SyncCallBridge {
    topology: TopologyManager,
    channel: Arc<dyn BrokerChannel>,
    correlations: Arc<CorrelationTable>,
    replies: ReplyRouter,
    default_timeout: Option<Duration>,
}

impl SyncCallBridge {
    pub fn new(
        topology: TopologyManager,
        channel: Arc<dyn BrokerChannel>,
        correlations: Arc<CorrelationTable>,
        replies: ReplyRouter,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            topology,
            channel,
            correlations,
            replies,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Sends `body` and waits for the matching reply, up to the default deadline.
    pub async fn call(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<Vec<u8>> {
        let properties = MessageProperties::default();
        self.call_with(exchange, routing_key, body, properties, self.default_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.call_with(exchange, routing_key, body, MessageProperties::default(), timeout)
            .await
    }

    pub async fn call_json<T: Serialize, R: DeserializeOwned>(
        &self,
        exchange: &str,
        routing_key: &str,
        request: &T,
    ) -> Result<R> {
        let payload = serde_json::to_vec(request)?;
        let properties = MessageProperties::json();
        let reply = self
            .call_with(exchange, routing_key, &payload, properties, self.default_timeout)
            .await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// One full exchange. `properties` get `reply_to` and `correlation_id`
    /// set on top of whatever they already carry.
    ///
    /// Dropping the returned future before it completes still removes the
    /// reply queue, in the background.
    pub async fn call_with(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let name = self
            .topology
            .declare_queue("", &QueueOptions::ephemeral())
            .await?;
        let reply_queue = ReplyQueue::new(self.topology.clone(), name);
        if let Err(e) = self.replies.attach(reply_queue.name()).await {
            reply_queue.discard().await;
            return Err(e);
        }

        let correlation_id = Uuid::new_v4().to_string();
        let pending = match self.correlations.begin(&correlation_id, reply_queue.name()) {
            Ok(pending) => pending,
            Err(e) => {
                reply_queue.discard().await;
                return Err(e);
            }
        };

        let properties = properties
            .with_reply_to(reply_queue.name())
            .with_correlation_id(correlation_id.as_str());
        if let Err(e) = self.channel.publish(exchange, routing_key, body, &properties).await {
            drop(pending);
            reply_queue.discard().await;
            return Err(publish_failure(e));
        }
        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            correlation_id = %correlation_id,
            reply_to = %reply_queue.name(),
            "RPC request published"
        );

        let outcome = pending.wait(timeout).await;
        reply_queue.discard().await;

        if outcome.is_ok() {
            info!(correlation_id = %correlation_id, "Got the RPC server response");
        }
        outcome
    }
}

/// The server-named queue one call listens on. Deleted by `discard`, or by a
/// background task if the call is dropped first.
struct ReplyQueue {
    topology: TopologyManager,
    name: String,
    armed: bool,
}

impl ReplyQueue {
    fn new(topology: TopologyManager, name: String) -> Self {
        Self {
            topology,
            name,
            armed: true,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn discard(mut self) {
        self.armed = false;
        delete_reply_queue(&self.topology, &self.name).await;
    }
}

impl Drop for ReplyQueue {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let topology = self.topology.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(queue = %name, "Call abandoned, deleting its reply queue");
                handle.spawn(async move { delete_reply_queue(&topology, &name).await });
            }
            Err(_) => warn!(queue = %name, "No runtime left to delete reply queue"),
        }
    }
}

async fn delete_reply_queue(topology: &TopologyManager, name: &str) {
    if let Err(e) = topology.delete_queue(name).await {
        warn!(queue = %name, "Failed to delete reply queue: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::{InMemoryBroker, InMemoryConnection};

    async fn reply_queue(connection: &InMemoryConnection) -> ReplyQueue {
        let topology = TopologyManager::new(connection.open_channel().unwrap());
        let name = topology
            .declare_queue("", &QueueOptions::ephemeral())
            .await
            .unwrap();
        ReplyQueue::new(topology, name)
    }

    #[tokio::test]
    async fn discarded_reply_queue_is_deleted() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let queue = reply_queue(&connection).await;
        let name = queue.name().to_string();
        assert!(broker.queue_exists(&name));

        queue.discard().await;
        assert!(!broker.queue_exists(&name));
    }

    #[tokio::test]
    async fn dropped_reply_queue_is_deleted_in_the_background() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let queue = reply_queue(&connection).await;
        let name = queue.name().to_string();

        drop(queue);
        for _ in 0..50 {
            if !broker.queue_exists(&name) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("reply queue {name} was never deleted");
    }
}
