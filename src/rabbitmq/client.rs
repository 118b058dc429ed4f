// src/rabbitmq/client.rs
// Host-facing entry point: registration, startup, calls and publishing

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::channel::{BrokerChannel, BrokerConnection};
use super::channel_manager::ChannelManager;
use super::connection::ConnectionManager;
use super::correlation::CorrelationTable;
use super::dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle};
use super::errors::Result;
use super::message::{AckMode, MessageProperties};
use super::registry::{HandlerRegistry, MessageHandler, RpcProvider};
use super::request_response::{publish_failure, SyncCallBridge};
use super::topology::{BindingDescriptor, TopologyManager};
use crate::config::BrokerConfig;

/// Collects handlers and providers, then brings the client up.
pub struct RabbitMQClientBuilder {
    registry: HandlerRegistry,
    dispatcher: DispatcherConfig,
    call_timeout: Option<Duration>,
}

impl Default for RabbitMQClientBuilder {
    fn default() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            dispatcher: DispatcherConfig::default(),
            call_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RabbitMQClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        descriptor: BindingDescriptor,
        handler: impl MessageHandler + 'static,
    ) -> Self {
        self.registry.register(descriptor, handler);
        self
    }

    pub fn register_with_mode(
        mut self,
        descriptor: BindingDescriptor,
        ack_mode: AckMode,
        handler: impl MessageHandler + 'static,
    ) -> Self {
        self.registry.register_with_mode(descriptor, ack_mode, handler);
        self
    }

    pub fn register_default(mut self, queue: &str, handler: impl MessageHandler + 'static) -> Self {
        self.registry.register_default(queue, handler);
        self
    }

    pub fn register_topic(
        mut self,
        exchange: &str,
        routing_key: &str,
        queue: &str,
        handler: impl MessageHandler + 'static,
    ) -> Self {
        self.registry.register_topic(exchange, routing_key, queue, handler);
        self
    }

    pub fn register_provider<P: RpcProvider>(mut self, provider: &P) -> Result<Self> {
        self.registry.register_provider(provider)?;
        Ok(self)
    }

    /// Default deadline for synchronous calls; `None` waits forever.
    pub fn call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn requeue_on_error(mut self, requeue: bool) -> Self {
        self.dispatcher.requeue_on_error = requeue;
        self
    }

    pub fn consumer_tag_prefix(mut self, prefix: &str) -> Self {
        self.dispatcher.consumer_tag_prefix = prefix.to_string();
        self
    }

    /// Connects to RabbitMQ with `config` and starts the client.
    pub async fn connect(self, config: &BrokerConfig) -> Result<RabbitMQClient> {
        let connection = ConnectionManager::from_config(config).connect().await?;
        let builder = self.call_timeout(config.call_timeout());
        builder.start(Arc::new(connection)).await
    }

    /// Declares every registered route, starts consuming and returns the
    /// running client. Callers and the dispatcher get separate channels; the
    /// caller channel is reopened whenever the broker closes it.
    pub async fn start(self, connection: Arc<dyn BrokerConnection>) -> Result<RabbitMQClient> {
        let caller_channel: Arc<dyn BrokerChannel> =
            Arc::new(ChannelManager::new(connection.clone()));
        let consumer_channel = connection.create_channel().await?;
        let topology = TopologyManager::new(caller_channel.clone());

        let mut queues = Vec::with_capacity(self.registry.len());
        for entry in self.registry.entries() {
            queues.push(topology.declare(&entry.descriptor).await?);
        }

        let registry = Arc::new(self.registry);
        let correlations = Arc::new(CorrelationTable::new());
        let dispatcher = Dispatcher::new(
            consumer_channel.clone(),
            registry.clone(),
            correlations.clone(),
            self.dispatcher,
        )
        .start(&queues)
        .await?;

        let bridge = SyncCallBridge::new(
            topology.clone(),
            caller_channel.clone(),
            correlations.clone(),
            dispatcher.replies(),
            self.call_timeout,
        );
        info!(consumers = queues.len(), "consuming...");

        Ok(RabbitMQClient {
            connection,
            caller_channel,
            consumer_channel,
            topology,
            registry,
            correlations,
            bridge,
            dispatcher,
        })
    }
}

/// A running client: consumers are live and calls can be made.
pub struct RabbitMQClient {
    connection: Arc<dyn BrokerConnection>,
    caller_channel: Arc<dyn BrokerChannel>,
    consumer_channel: Arc<dyn BrokerChannel>,
    topology: TopologyManager,
    registry: Arc<HandlerRegistry>,
    correlations: Arc<CorrelationTable>,
    bridge: SyncCallBridge,
    dispatcher: DispatcherHandle,
}

impl RabbitMQClient {
    pub fn builder() -> RabbitMQClientBuilder {
        RabbitMQClientBuilder::new()
    }

    /// Sends `body` and waits for the reply, up to the configured deadline.
    pub async fn invoke(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl AsRef<[u8]>,
    ) -> Result<Vec<u8>> {
        self.bridge.call(exchange, routing_key, body.as_ref()).await
    }

    pub async fn invoke_with_timeout(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl AsRef<[u8]>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.bridge
            .call_with_timeout(exchange, routing_key, body.as_ref(), timeout)
            .await
    }

    pub async fn invoke_json<T: Serialize, R: DeserializeOwned>(
        &self,
        exchange: &str,
        routing_key: &str,
        request: &T,
    ) -> Result<R> {
        self.bridge.call_json(exchange, routing_key, request).await
    }

    /// Fire-and-forget publish.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.publish_with(exchange, routing_key, body.as_ref(), &MessageProperties::default())
            .await
    }

    /// Publishes with an explicit correlation id, e.g. a reply built by hand.
    pub async fn publish_with_correlation(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl AsRef<[u8]>,
        correlation_id: &str,
    ) -> Result<()> {
        let properties = MessageProperties::default().with_correlation_id(correlation_id);
        self.publish_with(exchange, routing_key, body.as_ref(), &properties)
            .await
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.publish_with(exchange, routing_key, &payload, &MessageProperties::json())
            .await
    }

    pub async fn publish_with(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        self.caller_channel
            .publish(exchange, routing_key, body, properties)
            .await
            .map_err(publish_failure)?;
        info!(
            "Published message to exchange '{}' with routing key '{}'",
            exchange, routing_key
        );
        Ok(())
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.correlations.len()
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running()
    }

    /// Stops the dispatcher, then closes both channels and the connection.
    pub async fn shutdown(mut self) -> Result<()> {
        self.dispatcher.shutdown().await;
        for channel in [&self.consumer_channel, &self.caller_channel] {
            if let Err(e) = channel.close().await {
                warn!("Failed to close channel: {}", e);
            }
        }
        self.connection.close().await?;
        info!("RabbitMQ client shut down");
        Ok(())
    }
}
