// src/rabbitmq/registry.rs
// Locally registered consumers and the providers that declare them

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::info;

use super::errors::{RabbitMQError, Result};
use super::message::{AckMode, Delivery};
use super::topology::BindingDescriptor;

/// What a handler produced: `Some(body)` is sent back to the delivery's
/// `reply_to` address, if it has one.
pub type HandlerResult = Result<Option<Vec<u8>>>;

// Type-erased trait for message handling
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> HandlerResult {
        (self)(delivery).await
    }
}

/// Adapts a typed async function into a handler speaking JSON on the wire.
pub struct JsonHandler<F, Req, Resp> {
    func: F,
    _phantom: PhantomData<fn(Req) -> Resp>,
}

impl<F, Fut, Req, Resp> JsonHandler<F, Req, Resp>
where
    F: Fn(Req) -> Fut,
    Fut: Future<Output = Result<Resp>>,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, Req, Resp> MessageHandler for JsonHandler<F, Req, Resp>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> HandlerResult {
        let request: Req = delivery.json()?;
        let response = (self.func)(request).await?;
        Ok(Some(serde_json::to_vec(&response)?))
    }
}

/// An object serving RPC traffic. `declare` records every consumer the
/// provider needs; it runs at registration time and must not touch the broker.
pub trait RpcProvider: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn declare(&self, registry: &mut HandlerRegistry) -> Result<()>;
}

#[derive(Clone)]
pub struct HandlerEntry {
    pub descriptor: BindingDescriptor,
    pub ack_mode: AckMode,
    pub handler: Arc<dyn MessageHandler>,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("descriptor", &self.descriptor)
            .field("ack_mode", &self.ack_mode)
            .finish_non_exhaustive()
    }
}

/// Consumers to start when the client comes up. Only grows while the client
/// is being built; the running dispatcher reads it through an `Arc`.
#[derive(Default, Debug)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
    providers: Vec<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        descriptor: BindingDescriptor,
        handler: impl MessageHandler + 'static,
    ) -> &mut Self {
        self.register_with_mode(descriptor, AckMode::Ack, handler)
    }

    pub fn register_with_mode(
        &mut self,
        descriptor: BindingDescriptor,
        ack_mode: AckMode,
        handler: impl MessageHandler + 'static,
    ) -> &mut Self {
        self.entries.push(HandlerEntry {
            descriptor,
            ack_mode,
            handler: Arc::new(handler),
        });
        self
    }

    /// Consumes `queue` through the default exchange.
    pub fn register_default(
        &mut self,
        queue: &str,
        handler: impl MessageHandler + 'static,
    ) -> &mut Self {
        self.register(BindingDescriptor::default_exchange(queue), handler)
    }

    /// Consumes `queue` bound to topic `exchange` with `routing_key`.
    pub fn register_topic(
        &mut self,
        exchange: &str,
        routing_key: &str,
        queue: &str,
        handler: impl MessageHandler + 'static,
    ) -> &mut Self {
        self.register(BindingDescriptor::topic(exchange, routing_key, queue), handler)
    }

    /// Lets `provider` declare its consumers. A provider that declares none
    /// is rejected with `MissingCapability` and leaves the registry untouched.
    pub fn register_provider<P: RpcProvider>(&mut self, provider: &P) -> Result<&mut Self> {
        let before = self.entries.len();
        if let Err(e) = provider.declare(self) {
            self.entries.truncate(before);
            return Err(e);
        }
        let declared = self.entries.len() - before;
        if declared == 0 {
            return Err(RabbitMQError::MissingCapability(provider.name().to_string()));
        }

        info!(provider = %provider.name(), consumers = declared, "RPC provider registered");
        self.providers.push(provider.name().to_string());
        Ok(self)
    }

    pub fn entries(&self) -> &[HandlerEntry] {
        &self.entries
    }

    pub fn providers(&self) -> &[String] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
