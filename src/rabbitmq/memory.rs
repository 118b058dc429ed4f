//! In-process broker with RabbitMQ routing semantics.
//!
//! Supports the default exchange, direct/fanout/topic exchanges, exclusive and
//! auto-delete queues, redeclaration checks and ack/nack with requeue. Good
//! enough to drive the RPC layer end to end without a server.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::channel::{BrokerChannel, BrokerConnection, DeliveryStream};
use super::errors::{RabbitMQError, Result};
use super::message::{
    AckMode, Delivery, ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions,
};
use super::topic::topic_matches;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    mode: AckMode,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    had_consumer: bool,
}

struct ExchangeState {
    kind: ExchangeKind,
    options: ExchangeOptions,
    bindings: Vec<(String, String)>,
}

struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    unacked: HashMap<u64, Unacked>,
    next_delivery_tag: u64,
}

impl BrokerState {
    fn declare_queue(&mut self, owner: u64, name: &str, options: &QueueOptions) -> Result<String> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = self.queues.get(&name) {
            if existing.owner.is_some_and(|o| o != owner) {
                return Err(RabbitMQError::ChannelError(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    name
                )));
            }
            if existing.options != *options {
                return Err(RabbitMQError::TopologyConflict(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}': \
                     declared {:?}, existing {:?}",
                    name, options, existing.options
                )));
            }
            return Ok(name);
        }

        self.queues.insert(
            name.clone(),
            QueueState {
                options: options.clone(),
                owner: options.exclusive.then_some(owner),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                had_consumer: false,
            },
        );
        Ok(name)
    }

    fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()> {
        if name.is_empty() || name.starts_with("amq.") {
            return Err(RabbitMQError::ChannelError(format!(
                "ACCESS_REFUSED - exchange name '{}' is reserved",
                name
            )));
        }
        match self.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.options != *options => {
                Err(RabbitMQError::TopologyConflict(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}': \
                     declared {:?}/{:?}, existing {:?}/{:?}",
                    name, kind, options, existing.kind, existing.options
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        options: *options,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        if !self.queues.contains_key(queue) {
            return Err(RabbitMQError::ChannelError(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let exchange_state = self.exchanges.get_mut(exchange).ok_or_else(|| {
            RabbitMQError::ChannelError(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }
        let exchange_state = self.exchanges.get(exchange).ok_or_else(|| {
            RabbitMQError::PublishFailure(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &exchange_state.bindings {
            let hit = match exchange_state.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(key, routing_key),
            };
            if hit && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        let targets = self.route(exchange, routing_key)?;
        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable, dropped");
        }
        for queue in targets {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.messages.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    properties: properties.clone(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
            self.pump(&queue);
        }
        Ok(())
    }

    /// Hands queued messages to consumers round-robin until one side runs dry.
    fn pump(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            if state.consumers.is_empty() {
                break;
            }
            let Some(message) = state.messages.pop_front() else {
                return;
            };

            let index = state.next_consumer % state.consumers.len();
            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            let consumer = &state.consumers[index];
            if consumer.sender.send(delivery).is_err() {
                trace!(queue = %queue, consumer = %consumer.tag, "Consumer went away");
                state.consumers.remove(index);
                state.messages.push_front(message);
                continue;
            }
            state.next_consumer = index + 1;
            if consumer.mode == AckMode::Ack {
                let channel_id = consumer.channel_id;
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        channel_id,
                        queue: queue.to_string(),
                        message,
                    },
                );
            }
        }
        self.auto_delete_if_unused(queue);
    }

    fn auto_delete_if_unused(&mut self, queue: &str) {
        let unused = self
            .queues
            .get(queue)
            .is_some_and(|q| q.options.auto_delete && q.had_consumer && q.consumers.is_empty());
        if unused {
            debug!(queue = %queue, "Auto-deleting queue with no consumers left");
            self.delete_queue(queue);
        }
    }

    fn delete_queue(&mut self, queue: &str) -> u32 {
        let Some(state) = self.queues.remove(queue) else {
            return 0;
        };
        self.unacked.retain(|_, u| u.queue != queue);

        let mut emptied = Vec::new();
        for (name, exchange) in self.exchanges.iter_mut() {
            let before = exchange.bindings.len();
            exchange.bindings.retain(|(q, _)| q != queue);
            if exchange.options.auto_delete && before > 0 && exchange.bindings.is_empty() {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            debug!(exchange = %name, "Auto-deleting exchange with no bindings left");
            self.exchanges.remove(&name);
        }
        state.messages.len() as u32
    }

    fn settle(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let unacked = self.unacked.remove(&delivery_tag).ok_or_else(|| {
            RabbitMQError::AckError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))
        })?;
        if requeue {
            self.requeue(unacked);
        }
        Ok(())
    }

    fn requeue(&mut self, unacked: Unacked) {
        let Unacked { queue, mut message, .. } = unacked;
        if let Some(state) = self.queues.get_mut(&queue) {
            message.redelivered = true;
            state.messages.push_front(message);
            self.pump(&queue);
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        let mut touched = Vec::new();
        for (name, state) in self.queues.iter_mut() {
            let before = state.consumers.len();
            state.consumers.retain(|c| c.channel_id != channel_id);
            if state.consumers.len() != before {
                touched.push(name.clone());
            }
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }

        for queue in touched {
            self.auto_delete_if_unused(&queue);
        }
    }
}

/// Shared handle to an in-process broker. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    ids: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Opens a new connection. Exclusive queues belong to the connection
    /// that declared them and disappear when it closes.
    pub fn connect(&self) -> InMemoryConnection {
        let id = self.next_id();
        debug!(connection_id = id, "In-memory connection opened");
        InMemoryConnection {
            broker: self.clone(),
            id,
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in `queue` that no consumer has taken yet.
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|q| q.consumers.len())
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }
}

pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    channels: Mutex<Vec<Arc<InMemoryChannel>>>,
    closed: AtomicBool,
}

impl InMemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn open_channel(&self) -> Result<Arc<InMemoryChannel>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RabbitMQError::ConnectionError("connection is closed".to_string()));
        }
        let channel = Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
            channel_id: self.broker.next_id(),
            closed: AtomicBool::new(false),
        });
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel.clone());
        Ok(channel)
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels = std::mem::take(
            &mut *self.channels.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for channel in channels {
            channel.shutdown();
        }

        let mut state = self.broker.state();
        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            state.delete_queue(&queue);
        }
        debug!(connection_id = self.id, "In-memory connection closed");
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel: Arc<dyn BrokerChannel> = self.open_channel()?;
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

pub struct InMemoryChannel {
    broker: InMemoryBroker,
    connection_id: u64,
    channel_id: u64,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RabbitMQError::ChannelError(format!(
                "channel {} is closed",
                self.channel_id
            )));
        }
        Ok(())
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker.state().close_channel(self.channel_id);
        }
    }

    /// Every broker-side failure is a channel exception: the channel is
    /// closed before the error is returned.
    fn checked<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            debug!(channel_id = self.channel_id, "Closing channel after error: {}", e);
            self.shutdown();
        }
        result
    }

    fn register_consumer(
        &self,
        queue: &str,
        consumer_tag: &str,
        mode: AckMode,
        sender: mpsc::UnboundedSender<Delivery>,
    ) -> Result<()> {
        let mut state = self.broker.state();
        let queue_state = state.queues.get_mut(queue).ok_or_else(|| {
            RabbitMQError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue))
        })?;
        if queue_state.owner.is_some_and(|o| o != self.connection_id) {
            return Err(RabbitMQError::ConsumeError(format!(
                "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                queue
            )));
        }
        queue_state.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            channel_id: self.channel_id,
            mode,
            sender,
        });
        queue_state.had_consumer = true;
        state.pump(queue);
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String> {
        self.ensure_open()?;
        let declared = self.broker.state().declare_queue(self.connection_id, name, options);
        self.checked(declared)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        let declared = self.broker.state().declare_exchange(name, kind, options);
        self.checked(declared)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let bound = self.broker.state().bind_queue(queue, exchange, routing_key);
        self.checked(bound)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        if !self.is_open() {
            return Err(RabbitMQError::PublishFailure(format!(
                "channel {} is closed",
                self.channel_id
            )));
        }
        let published = self
            .broker
            .state()
            .publish(exchange, routing_key, body, properties);
        self.checked(published)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        mode: AckMode,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let registered = self.register_consumer(queue, consumer_tag, mode, sender);
        self.checked(registered)?;

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        let settled = self.broker.state().settle(delivery_tag, false);
        self.checked(settled)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        let settled = self.broker.state().settle(delivery_tag, requeue);
        self.checked(settled)
    }

    async fn delete_queue(&self, name: &str) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.broker.state().delete_queue(name))
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}
