// src/rabbitmq/dispatcher.rs
// Demultiplexes deliveries from every consumed queue

use futures::stream::{SelectAll, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::{BrokerChannel, DeliveryStream};
use super::correlation::CorrelationTable;
use super::errors::{RabbitMQError, Result};
use super::message::{AckMode, Delivery, MessageProperties};
use super::registry::{HandlerEntry, HandlerRegistry};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Requeue deliveries whose handler failed. Off by default so a poison
    /// message cannot spin forever.
    pub requeue_on_error: bool,
    pub consumer_tag_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            requeue_on_error: false,
            consumer_tag_prefix: "rabbit-rpc".to_string(),
        }
    }
}

#[derive(Clone)]
enum Source {
    Handler { index: usize, queue: Arc<str> },
    Reply { queue: Arc<str> },
}

type TaggedStream = futures::stream::BoxStream<'static, (Source, Result<Delivery>)>;

enum Command {
    AttachReply { queue: String, stream: DeliveryStream },
}

pub struct Dispatcher {
    channel: Arc<dyn BrokerChannel>,
    registry: Arc<HandlerRegistry>,
    correlations: Arc<CorrelationTable>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        registry: Arc<HandlerRegistry>,
        correlations: Arc<CorrelationTable>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            channel,
            registry,
            correlations,
            config,
        }
    }

    fn consumer_tag(&self) -> String {
        format!(
            "{}-{}",
            self.config.consumer_tag_prefix,
            &Uuid::new_v4().simple().to_string()[..8]
        )
    }

    /// Starts a consumer for every registry entry and spawns the delivery
    /// loop. `queues[i]` is the declared name of entry `i`'s queue.
    pub async fn start(self, queues: &[String]) -> Result<DispatcherHandle> {
        let mut streams: SelectAll<TaggedStream> = SelectAll::new();
        for (index, (entry, queue)) in self.registry.entries().iter().zip(queues).enumerate() {
            let stream = self
                .channel
                .consume(queue, &self.consumer_tag(), entry.ack_mode)
                .await?;
            let source = Source::Handler {
                index,
                queue: Arc::from(queue.as_str()),
            };
            streams.push(tag(stream, source));
            info!(queue = %queue, ack_mode = ?entry.ack_mode, "Started consuming from queue");
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let channel = self.channel.clone();
        let tag_prefix = self.config.consumer_tag_prefix.clone();
        let task = tokio::spawn(self.run(streams, command_rx, shutdown_rx));

        Ok(DispatcherHandle {
            replies: ReplyRouter {
                channel,
                commands,
                tag_prefix,
            },
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }

    async fn run(
        self,
        mut streams: SelectAll<TaggedStream>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        info!(consumers = streams.len(), "Dispatcher running");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                command = commands.recv() => match command {
                    Some(Command::AttachReply { queue, stream }) => {
                        debug!(queue = %queue, "Reply queue attached");
                        // exactly one reply is expected per queue
                        let source = Source::Reply { queue: Arc::from(queue) };
                        streams.push(tag(stream.take(1).boxed(), source));
                    }
                    None => break,
                },
                Some((source, delivery)) = streams.next(), if !streams.is_empty() => {
                    self.dispatch(source, delivery);
                }
            }
        }
        info!("Dispatcher stopped");
    }

    fn dispatch(&self, source: Source, delivery: Result<Delivery>) {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                error!("Error receiving message: {}", e);
                return;
            }
        };

        match source {
            Source::Reply { queue } => match delivery.properties.correlation_id.as_deref() {
                Some(correlation_id) => {
                    self.correlations.resolve(correlation_id, delivery.body);
                }
                None => {
                    warn!(queue = %queue, "Stray reply without correlation id, dropping");
                }
            },
            Source::Handler { index, queue } => {
                let Some(entry) = self.registry.entries().get(index).cloned() else {
                    error!(queue = %queue, index, "Delivery for unknown handler");
                    return;
                };
                let channel = self.channel.clone();
                let requeue = self.config.requeue_on_error;
                tokio::spawn(handle_delivery(channel, entry, queue, delivery, requeue));
            }
        }
    }
}

fn tag(stream: DeliveryStream, source: Source) -> TaggedStream {
    stream.map(move |delivery| (source.clone(), delivery)).boxed()
}

async fn handle_delivery(
    channel: Arc<dyn BrokerChannel>,
    entry: HandlerEntry,
    queue: Arc<str>,
    delivery: Delivery,
    requeue_on_error: bool,
) {
    let delivery_tag = delivery.delivery_tag;
    let reply_to = delivery.properties.reply_to.clone();
    let correlation_id = delivery.properties.correlation_id.clone();
    let acked = entry.ack_mode == AckMode::Ack;

    // a panic stays inside the handler's own task
    let handler = entry.handler.clone();
    let outcome = match tokio::spawn(async move { handler.handle(delivery).await }).await {
        Ok(result) => result,
        Err(_) => Err(RabbitMQError::HandlerError("handler panicked".to_string())),
    };

    match outcome {
        Ok(reply) => {
            if let (Some(body), Some(reply_to)) = (reply, reply_to.as_deref()) {
                let mut properties = MessageProperties::default();
                if let Some(correlation_id) = correlation_id {
                    properties = properties.with_correlation_id(correlation_id);
                }
                if let Err(e) = channel.publish("", reply_to, &body, &properties).await {
                    error!(queue = %queue, reply_to = %reply_to, "Failed to send response: {}", e);
                    if acked {
                        if let Err(e) = channel.nack(delivery_tag, true).await {
                            error!("Failed to negatively acknowledge message: {}", e);
                        }
                    }
                    return;
                }
                debug!(queue = %queue, reply_to = %reply_to, "Response sent");
            }
            if acked {
                if let Err(e) = channel.ack(delivery_tag).await {
                    error!("Failed to acknowledge message: {}", e);
                }
            }
        }
        Err(e) => {
            error!(queue = %queue, "Error processing message: {}", e);
            if acked {
                if let Err(e) = channel.nack(delivery_tag, requeue_on_error).await {
                    error!("Failed to negatively acknowledge message: {}", e);
                }
            }
        }
    }
}

/// Hands reply queues to a running dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct ReplyRouter {
    channel: Arc<dyn BrokerChannel>,
    commands: mpsc::UnboundedSender<Command>,
    tag_prefix: String,
}

impl ReplyRouter {
    /// Starts a no-ack consumer on `queue` and routes its single reply to
    /// the correlation table. Returns once the consumer exists.
    pub async fn attach(&self, queue: &str) -> Result<()> {
        if self.commands.is_closed() {
            return Err(RabbitMQError::DispatcherStopped);
        }
        let consumer_tag = format!(
            "{}-reply-{}",
            self.tag_prefix,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let stream = self
            .channel
            .consume(queue, &consumer_tag, AckMode::NoAck)
            .await?;
        self.commands
            .send(Command::AttachReply {
                queue: queue.to_string(),
                stream,
            })
            .map_err(|_| RabbitMQError::DispatcherStopped)
    }
}

/// Control side of a running dispatcher.
pub struct DispatcherHandle {
    replies: ReplyRouter,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn replies(&self) -> ReplyRouter {
        self.replies.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the delivery loop and waits for it to exit. Handler tasks
    /// already spawned run to completion.
    pub async fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Dispatcher task failed: {}", e);
            }
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
