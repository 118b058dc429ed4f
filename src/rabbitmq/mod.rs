// src/rabbitmq/mod.rs
// Synchronous RPC on top of RabbitMQ

pub mod errors;
pub mod message;
pub mod channel;
pub mod channel_manager;
pub mod topic;
pub mod topology;
pub mod correlation;
pub mod registry;
pub mod dispatcher;
pub mod request_response;
pub mod client;
pub mod connection;
pub mod amqp_client;
pub mod memory;

// Re-export specific items to simplify imports elsewhere
pub use channel::{BrokerChannel, BrokerConnection, DeliveryStream};
pub use channel_manager::ChannelManager;
pub use client::{RabbitMQClient, RabbitMQClientBuilder};
pub use connection::ConnectionManager;
pub use correlation::CorrelationTable;
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, ReplyRouter};
pub use errors::{RabbitMQError, Result};
pub use memory::InMemoryBroker;
pub use message::{AckMode, Delivery, ExchangeKind, MessageProperties, QueueOptions};
pub use registry::{HandlerRegistry, HandlerResult, JsonHandler, MessageHandler, RpcProvider};
pub use request_response::SyncCallBridge;
pub use topology::{BindingDescriptor, ExchangeType, TopologyManager};
