//! Synchronous request/response calls over RabbitMQ.
//!
//! Providers register handlers against queues or topic bindings; callers
//! publish a request and wait for the reply on a private queue, matched
//! back by correlation id.

pub mod config;
pub mod rabbitmq;

pub use config::BrokerConfig;
pub use rabbitmq::{
    BindingDescriptor, Delivery, HandlerRegistry, InMemoryBroker, MessageHandler,
    RabbitMQClient, RabbitMQClientBuilder, RabbitMQError, Result, RpcProvider,
};
