// src/rabbitmq/message.rs
// Broker-neutral message, delivery and declaration types

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

use super::errors::Result;

/// Transport-level properties carried alongside a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// Unix timestamp in seconds.
    pub timestamp: Option<u64>,
}

impl MessageProperties {
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Properties for a JSON payload stamped with the current time.
    pub fn json() -> Self {
        Self::default()
            .with_content_type("application/json")
            .with_timestamp(chrono::Utc::now().timestamp() as u64)
    }
}

/// A message handed to a consumer, with the method metadata of its delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Acknowledgement mode of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Deliveries stay unacknowledged until the consumer acks or nacks them.
    #[default]
    Ack,
    /// Deliveries count as acknowledged as soon as they are sent.
    NoAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

/// Value of an `x-` queue argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgumentValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

pub type QueueArguments = BTreeMap<String, ArgumentValue>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: QueueArguments,
}

impl QueueOptions {
    /// Anonymous reply queue scoped to one call.
    pub fn ephemeral() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
            ..Self::default()
        }
    }

    /// Queue bound to a topic exchange.
    pub fn topic_bound() -> Self {
        Self {
            durable: true,
            auto_delete: true,
            ..Self::default()
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: ArgumentValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}
