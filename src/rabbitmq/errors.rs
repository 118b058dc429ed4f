// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Provider `{0}` does not declare any consumers")]
    MissingCapability(String),

    #[error("Topology conflict: {0}")]
    TopologyConflict(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishFailure(String),

    #[error("RPC call timed out after {0:?}")]
    CallTimeout(Duration),

    #[error("Correlation id already in flight: {0}")]
    DuplicateCorrelation(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Handler error: {0}")]
    HandlerError(String),

    #[error("Dispatcher is not running")]
    DispatcherStopped,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Wraps any displayable error raised by application handler code.
    pub fn handler(error: impl std::fmt::Display) -> Self {
        RabbitMQError::HandlerError(error.to_string())
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();
        classify(error_text)
    }
}

pub(crate) fn classify(error_text: String) -> RabbitMQError {
    if error_text.contains("PRECONDITION_FAILED") || error_text.contains("inequivalent arg") {
        RabbitMQError::TopologyConflict(error_text)
    } else if error_text.contains("connection") {
        RabbitMQError::ConnectionError(error_text)
    } else if error_text.contains("channel") {
        RabbitMQError::ChannelError(error_text)
    } else if error_text.contains("publish") {
        RabbitMQError::PublishFailure(error_text)
    } else if error_text.contains("consume") {
        RabbitMQError::ConsumeError(error_text)
    } else if error_text.contains("ack") || error_text.contains("nack") {
        RabbitMQError::AckError(error_text)
    } else {
        RabbitMQError::Unknown(error_text)
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::ConnectionError("Connection timed out".to_string())
    }
}

impl From<std::env::VarError> for RabbitMQError {
    fn from(err: std::env::VarError) -> Self {
        RabbitMQError::ConfigurationError(format!("Environment variable error: {}", err))
    }
}

impl From<std::num::ParseIntError> for RabbitMQError {
    fn from(err: std::num::ParseIntError) -> Self {
        RabbitMQError::ConfigurationError(format!("Parse error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_failures_are_topology_conflicts() {
        let err = classify(
            "PRECONDITION_FAILED - inequivalent arg 'durable' for queue 'orders'".to_string(),
        );
        assert!(matches!(err, RabbitMQError::TopologyConflict(_)));
    }

    #[test]
    fn classification_falls_back_to_unknown() {
        assert!(matches!(
            classify("channel closed".to_string()),
            RabbitMQError::ChannelError(_)
        ));
        assert!(matches!(
            classify("something odd".to_string()),
            RabbitMQError::Unknown(_)
        ));
    }

    #[test]
    fn timeout_message_names_the_deadline() {
        let err = RabbitMQError::CallTimeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "RPC call timed out after 250ms");
    }
}
