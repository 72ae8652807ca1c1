// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("RabbitMQ unavailable at {uri} after {attempts} attempt(s): {source}")]
    Unavailable {
        uri: String,
        attempts: u32,
        #[source]
        source: LapinError,
    },

    #[error("Invalid broker URI: {0}")]
    InvalidUri(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Failed to declare topology: {0}")]
    Topology(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Consumer is already running")]
    AlreadyRunning,
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Exchange '{exchange}' already exists with incompatible parameters: {reason}")]
    ExchangeConflict { exchange: String, reason: String },

    #[error("RabbitMQ publish error: {0}")]
    Publish(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),
}

/// True when the broker refused a declaration because an entity with the same
/// name exists with different arguments (AMQP 406 PRECONDITION_FAILED).
pub(crate) fn is_precondition_failed(error: &LapinError) -> bool {
    // Use string representation for classification
    let error_text = error.to_string();
    error_text.contains("PRECONDITION_FAILED") || error_text.contains("inequivalent arg")
}
