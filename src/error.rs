//! Error types for the bridge.

use thiserror::Error;

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur in the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("This link must be a sender")]
    InvalidLinkRole,

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("AMQP error: {0}")]
    Amqp(String),

    #[error("Conversion error: {0}")]
    Convert(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
