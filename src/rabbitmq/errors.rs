// src/rabbitmq/errors.rs

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("Connection failed to {url}")]
    ConnectionError {
        url: String,
        #[source]
        source: LapinError,
    },

    #[error("Not connected to RabbitMQ, connect(url) must succeed first")]
    NotConnected,

    #[error("Exchange {0} does not exist")]
    ExchangeNotFound(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(#[source] LapinError),

    #[error("Failed to declare {entity}: {source}")]
    DeclareError {
        entity: String,
        #[source]
        source: LapinError,
    },

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(#[source] LapinError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(#[source] LapinError),

    #[error("Relay already started, close it before starting again")]
    AlreadyStarted,

    /// Broker or client failure passed through as lapin reported it.
    #[error(transparent)]
    Amqp(#[from] LapinError),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// True for the per-operation "exchange missing" failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RabbitMQError::ExchangeNotFound(_))
    }
}

/// Whether the broker answered with a 404 (NOT_FOUND) channel exception.
pub(crate) fn is_not_found_reply(error: &LapinError) -> bool {
    match error {
        LapinError::ProtocolError(amqp_error) => {
            matches!(amqp_error.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
        }
        _ => false,
    }
}
