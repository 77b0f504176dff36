// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Failed to declare queue '{queue}': {reason}")]
    DeclareError { queue: String, reason: String },

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ link is down")]
    LinkDown,

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// True for failures raised while dialing or opening the channel.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_)
                | RabbitMQError::ChannelError(_)
                | RabbitMQError::TimeoutError(_)
        )
    }

    pub(crate) fn declare(queue: &str, reason: impl ToString) -> Self {
        RabbitMQError::DeclareError {
            queue: queue.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}
