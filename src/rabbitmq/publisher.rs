use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, AmqpDialer, PublishProperties, QueueDescriptor};
use super::connection::ConnectionManager;
use super::errors::Result;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes payloads to named queues over the manager's current link.
///
/// There is no retry here: if the link is down the call fails right away and
/// the caller decides what to do.
pub struct Publisher<D: AmqpDialer> {
    connection_manager: Arc<ConnectionManager<D>>,
    content_type: String,
    persistent: bool,
}

impl<D: AmqpDialer> Clone for Publisher<D> {
    fn clone(&self) -> Self {
        Self {
            connection_manager: self.connection_manager.clone(),
            content_type: self.content_type.clone(),
            persistent: self.persistent,
        }
    }
}

impl<D: AmqpDialer> Publisher<D> {
    pub fn new(connection_manager: Arc<ConnectionManager<D>>) -> Self {
        Self {
            connection_manager,
            content_type: JSON_CONTENT_TYPE.to_string(),
            persistent: true,
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    /// Mark published messages persistent (delivery mode 2).
    pub fn with_persistence(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Declare `queue_name` (durable, idempotent) and publish `payload` to it.
    pub async fn publish(&self, queue_name: &str, payload: &[u8]) -> Result<()> {
        let channel = self.connection_manager.channel().await?;

        channel
            .declare_queue(&QueueDescriptor::durable(queue_name))
            .await
            .inspect_err(|e| error!(queue = queue_name, error = %e, "Error declaring queue"))?;

        let properties = PublishProperties::new(&self.content_type)
            .with_message_id(Uuid::new_v4().to_string())
            .with_timestamp(chrono::Utc::now().timestamp() as u64)
            .with_persistence(self.persistent);

        channel
            .publish(queue_name, payload, &properties)
            .await
            .inspect_err(|e| error!(queue = queue_name, error = %e, "Error publishing message"))?;

        info!(queue = queue_name, bytes = payload.len(), "Message published to queue");
        Ok(())
    }

    /// Serialize `message` as JSON and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(&self, queue_name: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.publish(queue_name, &payload).await
    }
}
