// src/rabbitmq/lapin_client.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info};

use super::amqp_client::{
    AmqpChannel, AmqpConnection, AmqpDialer, Delivery, DeliveryStream, PublishProperties,
    QueueDescriptor,
};
use super::closure::ClosureNotifier;
use super::errors::{RabbitMQError, Result};

const REPLY_SUCCESS: u16 = 200;

/// Configuration applied to every channel we open
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            confirm_mode: true,
        }
    }
}

/// Dials a RabbitMQ broker with lapin.
#[derive(Debug, Clone)]
pub struct LapinDialer {
    uri: String,
    connect_timeout: Duration,
    channel_config: ChannelConfig,
}

impl LapinDialer {
    pub fn new(uri: &str, connect_timeout: Duration, channel_config: ChannelConfig) -> Self {
        Self {
            uri: uri.to_string(),
            connect_timeout,
            channel_config,
        }
    }
}

#[async_trait]
impl AmqpDialer for LapinDialer {
    type Connection = LapinConnection;

    async fn dial(&self) -> Result<LapinConnection> {
        debug!(timeout = ?self.connect_timeout, "Connecting to RabbitMQ");

        let connection = tokio::time::timeout(
            self.connect_timeout,
            Connection::connect(&self.uri, ConnectionProperties::default()),
        )
        .await?
        .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {}", e)))?;

        Ok(LapinConnection {
            connection,
            channel_config: self.channel_config.clone(),
        })
    }
}

pub struct LapinConnection {
    connection: Connection,
    channel_config: ChannelConfig,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    type Channel = LapinChannel;

    async fn open_channel(&self) -> Result<LapinChannel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;

        // Configure QoS if specified
        if self.channel_config.prefetch_count > 0 {
            debug!("Setting channel QoS to {}", self.channel_config.prefetch_count);
            channel
                .basic_qos(self.channel_config.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))?;
        }

        if self.channel_config.confirm_mode {
            debug!(channel_id = channel.id(), "Enabling confirm mode");
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
                })?;
        }

        info!(channel_id = channel.id(), "Channel created and configured");
        Ok(LapinChannel {
            channel,
            confirm_mode: self.channel_config.confirm_mode,
        })
    }

    fn on_closed(&self, notifier: Arc<ClosureNotifier>) {
        self.connection.on_error(move |err| {
            notifier.notify(Some(err.to_string()));
        });
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "Closing connection")
            .await
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))
    }
}

#[derive(Clone)]
pub struct LapinChannel {
    channel: Channel,
    confirm_mode: bool,
}

impl fmt::Debug for LapinChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LapinChannel")
            .field("id", &self.channel.id())
            .field("confirm_mode", &self.confirm_mode)
            .finish()
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<()> {
        let declared = self
            .channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    nowait: queue.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::declare(&queue.name, e))?;

        debug!(
            queue = %queue.name,
            messages = declared.message_count(),
            consumers = declared.consumer_count(),
            "Queue declared"
        );
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()> {
        let mut basic = BasicProperties::default()
            .with_content_type(properties.content_type.as_str().into());
        if let Some(message_id) = &properties.message_id {
            basic = basic.with_message_id(message_id.as_str().into());
        }
        if let Some(timestamp) = properties.timestamp {
            basic = basic.with_timestamp(timestamp);
        }
        if properties.persistent {
            basic = basic.with_delivery_mode(2);
        }

        let confirm = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                payload,
                basic,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        if self.confirm_mode {
            let confirmation = confirm
                .await
                .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
            if confirmation.is_nack() {
                return Err(RabbitMQError::PublishError(format!(
                    "Broker rejected message for '{}'",
                    routing_key
                )));
            }
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(Delivery::from)
                    .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
            })
            .boxed())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "Closing channel")
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
            content_type: delivery
                .properties
                .content_type()
                .as_ref()
                .map(|content_type| content_type.as_str().to_string()),
            data: delivery.data,
        }
    }
}
