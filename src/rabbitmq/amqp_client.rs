// src/rabbitmq/amqp_client.rs
//
// The seam between the resilience layer and whatever speaks AMQP on the wire.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::closure::ClosureNotifier;
use super::errors::Result;

/// A queue name plus the flags it is declared with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

impl QueueDescriptor {
    /// Durable, shared, never auto-deleted.
    pub fn durable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
        }
    }

    /// Whether redeclaring `other` against an existing `self` is a no-op.
    ///
    /// `no_wait` only changes how the broker answers, not the queue.
    pub fn flags_match(&self, other: &QueueDescriptor) -> bool {
        self.name == other.name
            && self.durable == other.durable
            && self.auto_delete == other.auto_delete
            && self.exclusive == other.exclusive
    }
}

/// An inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Message properties attached on publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: String,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub persistent: bool,
}

impl PublishProperties {
    pub fn new(content_type: &str) -> Self {
        Self {
            content_type: content_type.to_string(),
            message_id: None,
            timestamp: None,
            persistent: false,
        }
    }

    pub fn with_message_id(mut self, message_id: String) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_persistence(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Establishes connections to the broker.
#[async_trait]
pub trait AmqpDialer: Send + Sync + 'static {
    type Connection: AmqpConnection;

    /// TCP connect plus protocol handshake.
    async fn dial(&self) -> Result<Self::Connection>;
}

/// A live broker connection.
#[async_trait]
pub trait AmqpConnection: Send + Sync + 'static {
    type Channel: AmqpChannel;

    async fn open_channel(&self) -> Result<Self::Channel>;

    /// Fire `notifier` when the connection goes away underneath us.
    fn on_closed(&self, notifier: Arc<ClosureNotifier>);

    async fn close(&self) -> Result<()>;
}

/// A channel on a live connection. Clones share the same broker channel.
#[async_trait]
pub trait AmqpChannel: Clone + Debug + Send + Sync + 'static {
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<()>;

    /// Publish on the default exchange.
    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()>;

    /// Start an auto-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}
