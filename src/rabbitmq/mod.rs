// src/rabbitmq/mod.rs
// Broker link, publisher and self-healing consumer

pub mod amqp_client;
pub mod closure;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod handler;
pub mod lapin_client;
pub mod memory;
pub mod policy;
pub mod publisher;
pub mod supervisor;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{
    AmqpChannel, AmqpConnection, AmqpDialer, Delivery, DeliveryStream, PublishProperties,
    QueueDescriptor,
};
pub use closure::{closure_pair, ClosureNotifier, ClosureSignal};
pub use connection::ConnectionManager;
pub use consumer::{ConsumerLoop, ConsumerState};
pub use errors::{RabbitMQError, Result};
pub use handler::{
    dispatch_isolated, HandlerError, ImageProcessingHandler, ImageProcessor,
    LoggingImageProcessor, MessageHandler,
};
pub use lapin_client::{ChannelConfig, LapinDialer};
pub use memory::MemoryBroker;
pub use policy::ReconnectPolicy;
pub use publisher::Publisher;
pub use supervisor::spawn_supervised;
