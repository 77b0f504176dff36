// src/rabbitmq/handler.rs

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::amqp_client::Delivery;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Failed to process message: {0}")]
    Processing(String),
}

/// Per-delivery decode-and-act step driven by the consumer loop.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError>;
}

/// Run one handler invocation behind a fault boundary.
///
/// Errors and panics are logged here and go no further.
pub async fn dispatch_isolated<H: MessageHandler + ?Sized>(handler: Arc<H>, delivery: Delivery) {
    let delivery_tag = delivery.delivery_tag;
    let outcome = AssertUnwindSafe(handler.handle(delivery)).catch_unwind().await;

    match outcome {
        Ok(Ok(())) => debug!(delivery_tag, "Message handled"),
        Ok(Err(HandlerError::Decode(e))) => {
            warn!(delivery_tag, error = %e, "Failed to unmarshal message")
        }
        Ok(Err(e)) => error!(delivery_tag, error = %e, "Error processing message"),
        Err(panic) => error!(
            delivery_tag,
            panic = %panic_message(panic.as_ref()),
            "Message handler panicked"
        ),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The image-processing business logic lives behind this.
#[async_trait]
pub trait ImageProcessor: Send + Sync + 'static {
    async fn process(&self, image_urls: Vec<String>) -> Result<(), HandlerError>;
}

/// Logs each image it is asked to process.
#[derive(Debug, Clone, Default)]
pub struct LoggingImageProcessor;

#[async_trait]
impl ImageProcessor for LoggingImageProcessor {
    async fn process(&self, image_urls: Vec<String>) -> Result<(), HandlerError> {
        info!(count = image_urls.len(), "Processing images");
        for url in &image_urls {
            info!(%url, "Processing image");
        }
        Ok(())
    }
}

/// Decodes a JSON array of image URLs and hands it to an [`ImageProcessor`].
#[derive(Debug, Clone)]
pub struct ImageProcessingHandler<P> {
    processor: P,
}

impl<P: ImageProcessor> ImageProcessingHandler<P> {
    pub fn new(processor: P) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl<P: ImageProcessor> MessageHandler for ImageProcessingHandler<P> {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        let image_urls: Vec<String> = serde_json::from_slice(&delivery.data)?;
        self.processor.process(image_urls).await
    }
}
