// Broker-facing behaviour exercised end to end against the in-process broker.
// Tests marked #[ignore] need a RabbitMQ instance at AMQP_ADDR.

mod catalog_test;
mod consumer_test;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use catalog_rabbitmq::rabbitmq::{Delivery, HandlerError, MessageHandler};

pub const RETRY: Duration = Duration::from_millis(20);

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Records every body it sees and panics on the body `"panic"`.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    pub bodies: Arc<Mutex<Vec<Vec<u8>>>>,
    pub calls: Arc<AtomicUsize>,
}

impl RecordingHandler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if delivery.data == br#""panic""# {
            panic!("handler exploded");
        }
        if delivery.data == br#""fail""# {
            return Err(HandlerError::Processing("refused".to_string()));
        }
        self.bodies.lock().unwrap().push(delivery.data);
        Ok(())
    }
}
