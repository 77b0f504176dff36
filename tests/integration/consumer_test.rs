use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use catalog_rabbitmq::rabbitmq::{
    spawn_supervised, AmqpChannel, ConnectionManager, ConsumerLoop, ConsumerState, HandlerError,
    Delivery, ImageProcessingHandler, ImageProcessor, MemoryBroker, MessageHandler,
    QueueDescriptor, ReconnectPolicy,
};

use crate::{eventually, RecordingHandler, RETRY};

const QUEUE: &str = "image_processing";

struct Running<H: MessageHandler> {
    consumer: Arc<ConsumerLoop<MemoryBroker, H>>,
    shutdown: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl<H: MessageHandler> Running<H> {
    async fn start(broker: &MemoryBroker, handler: H) -> Self {
        let running = Self::spawn(broker, handler).await;
        running.until_consuming().await;
        running
    }

    async fn spawn(broker: &MemoryBroker, handler: H) -> Self {
        let manager = Arc::new(ConnectionManager::connect(broker.clone()).await.unwrap());
        let consumer = Arc::new(ConsumerLoop::new(
            manager,
            handler,
            QueueDescriptor::durable(QUEUE),
            ReconnectPolicy::fixed(RETRY),
        ));
        let shutdown = CancellationToken::new();
        let supervisor = spawn_supervised("test-consumer", RETRY, shutdown.clone(), {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            move || {
                let consumer = consumer.clone();
                let shutdown = shutdown.clone();
                async move { consumer.run(shutdown).await }
            }
        });

        Self {
            consumer,
            shutdown,
            supervisor,
        }
    }

    async fn until_consuming(&self) {
        let consumer = self.consumer.clone();
        eventually(move || consumer.state() == ConsumerState::Consuming).await;
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.supervisor.await.unwrap();
        assert_eq!(self.consumer.state(), ConsumerState::Disconnected);
    }
}

#[tokio::test]
async fn resumes_consuming_after_broker_outage() {
    let broker = MemoryBroker::new();
    let handler = RecordingHandler::default();
    let running = Running::start(&broker, handler.clone()).await;

    broker.set_reachable(false);
    broker.drop_connections();

    // Keeps retrying at the configured interval while the broker is away.
    eventually(|| broker.dial_count() >= 4).await;
    assert_ne!(running.consumer.state(), ConsumerState::Consuming);

    broker.set_reachable(true);
    running.until_consuming().await;

    broker.inject(QUEUE, br#"["url1"]"#);
    eventually(|| handler.calls() == 1).await;
    assert_eq!(handler.bodies(), vec![br#"["url1"]"#.to_vec()]);

    running.stop().await;
}

#[tokio::test]
async fn survives_repeated_closures() {
    let broker = MemoryBroker::new();
    let handler = RecordingHandler::default();
    let running = Running::start(&broker, handler.clone()).await;

    for round in 1..=3u64 {
        broker.drop_connections();
        eventually(|| broker.dial_count() == round + 1).await;
        running.until_consuming().await;
    }

    broker.inject(QUEUE, b"[]");
    eventually(|| handler.calls() == 1).await;
    assert_eq!(broker.open_connections(), 1);

    running.stop().await;
}

#[tokio::test]
async fn handler_faults_do_not_stop_later_deliveries() {
    let broker = MemoryBroker::new();
    let handler = RecordingHandler::default();
    let running = Running::start(&broker, handler.clone()).await;

    broker.inject(QUEUE, br#""panic""#);
    broker.inject(QUEUE, br#""fail""#);
    broker.inject(QUEUE, br#"["next"]"#);

    eventually(|| handler.calls() == 3).await;
    eventually(|| handler.bodies() == vec![br#"["next"]"#.to_vec()]).await;
    assert_eq!(running.consumer.state(), ConsumerState::Consuming);
    assert_eq!(broker.dial_count(), 1);

    running.stop().await;
}

#[derive(Clone, Default)]
struct CollectingProcessor {
    batches: Arc<Mutex<Vec<Vec<String>>>>,
}

#[async_trait]
impl ImageProcessor for CollectingProcessor {
    async fn process(&self, image_urls: Vec<String>) -> Result<(), HandlerError> {
        self.batches.lock().unwrap().push(image_urls);
        Ok(())
    }
}

#[tokio::test]
async fn malformed_image_message_is_skipped() {
    let broker = MemoryBroker::new();
    let processor = CollectingProcessor::default();
    let running = Running::start(&broker, ImageProcessingHandler::new(processor.clone())).await;

    broker.inject(QUEUE, b"{not json}");
    broker.inject(QUEUE, br#"["url1","url2"]"#);

    eventually(|| processor.batches.lock().unwrap().len() == 1).await;
    assert_eq!(
        processor.batches.lock().unwrap()[0],
        vec!["url1".to_string(), "url2".to_string()]
    );
    assert_eq!(running.consumer.state(), ConsumerState::Consuming);

    running.stop().await;
}

#[tokio::test]
async fn messages_published_before_consumer_starts_are_delivered() {
    let broker = MemoryBroker::new();
    {
        let manager = ConnectionManager::connect(broker.clone()).await.unwrap();
        let channel = manager.channel().await.unwrap();
        channel.declare_queue(&QueueDescriptor::durable(QUEUE)).await.unwrap();
        manager.close().await;
    }
    broker.inject(QUEUE, br#"["early"]"#);

    let handler = RecordingHandler::default();
    let running = Running::start(&broker, handler.clone()).await;

    eventually(|| handler.calls() == 1).await;
    assert_eq!(handler.bodies(), vec![br#"["early"]"#.to_vec()]);

    running.stop().await;
}

#[tokio::test]
async fn conflicting_declare_reconnects_at_the_retry_interval() {
    let broker = MemoryBroker::new();
    {
        let manager = ConnectionManager::connect(broker.clone()).await.unwrap();
        let channel = manager.channel().await.unwrap();
        let transient = QueueDescriptor {
            durable: false,
            ..QueueDescriptor::durable(QUEUE)
        };
        channel.declare_queue(&transient).await.unwrap();
        manager.close().await;
    }
    let dials_before = broker.dial_count();

    let running = Running::spawn(&broker, RecordingHandler::default()).await;
    tokio::time::sleep(RETRY * 10).await;

    // Every failed declare closes the channel and costs one redial, no faster
    // than once per interval.
    let dials = broker.dial_count() - dials_before;
    assert!(dials >= 3, "expected the consumer to keep reconnecting, saw {} dials", dials);
    assert!(dials <= 12, "reconnected {} times within ten retry intervals", dials);
    assert_ne!(running.consumer.state(), ConsumerState::Consuming);
    assert!(!broker.queue(QUEUE).unwrap().durable);

    running.stop().await;
}

#[tokio::test]
async fn refused_consume_reconnects_after_a_pause() {
    let broker = MemoryBroker::new();
    broker.fail_next_consumes(1);

    let started = Instant::now();
    let handler = RecordingHandler::default();
    let running = Running::start(&broker, handler.clone()).await;

    assert!(started.elapsed() >= RETRY);
    assert_eq!(broker.dial_count(), 2);

    broker.inject(QUEUE, b"[]");
    eventually(|| handler.calls() == 1).await;

    running.stop().await;
}

/// Blocks inside `handle` far longer than any test runs.
#[derive(Clone, Default)]
struct StuckHandler {
    entered: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageHandler for StuckHandler {
    async fn handle(&self, _delivery: Delivery) -> Result<(), HandlerError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn slow_handler_does_not_delay_closure_detection() {
    let broker = MemoryBroker::new();
    let handler = StuckHandler::default();
    let running = Running::start(&broker, handler.clone()).await;

    broker.inject(QUEUE, b"[]");
    eventually(|| handler.entered.load(Ordering::SeqCst) == 1).await;

    broker.drop_connections();
    eventually(|| broker.dial_count() == 2).await;
    running.until_consuming().await;

    broker.inject(QUEUE, b"[]");
    eventually(|| handler.entered.load(Ordering::SeqCst) == 2).await;

    running.stop().await;
}
