//! In-process broker implementing the AMQP seam.
//!
//! Behaves like a single RabbitMQ node for the parts the resilience layer
//! touches: idempotent declares, default-exchange routing and auto-ack
//! consumers. Faults (outages, forced closes, failing declares) can be
//! injected, which makes it the backbone of the reconnect tests and a handy
//! stand-in for local development.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use tracing::debug;

use super::amqp_client::{
    AmqpChannel, AmqpConnection, AmqpDialer, Delivery, DeliveryStream, PublishProperties,
    QueueDescriptor,
};
use super::closure::ClosureNotifier;
use super::errors::{RabbitMQError, Result};

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    dials: u64,
    declares: u64,
    failing_declares: u32,
    failing_consumes: u32,
    next_connection_id: u64,
    queues: HashMap<String, MemoryQueue>,
    connections: Vec<Arc<ConnectionShared>>,
}

struct MemoryQueue {
    descriptor: QueueDescriptor,
    ready: VecDeque<Delivery>,
    consumers: Vec<MemoryConsumer>,
    next_delivery_tag: u64,
    cursor: usize,
}

struct MemoryConsumer {
    connection_id: u64,
    channel_open: Arc<AtomicBool>,
    sender: UnboundedSender<Result<Delivery>>,
}

struct ConnectionShared {
    id: u64,
    open: AtomicBool,
    notifiers: Mutex<Vec<Arc<ClosureNotifier>>>,
}

impl ConnectionShared {
    fn shut(&self, reason: Option<String>) {
        self.open.store(false, Ordering::Release);
        let notifiers = std::mem::take(&mut *lock(&self.notifiers));
        for notifier in notifiers {
            notifier.notify(reason.clone());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryQueue {
    fn new(descriptor: QueueDescriptor) -> Self {
        Self {
            descriptor,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_delivery_tag: 1,
            cursor: 0,
        }
    }

    fn enqueue(&mut self, content_type: Option<String>, data: Vec<u8>) {
        let delivery = Delivery {
            delivery_tag: self.next_delivery_tag,
            routing_key: self.descriptor.name.clone(),
            redelivered: false,
            content_type,
            data,
        };
        self.next_delivery_tag += 1;
        self.route(delivery);
    }

    // Round-robin over live consumers, buffering when there are none.
    fn route(&mut self, mut delivery: Delivery) {
        self.consumers.retain(|consumer| {
            consumer.channel_open.load(Ordering::Acquire) && !consumer.sender.is_closed()
        });

        while !self.consumers.is_empty() {
            let index = self.cursor % self.consumers.len();
            self.cursor = self.cursor.wrapping_add(1);
            match self.consumers[index].sender.unbounded_send(Ok(delivery)) {
                Ok(()) => return,
                Err(failed) => {
                    delivery = match failed.into_inner() {
                        Ok(delivery) => delivery,
                        Err(_) => return,
                    };
                    self.consumers.remove(index);
                }
            }
        }

        self.ready.push_back(delivery);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Make subsequent dials succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    /// Force-close every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        // Close notifications go out before the delivery streams end.
        for connection in std::mem::take(&mut state.connections) {
            debug!(connection = connection.id, "Forcing connection closed");
            connection.shut(Some(
                "CONNECTION_FORCED - broker forced connection closure".to_string(),
            ));
        }
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }

    /// Fail the next `count` declares without closing the channel.
    pub fn fail_next_declares(&self, count: u32) {
        self.state().failing_declares = count;
    }

    /// Refuse the next `count` consumes with a channel-level error.
    pub fn fail_next_consumes(&self, count: u32) {
        self.state().failing_consumes = count;
    }

    /// Publish as an outside producer would.
    pub fn inject(&self, queue: &str, payload: &[u8]) {
        if let Some(queue) = self.state().queues.get_mut(queue) {
            queue.enqueue(Some("application/json".to_string()), payload.to_vec());
        }
    }

    /// Drain the messages buffered on `queue`.
    pub fn take_messages(&self, queue: &str) -> Vec<Delivery> {
        self.state()
            .queues
            .get_mut(queue)
            .map(|queue| queue.ready.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn queue(&self, name: &str) -> Option<QueueDescriptor> {
        self.state()
            .queues
            .get(name)
            .map(|queue| queue.descriptor.clone())
    }

    pub fn queue_depth(&self, name: &str) -> usize {
        self.state()
            .queues
            .get(name)
            .map_or(0, |queue| queue.ready.len())
    }

    pub fn dial_count(&self) -> u64 {
        self.state().dials
    }

    pub fn declare_count(&self) -> u64 {
        self.state().declares
    }

    pub fn open_connections(&self) -> usize {
        self.state()
            .connections
            .iter()
            .filter(|connection| connection.open.load(Ordering::Acquire))
            .count()
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryBroker")
            .field("reachable", &!state.unreachable)
            .field("queues", &state.queues.len())
            .field("connections", &state.connections.len())
            .finish()
    }
}

#[async_trait]
impl AmqpDialer for MemoryBroker {
    type Connection = MemoryConnection;

    async fn dial(&self) -> Result<MemoryConnection> {
        let mut state = self.state();
        state.dials += 1;
        if state.unreachable {
            return Err(RabbitMQError::ConnectionError(
                "Failed to connect: connection refused".to_string(),
            ));
        }

        state.next_connection_id += 1;
        let shared = Arc::new(ConnectionShared {
            id: state.next_connection_id,
            open: AtomicBool::new(true),
            notifiers: Mutex::new(Vec::new()),
        });
        state.connections.push(shared.clone());

        Ok(MemoryConnection {
            broker: self.clone(),
            shared,
        })
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel> {
        if !self.shared.open.load(Ordering::Acquire) {
            return Err(RabbitMQError::ChannelError(
                "Failed to create channel: connection closed".to_string(),
            ));
        }

        Ok(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.shared.clone(),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    fn on_closed(&self, notifier: Arc<ClosureNotifier>) {
        if self.shared.open.load(Ordering::Acquire) {
            lock(&self.shared.notifiers).push(notifier);
        } else {
            notifier.notify(Some("connection already closed".to_string()));
        }
    }

    async fn close(&self) -> Result<()> {
        let id = self.shared.id;
        {
            let mut state = self.broker.state();
            state.connections.retain(|connection| connection.id != id);
            for queue in state.queues.values_mut() {
                queue.consumers.retain(|consumer| consumer.connection_id != id);
            }
        }
        self.shared.shut(None);
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    connection: Arc<ConnectionShared>,
    open: Arc<AtomicBool>,
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("connection", &self.connection.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RabbitMQError::ChannelError("channel is closed".to_string()))
        }
    }

    // AMQP closes the channel on a channel-level exception.
    fn fail_channel(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<()> {
        self.ensure_open()?;

        let mut state = self.broker.state();
        state.declares += 1;

        if state.failing_declares > 0 {
            state.failing_declares -= 1;
            return Err(RabbitMQError::declare(&queue.name, "injected failure"));
        }

        let equivalent = state
            .queues
            .get(&queue.name)
            .map(|existing| existing.descriptor.flags_match(queue));
        match equivalent {
            Some(true) => Ok(()),
            Some(false) => {
                self.fail_channel();
                Err(RabbitMQError::declare(
                    &queue.name,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                        queue.name
                    ),
                ))
            }
            None => {
                state
                    .queues
                    .insert(queue.name.clone(), MemoryQueue::new(queue.clone()));
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()> {
        if !self.is_open() {
            return Err(RabbitMQError::PublishError("channel is closed".to_string()));
        }

        // The default exchange drops unroutable messages.
        if let Some(queue) = self.broker.state().queues.get_mut(routing_key) {
            queue.enqueue(Some(properties.content_type.clone()), payload.to_vec());
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        if !self.is_open() {
            return Err(RabbitMQError::ConsumeError("channel is closed".to_string()));
        }

        let mut state = self.broker.state();
        if state.failing_consumes > 0 {
            state.failing_consumes -= 1;
            self.fail_channel();
            return Err(RabbitMQError::ConsumeError(format!(
                "ACCESS_REFUSED - queue '{}' in exclusive use",
                queue
            )));
        }
        let Some(target) = state.queues.get_mut(queue) else {
            self.fail_channel();
            return Err(RabbitMQError::ConsumeError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        };

        let (sender, receiver) = unbounded();
        for delivery in target.ready.drain(..) {
            // The receiver is still in hand, so this cannot fail.
            let _ = sender.unbounded_send(Ok(delivery));
        }
        target.consumers.push(MemoryConsumer {
            connection_id: self.connection.id,
            channel_open: self.open.clone(),
            sender,
        });

        Ok(receiver.boxed())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.connection.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        let open = self.open.clone();
        for queue in self.broker.state().queues.values_mut() {
            queue
                .consumers
                .retain(|consumer| !Arc::ptr_eq(&consumer.channel_open, &open));
        }
        Ok(())
    }
}
