use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, AmqpConnection, AmqpDialer, DeliveryStream, QueueDescriptor};
use super::closure::ClosureSignal;
use super::connection::ConnectionManager;
use super::errors::Result;
use super::handler::{dispatch_isolated, MessageHandler};
use super::policy::ReconnectPolicy;

type ChannelOf<D> = <<D as AmqpDialer>::Connection as AmqpConnection>::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Declaring,
    Consuming,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Declaring => "declaring",
            ConsumerState::Consuming => "consuming",
        };
        f.write_str(name)
    }
}

enum Step<C> {
    Disconnected,
    Declaring(ClosureSignal),
    Consuming(C, ClosureSignal),
    Stopped,
}

/// Long-running consumer that survives broker restarts.
///
/// Declares its queue, dispatches every delivery to the handler behind a
/// fault boundary, and goes back to reconnecting whenever the link's
/// closure signal fires. Retries never give up; only `shutdown` ends it.
pub struct ConsumerLoop<D: AmqpDialer, H: MessageHandler> {
    connection_manager: Arc<ConnectionManager<D>>,
    handler: Arc<H>,
    queue: QueueDescriptor,
    policy: ReconnectPolicy,
    state: watch::Sender<ConsumerState>,
}

impl<D: AmqpDialer, H: MessageHandler> ConsumerLoop<D, H> {
    pub fn new(
        connection_manager: Arc<ConnectionManager<D>>,
        handler: H,
        queue: QueueDescriptor,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            connection_manager,
            handler: Arc::new(handler),
            queue,
            policy,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn queue(&self) -> &QueueDescriptor {
        &self.queue
    }

    /// Run until `shutdown` is cancelled.
    #[instrument(skip_all, fields(queue = %self.queue.name))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Consumer started");

        // Reuse the link brought up at startup if it is still healthy.
        let startup_signal = self.connection_manager.take_closure_signal();
        let connected = self.connection_manager.is_connected().await;
        let mut step = match startup_signal {
            Some(signal) if connected => Step::Declaring(signal),
            _ => Step::Disconnected,
        };

        loop {
            step = match step {
                Step::Disconnected => self.reconnect(&shutdown).await,
                Step::Declaring(signal) => self.declare(signal, &shutdown).await,
                Step::Consuming(channel, signal) => self.consume(channel, signal, &shutdown).await,
                Step::Stopped => break,
            };
        }

        self.set_state(ConsumerState::Disconnected);
        info!("Consumer stopped");
        Ok(())
    }

    async fn reconnect(&self, shutdown: &CancellationToken) -> Step<ChannelOf<D>> {
        self.set_state(ConsumerState::Disconnected);
        info!("RabbitMQ channel is closed. Reconnecting...");

        let mut attempt: u64 = 0;
        loop {
            if shutdown.is_cancelled() {
                return Step::Stopped;
            }
            attempt += 1;

            let retry_in = self.policy.next_delay();
            match self.connection_manager.reconnect().await {
                Ok(()) => {
                    if let Some(signal) = self.connection_manager.take_closure_signal() {
                        info!(attempt, "Reconnected to RabbitMQ");
                        return Step::Declaring(signal);
                    }
                    // Someone else consumed this link's signal; start over on a fresh one.
                    warn!(attempt, ?retry_in, "Closure signal already taken, reconnecting again");
                }
                Err(e) => {
                    warn!(attempt, error = %e, ?retry_in, "Failed to reconnect to RabbitMQ");
                }
            }

            if !ReconnectPolicy::sleep(retry_in, shutdown).await {
                return Step::Stopped;
            }
        }
    }

    async fn declare(&self, signal: ClosureSignal, shutdown: &CancellationToken) -> Step<ChannelOf<D>> {
        self.set_state(ConsumerState::Declaring);

        loop {
            let channel = match self.connection_manager.channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    let retry_in = self.policy.next_delay();
                    warn!(error = %e, ?retry_in, "Link lost before declaring queue");
                    return if ReconnectPolicy::sleep(retry_in, shutdown).await {
                        Step::Disconnected
                    } else {
                        Step::Stopped
                    };
                }
            };

            match channel.declare_queue(&self.queue).await {
                Ok(()) => {
                    debug!("Queue declared");
                    return Step::Consuming(channel, signal);
                }
                Err(e) => {
                    let retry_in = self.policy.next_delay();
                    error!(error = %e, ?retry_in, "Failed to declare queue");
                    if !ReconnectPolicy::sleep(retry_in, shutdown).await {
                        return Step::Stopped;
                    }
                    // A channel-level exception takes the channel with it.
                    if !channel.is_open() {
                        return Step::Disconnected;
                    }
                }
            }
        }
    }

    async fn consume(
        &self,
        channel: ChannelOf<D>,
        signal: ClosureSignal,
        shutdown: &CancellationToken,
    ) -> Step<ChannelOf<D>> {
        let consumer_tag = format!("consumer-{}", &Uuid::new_v4().to_string()[..8]);

        let deliveries = match channel.consume(&self.queue.name, &consumer_tag).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                let retry_in = self.policy.next_delay();
                error!(error = %e, ?retry_in, "Failed to consume messages");
                if !ReconnectPolicy::sleep(retry_in, shutdown).await {
                    return Step::Stopped;
                }
                return if channel.is_open() {
                    Step::Declaring(signal)
                } else {
                    Step::Disconnected
                };
            }
        };

        self.set_state(ConsumerState::Consuming);
        info!(%consumer_tag, "Started consuming");

        // Deliveries are pumped on their own task so a slow handler never
        // delays noticing that the link went away.
        let mut dispatcher = tokio::spawn(pump(deliveries, self.handler.clone()));

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                dispatcher.abort();
                Step::Stopped
            }
            reason = signal.closed() => {
                dispatcher.abort();
                match reason {
                    Some(reason) => warn!(%reason, "RabbitMQ channel closed with error"),
                    None => warn!("RabbitMQ channel closed"),
                }
                Step::Disconnected
            }
            finished = &mut dispatcher => {
                if let Err(e) = finished {
                    error!(error = %e, "Delivery dispatcher failed");
                }
                let retry_in = self.policy.next_delay();
                warn!(?retry_in, "Delivery stream ended");
                // The link itself may look healthy; wait before tearing it down.
                if ReconnectPolicy::sleep(retry_in, shutdown).await {
                    Step::Disconnected
                } else {
                    Step::Stopped
                }
            }
        }
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Consumer state changed");
        }
    }
}

/// Hand every delivery to its own isolated handler task until the stream ends.
async fn pump<H: MessageHandler>(mut deliveries: DeliveryStream, handler: Arc<H>) {
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(delivery) => {
                debug!(delivery_tag = delivery.delivery_tag, "Received message");
                tokio::spawn(dispatch_isolated(handler.clone(), delivery));
            }
            Err(e) => {
                error!(error = %e, "Error receiving message");
                break;
            }
        }
    }
}
