// src/rabbitmq/connection.rs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::amqp_client::{AmqpChannel, AmqpConnection, AmqpDialer};
use super::closure::{closure_pair, ClosureSignal};
use super::errors::{RabbitMQError, Result};

/// The live (connection, channel) pair. Only ever installed whole.
struct BrokerLink<C: AmqpConnection> {
    connection: C,
    channel: C::Channel,
    generation: u64,
}

/// Owns the single logical broker link for the process.
///
/// Readers fetch a fresh channel handle per operation through [`channel`];
/// only this type closes or replaces the link.
///
/// [`channel`]: ConnectionManager::channel
pub struct ConnectionManager<D: AmqpDialer> {
    dialer: D,
    link: RwLock<Option<BrokerLink<D::Connection>>>,
    // Serializes reconnects so two callers never dial over each other.
    reconnect_lock: Mutex<()>,
    closure_signal: StdMutex<Option<ClosureSignal>>,
    generation: AtomicU64,
}

impl<D: AmqpDialer> ConnectionManager<D> {
    /// Create a manager with no link. Call [`reconnect`](Self::reconnect) to bring it up.
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            link: RwLock::new(None),
            reconnect_lock: Mutex::new(()),
            closure_signal: StdMutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Create a manager and establish the initial link.
    pub async fn connect(dialer: D) -> Result<Self> {
        let manager = Self::new(dialer);
        manager.reconnect().await?;
        Ok(manager)
    }

    /// Tear down the current link (best effort) and establish a new one.
    ///
    /// On failure the link stays down. A connection without a channel is
    /// never installed.
    pub async fn reconnect(&self) -> Result<()> {
        let _reconnecting = self.reconnect_lock.lock().await;

        let previous = self.link.write().await.take();
        // The old link's signal goes with it, whether or not the dial succeeds.
        self.store_closure_signal_opt(None);
        if let Some(previous) = previous {
            debug!(generation = previous.generation, "Closing previous RabbitMQ link");
            Self::teardown(previous).await;
        }

        let connection = match self.dialer.dial().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "Failed to reconnect to RabbitMQ");
                return Err(e);
            }
        };

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Failed to reopen RabbitMQ channel");
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Ignoring error closing half-open connection");
                }
                return Err(e);
            }
        };

        let (notifier, signal) = closure_pair();
        connection.on_closed(notifier);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.link.write().await = Some(BrokerLink {
            connection,
            channel,
            generation,
        });
        self.store_closure_signal(signal);

        info!(generation, "Connected to RabbitMQ");
        Ok(())
    }

    /// The current channel, or [`RabbitMQError::LinkDown`] if there is none
    /// or it is no longer open.
    pub async fn channel(&self) -> Result<<D::Connection as AmqpConnection>::Channel> {
        self.link
            .read()
            .await
            .as_ref()
            .filter(|link| link.channel.is_open())
            .map(|link| link.channel.clone())
            .ok_or(RabbitMQError::LinkDown)
    }

    pub async fn is_connected(&self) -> bool {
        self.channel().await.is_ok()
    }

    /// Generation of the last link installed; increases on every successful reconnect.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Hand out the closure signal of the current link. Yields it at most once
    /// per successful reconnect.
    pub fn take_closure_signal(&self) -> Option<ClosureSignal> {
        match self.closure_signal.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Close the link for good.
    pub async fn close(&self) {
        let _reconnecting = self.reconnect_lock.lock().await;
        if let Some(link) = self.link.write().await.take() {
            info!(generation = link.generation, "Closing RabbitMQ connection gracefully");
            Self::teardown(link).await;
        }
        self.store_closure_signal_opt(None);
    }

    fn store_closure_signal(&self, signal: ClosureSignal) {
        self.store_closure_signal_opt(Some(signal));
    }

    fn store_closure_signal_opt(&self, signal: Option<ClosureSignal>) {
        match self.closure_signal.lock() {
            Ok(mut guard) => *guard = signal,
            Err(poisoned) => *poisoned.into_inner() = signal,
        }
    }

    async fn teardown(link: BrokerLink<D::Connection>) {
        if let Err(e) = link.channel.close().await {
            debug!(error = %e, "Ignoring error closing RabbitMQ channel");
        }
        if let Err(e) = link.connection.close().await {
            debug!(error = %e, "Ignoring error closing RabbitMQ connection");
        }
    }
}
