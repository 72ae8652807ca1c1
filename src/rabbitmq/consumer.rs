use futures_lite::StreamExt;
use lapin::types::{AMQPValue, FieldTable};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::ChannelHandle;
use super::connection::{backoff_with_jitter, ConnectionManager};
use super::errors::{BrokerError, Result};
use crate::config::ConsumerConfig;
use crate::messaging::{Dispatcher, HandlerFactory, MessageEnvelope, RedeliveryPolicy};

const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connecting,
    Declaring,
    Consuming,
    Stopping,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A registered subscription on one channel.
struct Subscription {
    channel: ChannelHandle,
    consumer: lapin::Consumer,
    consumer_tag: String,
}

/// Why the receive loop returned.
enum LoopExit {
    Shutdown,
    ConnectionLost,
}

/// Subscribes to the configured queue and feeds every delivery to the
/// [`Dispatcher`].
///
/// The consumer owns the handler *factory* only; each delivery is dispatched
/// on its own task with its own handler scope. In-flight deliveries are
/// bounded by the prefetch count, in auto-ack mode too where the broker
/// ignores QoS.
pub struct Consumer<F: HandlerFactory> {
    connections: Arc<ConnectionManager>,
    config: ConsumerConfig,
    dispatcher: Arc<Dispatcher<F>>,
    slots: Option<Arc<Semaphore>>,
    state: watch::Sender<ConsumerState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<F: HandlerFactory> Consumer<F> {
    pub fn new(connections: Arc<ConnectionManager>, config: ConsumerConfig, factory: F) -> Self {
        let redelivery = RedeliveryPolicy {
            max_deliveries: config.max_deliveries,
        };
        let dispatcher = Dispatcher::new(factory)
            .with_auto_ack(config.auto_ack)
            .with_redelivery_policy(redelivery);

        let (state, _) = watch::channel(ConsumerState::Idle);
        let (shutdown, _) = watch::channel(false);

        Consumer {
            slots: dispatch_slots(config.prefetch_count),
            connections,
            config,
            dispatcher: Arc::new(dispatcher),
            state,
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(queue = %self.config.queue, "Consumer state {} -> {}", previous, state);
        }
    }

    /// Connects, declares topology and starts consuming in the background.
    ///
    /// Connection and declaration failures are returned; the consumer is then
    /// `Stopped`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.as_ref().map_or(false, |running| !running.is_finished()) {
            return Err(BrokerError::AlreadyRunning);
        }

        if self.config.max_deliveries.is_some() && !self.config.quorum_queue {
            warn!(
                queue = %self.config.queue,
                "max_deliveries needs the x-delivery-count header of quorum queues; \
                 messages on other queue types are requeued without limit"
            );
        }

        self.shutdown.send_replace(false);
        let subscription = match self.subscribe().await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(queue = %self.config.queue, "Consumer failed to start: {}", e);
                self.set_state(ConsumerState::Stopped);
                return Err(e);
            }
        };

        let consumer = Arc::clone(self);
        *task = Some(tokio::spawn(async move { consumer.run(subscription).await }));
        Ok(())
    }

    /// Stops new deliveries, waits for in-flight handlers, then closes the
    /// channel and connection. Safe to call at any time.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if !task.is_finished() {
                self.set_state(ConsumerState::Stopping);
            }
            if let Err(e) = task.await {
                error!("Consumer task ended abnormally: {}", e);
            }
        }

        self.connections.close().await;
        self.set_state(ConsumerState::Stopped);
        info!(queue = %self.config.queue, "Consumer stopped");
    }

    async fn subscribe(&self) -> Result<Subscription> {
        self.set_state(ConsumerState::Connecting);
        let channel = self.connections.ensure_connected().await?;

        self.set_state(ConsumerState::Declaring);
        self.declare_topology(&channel).await?;

        channel
            .set_prefetch(self.config.prefetch_count)
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to set QoS: {}", e)))?;

        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let consumer = channel
            .consume(&self.config.queue, &consumer_tag, self.config.auto_ack)
            .await
            .map_err(|e| BrokerError::ConsumeError(e.to_string()))?;

        info!("Started consuming from queue: {}", self.config.queue);
        self.set_state(ConsumerState::Consuming);

        Ok(Subscription {
            channel,
            consumer,
            consumer_tag,
        })
    }

    async fn declare_topology(&self, channel: &ChannelHandle) -> Result<()> {
        let config = &self.config;

        channel
            .declare_queue(&config.queue, config.durable, queue_arguments(config))
            .await
            .map_err(|e| {
                BrokerError::Topology(format!("Failed to declare queue '{}': {}", config.queue, e))
            })?;

        if let Some(exchange) = &config.exchange {
            channel
                .declare_exchange(exchange, config.exchange_type.kind(), config.durable)
                .await
                .map_err(|e| {
                    BrokerError::Topology(format!(
                        "Failed to declare exchange '{}': {}",
                        exchange, e
                    ))
                })?;

            channel
                .bind_queue(&config.queue, exchange, config.binding_key())
                .await
                .map_err(|e| {
                    BrokerError::Topology(format!("Failed to bind queue: {}", e))
                })?;
        }

        Ok(())
    }

    async fn run(self: Arc<Self>, mut subscription: Subscription) {
        let mut shutdown = self.shutdown.subscribe();
        let mut in_flight = JoinSet::new();

        let exit = loop {
            match self.receive(&mut subscription, &mut shutdown, &mut in_flight).await {
                LoopExit::Shutdown => break LoopExit::Shutdown,
                LoopExit::ConnectionLost if self.config.reconnect => {
                    match self.resubscribe(&mut shutdown).await {
                        Some(next) => subscription = next,
                        None => break LoopExit::Shutdown,
                    }
                }
                LoopExit::ConnectionLost => break LoopExit::ConnectionLost,
            }
        };

        self.set_state(ConsumerState::Stopping);
        if subscription.channel.is_open() {
            if let Err(e) = subscription.channel.cancel(&subscription.consumer_tag).await {
                warn!("Failed to cancel consumer {}: {}", subscription.consumer_tag, e);
            }
        }

        // already-dispatched handlers run to completion
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Dispatch task failed: {}", e);
            }
        }

        if let LoopExit::ConnectionLost = exit {
            self.set_state(ConsumerState::Stopped);
        }
    }

    async fn receive(
        &self,
        subscription: &mut Subscription,
        shutdown: &mut watch::Receiver<bool>,
        in_flight: &mut JoinSet<()>,
    ) -> LoopExit {
        loop {
            if *shutdown.borrow() {
                return LoopExit::Shutdown;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return LoopExit::Shutdown;
                    }
                }
                delivery = subscription.consumer.next() => match delivery {
                    Some(Ok(delivery)) => {
                        let envelope = MessageEnvelope::from_delivery(&delivery);
                        let permit = self.reserve_slot().await;
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let channel = subscription.channel.clone();
                        in_flight.spawn(async move {
                            dispatcher.dispatch(&envelope, &channel).await;
                            drop(permit);
                        });
                    }
                    Some(Err(e)) => {
                        error!("Error receiving message: {}", e);
                        if !subscription.channel.is_open() {
                            warn!("Channel disconnected");
                            return LoopExit::ConnectionLost;
                        }
                    }
                    None => {
                        warn!("Consumer stream for queue '{}' ended", self.config.queue);
                        return LoopExit::ConnectionLost;
                    }
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Dispatch task failed: {}", e);
                    }
                }
            }
        }
    }

    /// Waits until fewer than `prefetch_count` dispatches are running.
    async fn reserve_slot(&self) -> Option<OwnedSemaphorePermit> {
        let slots = self.slots.as_ref()?;
        Arc::clone(slots).acquire_owned().await.ok()
    }

    async fn resubscribe(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Subscription> {
        let mut delay = self.connections.config().reconnect_delay_ms.max(1);

        loop {
            if *shutdown.borrow() {
                return None;
            }

            match self.subscribe().await {
                Ok(subscription) => {
                    info!(queue = %self.config.queue, "Consumer resubscribed");
                    return Some(subscription);
                }
                Err(e) => {
                    let wait = backoff_with_jitter(delay);
                    warn!("Resubscribe failed: {}. Retrying in {}ms", e, wait);
                    tokio::select! {
                        _ = sleep(Duration::from_millis(wait)) => {}
                        _ = shutdown.changed() => {}
                    }
                    delay = std::cmp::min(delay.saturating_mul(2), MAX_RECONNECT_DELAY_MS);
                }
            }
        }
    }
}

/// Limit on concurrent dispatches; a prefetch of 0 means unlimited.
fn dispatch_slots(prefetch_count: u16) -> Option<Arc<Semaphore>> {
    (prefetch_count > 0).then(|| Arc::new(Semaphore::new(prefetch_count as usize)))
}

fn queue_arguments(config: &ConsumerConfig) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = &config.dead_letter_exchange {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    if config.quorum_queue {
        arguments.insert(
            "x-queue-type".into(),
            AMQPValue::LongString("quorum".to_string().into()),
        );
    }
    arguments
}
