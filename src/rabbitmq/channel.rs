use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Consumer, Error as LapinError, ExchangeKind,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::errors::BrokerError;
use crate::messaging::Acknowledger;

/// Handle to one AMQP channel.
///
/// A channel must not be driven from several tasks at once, so every
/// operation here takes the channel lock first. Clones share the same lock.
#[derive(Clone)]
pub struct ChannelHandle {
    id: String,
    channel: Arc<Mutex<Channel>>,
    // status reads only; operations go through `channel`
    observer: Channel,
}

impl ChannelHandle {
    pub(crate) fn new(channel: Channel) -> Self {
        let id = format!("channel-{}", channel.id());
        debug!(channel_id = %id, "Wrapping channel");
        Self {
            id,
            observer: channel.clone(),
            channel: Arc::new(Mutex::new(channel)),
        }
    }

    /// Return the channel ID for logging
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check if the channel is in a healthy state
    pub fn is_open(&self) -> bool {
        self.observer.status().connected()
    }

    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), LapinError> {
        let channel = self.channel.lock().await;
        channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(channel_id = %self.id, exchange = %name, "Exchange declared");
        Ok(())
    }

    /// Declares the queue and returns the number of messages it holds.
    pub async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<u32, LapinError> {
        let channel = self.channel.lock().await;
        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await?;
        info!(
            channel_id = %self.id,
            "Queue '{}' declared with {} messages",
            name,
            queue.message_count()
        );
        Ok(queue.message_count())
    }

    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), LapinError> {
        let channel = self.channel.lock().await;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(channel_id = %self.id, "Bound queue '{}' to '{}' with '{}'", queue, exchange, routing_key);
        Ok(())
    }

    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), LapinError> {
        let channel = self.channel.lock().await;
        debug!("Setting channel QoS to {}", prefetch_count);
        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
    }

    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<Consumer, LapinError> {
        let channel = self.channel.lock().await;
        channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), LapinError> {
        let channel = self.channel.lock().await;
        channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), LapinError> {
        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), LapinError> {
        let channel = self.channel.lock().await;
        if channel.status().connected() {
            info!(channel_id = %self.id, "Closing channel");
            channel.close(200, "Closing channel").await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for ChannelHandle {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let channel = self.channel.lock().await;
        channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|e| BrokerError::AckError(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let channel = self.channel.lock().await;
        channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| BrokerError::AckError(e.to_string()))
    }
}
