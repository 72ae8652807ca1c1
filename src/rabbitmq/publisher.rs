use lapin::BasicProperties;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::errors::{is_precondition_failed, BrokerError, PublishError};
use crate::config::ProducerConfig;

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// Publishes message bodies to exchanges. Holds no consumption state.
pub struct Producer {
    connections: Arc<ConnectionManager>,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(connections: Arc<ConnectionManager>, config: ProducerConfig) -> Self {
        Producer {
            connections,
            config,
        }
    }

    /// Publishes `body` to `exchange` with `routing_key`.
    ///
    /// The exchange is declared first (a no-op when it already exists with the
    /// same parameters). `durable` marks both the exchange and the message as
    /// persistent. Returns once the broker client accepted the publish.
    pub async fn publish(
        &self,
        body: &[u8],
        exchange: &str,
        routing_key: &str,
        durable: bool,
    ) -> Result<(), PublishError> {
        self.send(body, exchange, routing_key, durable, "text/plain")
            .await
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        message: &T,
        exchange: &str,
        routing_key: &str,
        durable: bool,
    ) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(message)?;
        self.send(&payload, exchange, routing_key, durable, "application/json")
            .await
    }

    async fn send(
        &self,
        body: &[u8],
        exchange: &str,
        routing_key: &str,
        durable: bool,
        content_type: &str,
    ) -> Result<(), PublishError> {
        let channel = self.connections.ensure_publish_channel().await?;

        // the default exchange ("") always exists and cannot be declared
        if !exchange.is_empty() {
            channel
                .declare_exchange(exchange, self.config.exchange_type.kind(), durable)
                .await
                .map_err(|e| {
                    error!("Failed to declare exchange '{}': {}", exchange, e);
                    if is_precondition_failed(&e) {
                        PublishError::ExchangeConflict {
                            exchange: exchange.to_string(),
                            reason: e.to_string(),
                        }
                    } else {
                        PublishError::Broker(BrokerError::Topology(format!(
                            "Failed to declare exchange '{}': {}",
                            exchange, e
                        )))
                    }
                })?;
        }

        channel
            .publish(
                exchange,
                routing_key,
                body,
                message_properties(content_type, durable),
            )
            .await
            .map_err(|e| {
                error!(
                    "Failed to publish to exchange '{}' with routing key '{}': {}",
                    exchange, routing_key, e
                );
                PublishError::Publish(e.to_string())
            })?;

        info!(
            "Published message to exchange '{}' with routing key '{}'",
            exchange, routing_key
        );
        Ok(())
    }
}

fn message_properties(content_type: &str, durable: bool) -> BasicProperties {
    BasicProperties::default()
        .with_message_id(Uuid::new_v4().to_string().into())
        .with_content_type(content_type.into())
        .with_timestamp(chrono::Utc::now().timestamp() as u64)
        .with_delivery_mode(if durable { PERSISTENT } else { TRANSIENT })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durable_messages_are_persistent() {
        let properties = message_properties("text/plain", true);
        assert_eq!(*properties.delivery_mode(), Some(2));
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some("text/plain")
        );
        assert!(properties.message_id().is_some());
        assert!(properties.timestamp().is_some());
    }

    #[test]
    fn transient_messages_use_delivery_mode_one() {
        let properties = message_properties("application/json", false);
        assert_eq!(*properties.delivery_mode(), Some(1));
    }

    #[test]
    fn every_message_gets_its_own_id() {
        let first = message_properties("text/plain", true);
        let second = message_properties("text/plain", true);
        assert_ne!(first.message_id(), second.message_id());
    }
}
