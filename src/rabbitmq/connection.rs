use lapin::{Connection, ConnectionProperties, Error as LapinError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::channel::ChannelHandle;
use super::errors::{BrokerError, Result};
use crate::config::BrokerConfig;

const MAX_BACKOFF_MS: u64 = 30_000;

struct LiveConnection {
    connection: Connection,
    channel: ChannelHandle,
    // opened on first publish; kept apart so a refused declaration on the
    // publish side cannot close the consuming channel
    publish_channel: Option<ChannelHandle>,
}

/// Owns the broker connection and its channel.
///
/// Shared (behind an `Arc`) by the producer and the consumer. The live
/// connection sits behind an async mutex so concurrent callers never dial twice.
pub struct ConnectionManager {
    config: BrokerConfig,
    live: Mutex<Option<LiveConnection>>,
    dials: AtomicU64,
}

impl ConnectionManager {
    pub fn new(config: BrokerConfig) -> Self {
        ConnectionManager {
            config,
            live: Mutex::new(None),
            dials: AtomicU64::new(0),
        }
    }

    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.config.connect_attempts = max_attempts.max(1);
        self.config.reconnect_delay_ms = initial_delay_ms;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Number of successful dials since creation.
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        let live = self.live.lock().await;
        live.as_ref()
            .map_or(false, |current| current.connection.status().connected())
    }

    /// Returns the consuming channel of the open connection, dialling first if
    /// needed.
    pub async fn ensure_connected(&self) -> Result<ChannelHandle> {
        let mut live = self.live.lock().await;
        let current = self.live_connection(&mut live).await?;

        if !current.channel.is_open() {
            debug!(channel_id = %current.channel.id(), "Channel closed, opening a new one");
            current.channel = open_channel(&current.connection).await?;
        }
        Ok(current.channel.clone())
    }

    /// Returns the publishing channel, a separate channel on the same
    /// connection as [`ensure_connected`](Self::ensure_connected).
    pub async fn ensure_publish_channel(&self) -> Result<ChannelHandle> {
        let mut live = self.live.lock().await;
        let current = self.live_connection(&mut live).await?;

        if let Some(channel) = current.publish_channel.as_ref().filter(|c| c.is_open()) {
            return Ok(channel.clone());
        }

        let channel = open_channel(&current.connection).await?;
        current.publish_channel = Some(channel.clone());
        Ok(channel)
    }

    async fn live_connection<'a>(
        &self,
        live: &'a mut Option<LiveConnection>,
    ) -> Result<&'a mut LiveConnection> {
        let connected = live
            .as_ref()
            .map_or(false, |current| current.connection.status().connected());

        if !connected {
            if live.is_some() {
                warn!("Connection to RabbitMQ lost, dialling again");
            }
            // a dead connection is replaced, never revived
            *live = None;

            let connection = self.establish_connection().await?;
            let channel = open_channel(&connection).await?;
            *live = Some(LiveConnection {
                connection,
                channel,
                publish_channel: None,
            });
        }

        live.as_mut()
            .ok_or_else(|| BrokerError::ChannelError("connection not established".to_string()))
    }

    async fn establish_connection(&self) -> Result<Connection> {
        let uri = self
            .config
            .amqp_uri()
            .map_err(|e| BrokerError::InvalidUri(e.to_string()))?;
        let max_attempts = self.config.connect_attempts.max(1);
        let mut delay = self.config.reconnect_delay_ms;
        let mut attempts = 0;

        loop {
            attempts += 1;
            info!("Attempting to connect to RabbitMQ at {}", self.config.redacted_uri());

            match Connection::connect_uri(uri.clone(), ConnectionProperties::default()).await {
                Ok(conn) => {
                    self.dials.fetch_add(1, Ordering::SeqCst);
                    info!("Successfully connected to RabbitMQ");
                    return Ok(conn);
                }
                Err(err) => {
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                        attempts, max_attempts, err
                    );

                    if attempts >= max_attempts {
                        return Err(unavailable(self.config.redacted_uri(), attempts, err));
                    }

                    let sleep_time = backoff_with_jitter(delay);
                    info!("Waiting {}ms before next connect attempt", sleep_time);
                    sleep(Duration::from_millis(sleep_time)).await;

                    delay = std::cmp::min(delay.saturating_mul(2), MAX_BACKOFF_MS);
                }
            }
        }
    }

    /// Closes channel and connection. Failures are logged, not returned.
    pub async fn close(&self) {
        let Some(current) = self.live.lock().await.take() else {
            debug!("No RabbitMQ connection to close");
            return;
        };

        let channels = std::iter::once(&current.channel).chain(current.publish_channel.as_ref());
        for channel in channels {
            if !channel.is_open() {
                continue;
            }
            if let Err(e) = channel.close().await {
                warn!(channel_id = %channel.id(), "Failed to close channel: {}", e);
            }
        }

        if current.connection.status().connected() {
            info!("Closing RabbitMQ connection gracefully");
            if let Err(e) = current.connection.close(200, "Closing connection").await {
                warn!("Failed to close RabbitMQ connection: {}", e);
            }
        }
    }
}

async fn open_channel(connection: &Connection) -> Result<ChannelHandle> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| BrokerError::ChannelError(e.to_string()))?;
    let channel = ChannelHandle::new(channel);
    info!(channel_id = %channel.id(), "Channel opened");
    Ok(channel)
}

fn unavailable(uri: String, attempts: u32, source: LapinError) -> BrokerError {
    BrokerError::Unavailable {
        uri,
        attempts,
        source,
    }
}

/// Delay in milliseconds with +/-15% jitter.
pub(crate) fn backoff_with_jitter(delay_ms: u64) -> u64 {
    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay_ms as f64;
    (delay_ms as f64 + jitter).max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_fifteen_percent() {
        for _ in 0..100 {
            let value = backoff_with_jitter(1000);
            assert!((850..=1150).contains(&value), "got {}", value);
        }
        assert_eq!(backoff_with_jitter(0), 0);
    }

    #[test]
    fn reconnect_policy_never_drops_below_one_attempt() {
        let manager = ConnectionManager::new(BrokerConfig::default()).with_reconnect_policy(0, 10);
        assert_eq!(manager.config().connect_attempts, 1);
        assert_eq!(manager.config().reconnect_delay_ms, 10);
        assert_eq!(manager.dial_count(), 0);
    }

    #[tokio::test]
    async fn close_without_connection_is_a_no_op() {
        let manager = ConnectionManager::new(BrokerConfig::default());
        manager.close().await;
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn unreachable_broker_is_reported_unavailable() {
        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..BrokerConfig::default()
        };
        let manager = ConnectionManager::new(config);

        let err = manager.ensure_connected().await.err().unwrap();
        match err {
            BrokerError::Unavailable { attempts, uri, .. } => {
                assert_eq!(attempts, 1);
                assert!(uri.contains(":***@"), "password must be redacted: {}", uri);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(manager.dial_count(), 0);
    }

    #[tokio::test]
    async fn invalid_uri_fails_before_dialling() {
        let config = BrokerConfig {
            uri: Some("http://rabbit".to_string()),
            ..BrokerConfig::default()
        };
        let manager = ConnectionManager::new(config);

        assert!(matches!(
            manager.ensure_publish_channel().await,
            Err(BrokerError::InvalidUri(_))
        ));
        assert_eq!(manager.dial_count(), 0);
        assert!(!manager.is_connected().await);
    }
}
