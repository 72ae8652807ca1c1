// src/config.rs
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::ExchangeKind;
use serde::{Deserialize, Serialize};
use tracing::debug;

const CONFIG_FILE_NAME: &str = "service.json";

// Configuration structures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Full `amqp://` URI. Takes precedence over the individual fields.
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    /// Dial attempts made by a single `ensure_connected` call.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub queue: String,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub exchange_type: ExchangeType,
    /// Binding key used when an exchange is configured; defaults to the queue name.
    #[serde(default)]
    pub binding_key: Option<String>,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_ack: bool,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,
    #[serde(default)]
    pub max_deliveries: Option<u32>,
    #[serde(default)]
    pub quorum_queue: bool,
    #[serde(default = "default_true")]
    pub reconnect: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default)]
    pub exchange_type: ExchangeType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_connection_string")]
    pub connection_string: String,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeType {
    pub fn kind(self) -> ExchangeKind {
        match self {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Headers => ExchangeKind::Headers,
        }
    }
}

impl FromStr for ExchangeType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeType::Direct),
            "topic" => Ok(ExchangeType::Topic),
            "fanout" => Ok(ExchangeType::Fanout),
            "headers" => Ok(ExchangeType::Headers),
            other => Err(anyhow!("unknown exchange type '{}'", other)),
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Headers => "headers",
        };
        f.write_str(name)
    }
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_username() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_virtual_host() -> String { "/".to_string() }
fn default_connect_attempts() -> u32 { 1 }
fn default_reconnect_delay_ms() -> u64 { 1000 }
fn default_prefetch_count() -> u16 { 10 }
fn default_true() -> bool { true }
fn default_connection_string() -> String { "service.db".to_string() }
fn default_retry_count() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 500 }

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: None,
            host: default_host(),
            port: default_port(),
            username: default_username(),
            password: default_password(),
            virtual_host: default_virtual_host(),
            connect_attempts: default_connect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_string: default_connection_string(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl BrokerConfig {
    /// The URI handed to the AMQP client. An explicit `uri` wins over the
    /// individual fields.
    pub fn amqp_uri(&self) -> Result<AMQPUri> {
        if let Some(uri) = &self.uri {
            return uri
                .parse::<AMQPUri>()
                .map_err(|e| anyhow!("Configuration error: invalid broker.uri: {}", e));
        }
        Ok(AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            ..AMQPUri::default()
        })
    }

    /// Broker address with the password masked, for logs.
    pub fn redacted_uri(&self) -> String {
        match self.amqp_uri() {
            Ok(uri) => redact(&uri),
            Err(_) => "<invalid broker uri>".to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: None,
            exchange_type: ExchangeType::default(),
            binding_key: None,
            durable: true,
            auto_ack: false,
            prefetch_count: default_prefetch_count(),
            dead_letter_exchange: None,
            max_deliveries: None,
            quorum_queue: false,
            reconnect: true,
        }
    }

    pub fn binding_key(&self) -> &str {
        self.binding_key.as_deref().unwrap_or(&self.queue)
    }
}

impl StoreConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl AppConfig {
    /// Reads the configuration from process environment (after loading `.env`).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let broker_defaults = BrokerConfig::default();
        let broker = BrokerConfig {
            uri: var("RABBITMQ_URI"),
            host: var("RABBITMQ_HOST").unwrap_or(broker_defaults.host),
            port: parse_var(&var, "RABBITMQ_PORT")?.unwrap_or(broker_defaults.port),
            username: var("RABBITMQ_USERNAME").unwrap_or(broker_defaults.username),
            password: var("RABBITMQ_PASSWORD").unwrap_or(broker_defaults.password),
            virtual_host: var("RABBITMQ_VHOST").unwrap_or(broker_defaults.virtual_host),
            connect_attempts: parse_var(&var, "RABBITMQ_CONNECT_ATTEMPTS")?
                .unwrap_or(broker_defaults.connect_attempts),
            reconnect_delay_ms: parse_var(&var, "RABBITMQ_RECONNECT_DELAY_MS")?
                .unwrap_or(broker_defaults.reconnect_delay_ms),
        };

        let queue = var("RABBITMQ_QUEUE").ok_or_else(|| anyhow!("RABBITMQ_QUEUE is not set"))?;
        let mut consumer = ConsumerConfig::new(queue);
        consumer.exchange = var("RABBITMQ_EXCHANGE");
        if let Some(kind) = parse_var::<ExchangeType, _>(&var, "RABBITMQ_EXCHANGE_TYPE")? {
            consumer.exchange_type = kind;
        }
        consumer.binding_key = var("RABBITMQ_BINDING_KEY");
        consumer.durable = parse_var(&var, "RABBITMQ_DURABLE")?.unwrap_or(consumer.durable);
        consumer.auto_ack = parse_var(&var, "RABBITMQ_AUTO_ACK")?.unwrap_or(consumer.auto_ack);
        consumer.prefetch_count =
            parse_var(&var, "RABBITMQ_PREFETCH_COUNT")?.unwrap_or(consumer.prefetch_count);
        consumer.dead_letter_exchange = var("RABBITMQ_DEAD_LETTER_EXCHANGE");
        consumer.max_deliveries = parse_var(&var, "RABBITMQ_MAX_DELIVERIES")?;
        consumer.quorum_queue =
            parse_var(&var, "RABBITMQ_QUORUM_QUEUE")?.unwrap_or(consumer.quorum_queue);
        consumer.reconnect = parse_var(&var, "RABBITMQ_RECONNECT")?.unwrap_or(consumer.reconnect);

        let producer = ProducerConfig {
            exchange_type: parse_var(&var, "RABBITMQ_PUBLISH_EXCHANGE_TYPE")?.unwrap_or_default(),
        };

        let store_defaults = StoreConfig::default();
        let store = StoreConfig {
            connection_string: var("STORE_CONNECTION_STRING")
                .unwrap_or(store_defaults.connection_string),
            retry_count: parse_var(&var, "STORE_RETRY_COUNT")?
                .unwrap_or(store_defaults.retry_count),
            retry_delay_ms: parse_var(&var, "STORE_RETRY_DELAY_MS")?
                .unwrap_or(store_defaults.retry_delay_ms),
        };

        let config = AppConfig { broker, consumer, producer, store };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consumer.queue.trim().is_empty() {
            return Err(anyhow!("Configuration error: consumer.queue cannot be empty"));
        }
        if self.broker.uri.is_none() && self.broker.port == 0 {
            return Err(anyhow!("Configuration error: broker.port cannot be 0"));
        }
        self.broker.amqp_uri()?;
        if self.broker.connect_attempts == 0 {
            return Err(anyhow!("Configuration error: broker.connect_attempts must be at least 1"));
        }
        if self.consumer.max_deliveries == Some(0) {
            return Err(anyhow!("Configuration error: consumer.max_deliveries must be at least 1"));
        }
        if self.store.connection_string.trim().is_empty() {
            return Err(anyhow!("Configuration error: store.connection_string cannot be empty"));
        }
        Ok(())
    }
}

fn parse_var<T, F>(var: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("invalid value '{}' for {}: {}", raw, name, e)),
        None => Ok(None),
    }
}

// Configuration file loading
pub fn find_config_file() -> Result<PathBuf> {
    // Check various locations
    let local = PathBuf::from(CONFIG_FILE_NAME);
    let nested = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [("Current directory", local), ("Config directory", nested)];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, ./config or your home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config() -> Result<AppConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let config_content = fs::read_to_string(path)
        .context(format!("Failed to read config file at {}", path.display()))?;

    // Parse and validate the config structure
    let config: AppConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;
    config.validate()?;

    Ok(config)
}

fn redact(uri: &AMQPUri) -> String {
    let scheme = match uri.scheme {
        AMQPScheme::AMQPS => "amqps",
        _ => "amqp",
    };
    format!(
        "{}://{}:***@{}:{} (vhost '{}')",
        scheme, uri.authority.userinfo.username, uri.authority.host, uri.authority.port, uri.vhost
    )
}
