// src/rabbitmq/mod.rs
// RabbitMQ implementation of connection management, publishing and consuming

pub mod channel;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use channel::ChannelHandle;
pub use connection::ConnectionManager;
pub use consumer::{Consumer, ConsumerState};
pub use errors::{BrokerError, PublishError, Result};
pub use publisher::Producer;
