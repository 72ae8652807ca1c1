pub mod config;
pub mod messaging;
pub mod persistence;
pub mod rabbitmq;
pub mod telemetry;

pub use config::{AppConfig, BrokerConfig, ConsumerConfig, ExchangeType, ProducerConfig, StoreConfig};
pub use messaging::{
    Acknowledger, DispatchError, DispatchReport, Dispatcher, Handler, HandlerFactory, HandlerOutcome,
    JournalHandler, JournalHandlerFactory, LoggingHandler, LoggingHandlerFactory, MessageEnvelope,
    ReceivedMessage, RedeliveryPolicy, Settlement,
};
pub use persistence::{
    DbContext, Entity, MemoryStore, PersistenceError, PersistenceResult, Repository, SqliteStore, Store,
    UnitOfWork,
};
pub use rabbitmq::{BrokerError, ChannelHandle, ConnectionManager, Consumer, ConsumerState, Producer, PublishError};
