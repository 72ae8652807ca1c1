// src/messaging/mod.rs
// Broker-agnostic message handling: envelopes, handlers and the dispatcher

pub mod dispatcher;
pub mod envelope;
pub mod handler;
pub mod journal;

pub use dispatcher::{
    Acknowledger, DispatchError, DispatchReport, Dispatcher, RedeliveryPolicy, Settlement,
};
pub use envelope::MessageEnvelope;
pub use handler::{Handler, HandlerFactory, HandlerOutcome, LoggingHandler, LoggingHandlerFactory};
pub use journal::{JournalHandler, JournalHandlerFactory, ReceivedMessage};
