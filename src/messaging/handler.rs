use async_trait::async_trait;
use std::fmt;
use tracing::info;

use super::envelope::MessageEnvelope;

/// Business logic invoked once per delivered message.
///
/// A handler is built fresh for every message by a [`HandlerFactory`] and
/// owns whatever scoped dependencies it needs (typically a
/// [`UnitOfWork`](crate::persistence::UnitOfWork)). It is dropped after the
/// message is settled. Returning an error negative-acknowledges the message.
#[async_trait]
pub trait Handler: Send {
    async fn handle(&mut self, message: &str) -> anyhow::Result<()>;

    /// Entry point used by the dispatcher. Override to read delivery
    /// metadata; the default hands the decoded body to [`handle`](Handler::handle).
    async fn handle_envelope(
        &mut self,
        envelope: &MessageEnvelope,
        message: &str,
    ) -> anyhow::Result<()> {
        let _ = envelope;
        self.handle(message).await
    }
}

/// The single injection point for business logic.
///
/// The consumer holds the factory, never a handler: every delivery gets its
/// own handler and with it its own persistence context.
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: Handler + 'static;

    fn create(&self) -> anyhow::Result<Self::Handler>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    Failure(String),
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success)
    }
}

impl From<anyhow::Result<()>> for HandlerOutcome {
    fn from(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => HandlerOutcome::Success,
            Err(e) => HandlerOutcome::Failure(format!("{:#}", e)),
        }
    }
}

impl fmt::Display for HandlerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerOutcome::Success => f.write_str("success"),
            HandlerOutcome::Failure(reason) => write!(f, "failure: {}", reason),
        }
    }
}

/// Default handler: logs the message and succeeds.
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl Handler for LoggingHandler {
    async fn handle(&mut self, message: &str) -> anyhow::Result<()> {
        info!("Received message: {}", message);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandlerFactory;

impl HandlerFactory for LoggingHandlerFactory {
    type Handler = LoggingHandler;

    fn create(&self) -> anyhow::Result<LoggingHandler> {
        Ok(LoggingHandler)
    }
}
