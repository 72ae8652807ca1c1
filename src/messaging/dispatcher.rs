use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::str::Utf8Error;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::envelope::MessageEnvelope;
use super::handler::{Handler, HandlerFactory, HandlerOutcome};
use crate::rabbitmq::BrokerError;

/// Settles deliveries. Implementations must serialize calls on one channel.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledges exactly one delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Negative-acknowledges exactly one delivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Message body is not valid UTF-8: {0}")]
    Decode(#[from] Utf8Error),

    #[error("Failed to create message scope: {0}")]
    Scope(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// How often a failing message may be delivered before it is no longer requeued.
///
/// The attempt number comes from the broker's `x-delivery-count` header
/// (quorum queues). Without it the cap cannot be evaluated and the message
/// is requeued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub max_deliveries: Option<u32>,
}

impl RedeliveryPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_deliveries: None,
        }
    }

    pub fn capped(max_deliveries: u32) -> Self {
        Self {
            max_deliveries: Some(max_deliveries.max(1)),
        }
    }

    pub fn should_requeue(&self, envelope: &MessageEnvelope) -> bool {
        match (self.max_deliveries, envelope.attempt()) {
            (Some(max), Some(attempt)) => attempt < max,
            _ => true,
        }
    }
}

/// What the dispatcher told the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    /// Nacked without requeue; dead-lettered if the queue has a DLX.
    Rejected,
    /// Consumer runs in auto-ack mode, nothing was sent.
    AutoAcked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub outcome: HandlerOutcome,
    pub settlement: Settlement,
}

/// One message's isolated set of dependencies.
struct MessageScope<H> {
    id: Uuid,
    handler: H,
    opened_at: Instant,
}

impl<H: Handler> MessageScope<H> {
    fn open<F>(factory: &F) -> Result<Self, DispatchError>
    where
        F: HandlerFactory<Handler = H>,
    {
        let handler = match panic::catch_unwind(AssertUnwindSafe(|| factory.create())) {
            Ok(Ok(handler)) => handler,
            Ok(Err(e)) => return Err(DispatchError::Scope(format!("{:#}", e))),
            Err(payload) => {
                return Err(DispatchError::Panicked(panic_message(payload.as_ref())))
            }
        };
        let scope = Self {
            id: Uuid::new_v4(),
            handler,
            opened_at: Instant::now(),
        };
        debug!(scope_id = %scope.id, "Message scope created");
        Ok(scope)
    }

    async fn invoke(
        &mut self,
        envelope: &MessageEnvelope,
        message: &str,
    ) -> Result<(), DispatchError> {
        match AssertUnwindSafe(self.handler.handle_envelope(envelope, message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DispatchError::Handler(format!("{:#}", e))),
            Err(panic) => Err(DispatchError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

impl<H> Drop for MessageScope<H> {
    fn drop(&mut self) {
        debug!(
            scope_id = %self.id,
            elapsed_ms = self.opened_at.elapsed().as_millis() as u64,
            "Message scope destroyed"
        );
    }
}

/// Runs the per-message protocol: decode, scope, handle, settle, clean up.
pub struct Dispatcher<F: HandlerFactory> {
    factory: F,
    auto_ack: bool,
    redelivery: RedeliveryPolicy,
}

impl<F: HandlerFactory> Dispatcher<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            auto_ack: false,
            redelivery: RedeliveryPolicy::default(),
        }
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_redelivery_policy(mut self, redelivery: RedeliveryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Processes one envelope. Never fails: every error is logged and turned
    /// into a negative acknowledgement.
    pub async fn dispatch<A>(&self, envelope: &MessageEnvelope, acker: &A) -> DispatchReport
    where
        A: Acknowledger + ?Sized,
    {
        let mut scope = None;
        let result = self.process(envelope, &mut scope).await;

        let outcome = match &result {
            Ok(()) => HandlerOutcome::Success,
            Err(e) => HandlerOutcome::Failure(e.to_string()),
        };

        if let HandlerOutcome::Failure(reason) = &outcome {
            error!(
                delivery_tag = envelope.delivery_tag(),
                routing_key = %envelope.routing_key(),
                redelivered = envelope.redelivered(),
                body = %envelope.body_lossy(),
                "Failed to process message: {}",
                reason
            );
        }

        let settlement = self.settle(envelope, &outcome, acker).await;

        // the scope outlives settlement and is dropped on every path
        drop(scope);

        DispatchReport {
            outcome,
            settlement,
        }
    }

    async fn process(
        &self,
        envelope: &MessageEnvelope,
        scope: &mut Option<MessageScope<F::Handler>>,
    ) -> Result<(), DispatchError> {
        let message = envelope.body_text()?;
        let scope = scope.insert(MessageScope::open(&self.factory)?);
        scope.invoke(envelope, message).await
    }

    async fn settle<A>(
        &self,
        envelope: &MessageEnvelope,
        outcome: &HandlerOutcome,
        acker: &A,
    ) -> Settlement
    where
        A: Acknowledger + ?Sized,
    {
        let delivery_tag = envelope.delivery_tag();

        if self.auto_ack {
            return Settlement::AutoAcked;
        }

        if outcome.is_success() {
            if let Err(e) = acker.ack(delivery_tag).await {
                error!(delivery_tag, "Failed to acknowledge message: {}", e);
            }
            return Settlement::Acked;
        }

        let requeue = self.redelivery.should_requeue(envelope);
        if !requeue {
            warn!(
                delivery_tag,
                attempt = envelope.attempt().unwrap_or_default(),
                "Delivery limit reached, message will not be requeued"
            );
        }

        if let Err(e) = acker.nack(delivery_tag, requeue).await {
            error!(delivery_tag, "Failed to negatively acknowledge message: {}", e);
        }

        if requeue {
            Settlement::Requeued
        } else {
            Settlement::Rejected
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
