// src/messaging/journal.rs
// Handler that records every received message in the store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::envelope::MessageEnvelope;
use super::handler::{Handler, HandlerFactory};
use crate::persistence::{Entity, Repository, Store, UnitOfWork};

/// One journaled delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub id: Uuid,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl Entity for ReceivedMessage {
    type Key = Uuid;
    const KIND: &'static str = "received_message";

    fn key(&self) -> Uuid {
        self.id
    }
}

/// Logs each message and stores it as a [`ReceivedMessage`] inside its own
/// unit of work. A failed commit fails the handler so the message is
/// redelivered.
pub struct JournalHandler<S: Store> {
    uow: UnitOfWork<S>,
}

#[async_trait]
impl<S: Store> Handler for JournalHandler<S> {
    async fn handle(&mut self, message: &str) -> anyhow::Result<()> {
        let envelope = MessageEnvelope::new(message.as_bytes().to_vec(), "", "", 0, false);
        self.handle_envelope(&envelope, message).await
    }

    async fn handle_envelope(&mut self, envelope: &MessageEnvelope, message: &str) -> anyhow::Result<()> {
        info!(routing_key = %envelope.routing_key(), "Received message: {}", message);
        let entry = ReceivedMessage {
            id: Uuid::new_v4(),
            routing_key: envelope.routing_key().to_string(),
            message_id: envelope.message_id().map(str::to_string),
            body: message.to_string(),
            received_at: Utc::now(),
        };

        self.uow.begin_transaction()?;
        self.uow
            .run_blocking(move |context| {
                Repository::<ReceivedMessage, S>::new(context.clone()).add(entry)?;
                context.commit()
            })
            .await?;
        Ok(())
    }
}

/// Opens a fresh unit of work on `store` for every message.
#[derive(Clone)]
pub struct JournalHandlerFactory<S: Store> {
    store: S,
}

impl<S: Store> JournalHandlerFactory<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: Store> HandlerFactory for JournalHandlerFactory<S> {
    type Handler = JournalHandler<S>;

    fn create(&self) -> anyhow::Result<JournalHandler<S>> {
        Ok(JournalHandler {
            uow: UnitOfWork::new(&self.store)?,
        })
    }
}
