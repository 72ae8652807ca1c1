use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable};
use std::borrow::Cow;
use std::str::Utf8Error;

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// One delivered message plus the broker metadata needed to settle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    body: Vec<u8>,
    routing_key: String,
    exchange: String,
    delivery_tag: u64,
    redelivered: bool,
    message_id: Option<String>,
    delivery_count: Option<u32>,
}

impl MessageEnvelope {
    pub fn new(
        body: impl Into<Vec<u8>>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        delivery_tag: u64,
        redelivered: bool,
    ) -> Self {
        Self {
            body: body.into(),
            routing_key: routing_key.into(),
            exchange: exchange.into(),
            delivery_tag,
            redelivered,
            message_id: None,
            delivery_count: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Prior delivery attempts as reported by the broker.
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = Some(delivery_count);
        self
    }

    pub fn from_delivery(delivery: &Delivery) -> Self {
        let mut envelope = Self::new(
            delivery.data.clone(),
            delivery.exchange.as_str(),
            delivery.routing_key.as_str(),
            delivery.delivery_tag,
            delivery.redelivered,
        );
        envelope.message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string());
        envelope.delivery_count = delivery
            .properties
            .headers()
            .as_ref()
            .and_then(delivery_count_header);
        envelope
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_text(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    /// Body for log lines; invalid UTF-8 is replaced.
    pub fn body_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn delivery_count(&self) -> Option<u32> {
        self.delivery_count
    }

    /// 1 for a first delivery. `None` when the broker does not count deliveries
    /// and the message is a redelivery.
    pub fn attempt(&self) -> Option<u32> {
        match (self.delivery_count, self.redelivered) {
            (Some(count), _) => Some(count.saturating_add(1)),
            (None, false) => Some(1),
            (None, true) => None,
        }
    }
}

fn delivery_count_header(headers: &FieldTable) -> Option<u32> {
    let (_, value) = headers
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == DELIVERY_COUNT_HEADER)?;

    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };
    u32::try_from(count).ok()
}
