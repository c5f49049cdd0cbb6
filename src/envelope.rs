//! Message envelope: everything the broker needs to route one payload.

use bytes::Bytes;
use lapin::types::FieldTable;
use lapin::BasicProperties;

use crate::codec::CONTENT_TYPE;

/// Where a message is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Exchange + routing key (events).
    Exchange {
        exchange: String,
        routing_key: String,
    },
    /// Named queue via the default direct exchange (commands, RPC).
    Queue(String),
}

impl Destination {
    pub(crate) fn exchange(&self) -> &str {
        match self {
            Destination::Exchange { exchange, .. } => exchange,
            Destination::Queue(_) => "",
        }
    }

    pub(crate) fn routing_key(&self) -> &str {
        match self {
            Destination::Exchange { routing_key, .. } => routing_key,
            Destination::Queue(queue) => queue,
        }
    }
}

/// A single outbound message.
///
/// `correlation_id` must be unique among an RPC client's outstanding calls;
/// `reply_to` is set only on RPC requests. `type_name` travels as broker
/// metadata (the AMQP `type` property), never inside the payload.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub destination: Destination,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub type_name: String,
    pub payload: Bytes,
    pub timestamp: i64,
    pub durable: bool,
    pub headers: Option<FieldTable>,
}

impl Envelope {
    /// Envelope with the common defaults: now-timestamped, no correlation.
    pub fn new(destination: Destination, type_name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            destination,
            correlation_id: None,
            reply_to: None,
            type_name: type_name.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp(),
            durable: false,
            headers: None,
        }
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Broker message metadata for this envelope.
    pub(crate) fn properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_kind(self.type_name.as_str().into())
            .with_timestamp(self.timestamp as u64)
            .with_delivery_mode(if self.durable { 2 } else { 1 });

        if let Some(ref id) = self.correlation_id {
            properties = properties.with_correlation_id(id.as_str().into());
        }
        if let Some(ref reply_to) = self.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }
        if let Some(ref headers) = self.headers {
            properties = properties.with_headers(headers.clone());
        }

        properties
    }
}
