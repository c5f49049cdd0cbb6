//! Broker topology: exchanges, queues, and bindings declared as data.
//!
//! The full topology is declared by the connection manager on every
//! (re)connect, before readiness is signaled. AMQP declarations are
//! idempotent as long as the arguments match, so declaring the same plan
//! twice is a no-op rather than an error.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind};
use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Exchange flavor used by this transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    /// Routing-key hierarchies (`<entity>.<action>`), used for events.
    Topic,
    /// Exact-match routing, used for commands and RPC requests.
    Direct,
}

impl From<ExchangeType> for ExchangeKind {
    fn from(ty: ExchangeType) -> Self {
        match ty {
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Direct => ExchangeKind::Direct,
        }
    }
}

/// One exchange/queue/binding triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyEntry {
    pub exchange: Option<(String, ExchangeType)>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub durable: bool,
}

/// Declarative broker topology.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    entries: Vec<TopologyEntry>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// A durable topic exchange (events).
    pub fn topic_exchange(mut self, name: impl Into<String>) -> Self {
        self.push(TopologyEntry {
            exchange: Some((name.into(), ExchangeType::Topic)),
            queue: None,
            routing_key: None,
            durable: true,
        });
        self
    }

    /// A durable named queue (commands, RPC requests).
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.push(TopologyEntry {
            exchange: None,
            queue: Some(name.into()),
            routing_key: None,
            durable: true,
        });
        self
    }

    /// A durable queue bound to a topic exchange with a routing pattern
    /// (e.g. `customer.*` or `delivery.created`).
    pub fn bound_queue(
        mut self,
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.push(TopologyEntry {
            exchange: Some((exchange.into(), ExchangeType::Topic)),
            queue: Some(queue.into()),
            routing_key: Some(routing_key.into()),
            durable: true,
        });
        self
    }

    fn push(&mut self, entry: TopologyEntry) {
        // Re-adding an identical entry only makes the declare pass longer.
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    pub fn entries(&self) -> &[TopologyEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declare every entry on `channel`.
    ///
    /// Safe to call repeatedly; matching re-declarations are no-ops on the
    /// broker side.
    pub async fn declare(&self, channel: &Channel) -> Result<()> {
        for entry in &self.entries {
            if let Some((ref exchange, ty)) = entry.exchange {
                channel
                    .exchange_declare(
                        exchange,
                        ty.into(),
                        ExchangeDeclareOptions {
                            durable: entry.durable,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| {
                        TransportError::Connection(format!(
                            "Failed to declare exchange '{}': {}",
                            exchange, e
                        ))
                    })?;
                debug!(exchange = %exchange, "Declared exchange");
            }

            if let Some(ref queue) = entry.queue {
                channel
                    .queue_declare(
                        queue,
                        QueueDeclareOptions {
                            durable: entry.durable,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| {
                        TransportError::Connection(format!(
                            "Failed to declare queue '{}': {}",
                            queue, e
                        ))
                    })?;
                debug!(queue = %queue, "Declared queue");
            }

            if let (Some((ref exchange, _)), Some(ref queue), Some(ref routing_key)) =
                (&entry.exchange, &entry.queue, &entry.routing_key)
            {
                channel
                    .queue_bind(
                        queue,
                        exchange,
                        routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| {
                        TransportError::Connection(format!(
                            "Failed to bind '{}' to '{}': {}",
                            queue, exchange, e
                        ))
                    })?;
                info!(
                    queue = %queue,
                    exchange = %exchange,
                    routing_key = %routing_key,
                    "Bound queue to exchange"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_entries() {
        let topology = Topology::new()
            .topic_exchange("courier.events")
            .queue("orders.get.queue")
            .bound_queue("courier.events", "notifications.queue", "customer.*");

        assert_eq!(topology.entries().len(), 3);
        assert!(topology.entries().iter().all(|e| e.durable));

        let binding = &topology.entries()[2];
        assert_eq!(binding.routing_key.as_deref(), Some("customer.*"));
        assert_eq!(binding.queue.as_deref(), Some("notifications.queue"));
    }

    #[test]
    fn test_duplicate_entries_collapse() {
        let topology = Topology::new()
            .queue("orders.get.queue")
            .queue("orders.get.queue")
            .topic_exchange("courier.events")
            .topic_exchange("courier.events");

        assert_eq!(topology.entries().len(), 2);
    }

    #[test]
    fn test_empty_topology() {
        assert!(Topology::new().is_empty());
        assert!(!Topology::new().queue("q").is_empty());
    }
}
