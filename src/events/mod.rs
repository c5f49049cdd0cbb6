//! Fire-and-forget pub/sub over a topic exchange.
//!
//! Events are published with routing keys of the form `<entity>.<action>`
//! (e.g. `delivery.created`, `customer.updated`). Consumers bind durable
//! queues to the exchange via the topology and subscribe one handler per
//! queue. Delivery is at-least-once with no ordering guarantee across
//! queues.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::codec::SchemaCodec;
use crate::config::ConsumerConfig;
use crate::connection::ConnectionManager;
use crate::dlq;
use crate::envelope::{Destination, Envelope};
use crate::error::{Result, TransportError};

/// Handler for events delivered from a subscribed queue.
pub trait EventHandler: Send + Sync {
    /// Process one decoded event.
    fn handle(&self, event: Value) -> BoxFuture<'static, std::result::Result<(), TransportError>>;
}

/// Publishes events to the topic exchange.
pub struct EventPublisher {
    connection: Arc<ConnectionManager>,
    codec: Arc<SchemaCodec>,
    exchange: String,
}

impl EventPublisher {
    pub fn new(
        connection: Arc<ConnectionManager>,
        codec: Arc<SchemaCodec>,
        exchange: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            codec,
            exchange: exchange.into(),
        }
    }

    /// Publish one event. Best-effort, at-least-once: failures are reported
    /// to the caller after bounded retries and never affect other publishes.
    pub async fn publish_event(
        &self,
        routing_key: &str,
        type_name: &str,
        value: &Value,
    ) -> Result<()> {
        const MAX_RETRIES: usize = 5;

        let payload = self.codec.encode(type_name, value)?;
        let envelope = Envelope::new(
            Destination::Exchange {
                exchange: self.exchange.clone(),
                routing_key: routing_key.to_string(),
            },
            type_name,
            payload,
        )
        .durable();

        // Exponential backoff with jitter to prevent thundering herd
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_RETRIES)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self.connection.publish(&envelope).await {
                Ok(()) => {
                    debug!(
                        exchange = %self.exchange,
                        routing_key = %routing_key,
                        type_name = %type_name,
                        "Published event"
                    );
                    return Ok(());
                }
                Err(TransportError::Closed) => return Err(TransportError::Closed),
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Event publish failed, retrying"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TransportError::Publish("Max retries exceeded".to_string())))
    }
}

/// Consumes events from subscribed queues, one handler per queue.
pub struct EventConsumer {
    connection: Arc<ConnectionManager>,
    codec: Arc<SchemaCodec>,
    config: ConsumerConfig,
    subscriptions: Mutex<HashSet<String>>,
}

impl EventConsumer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        codec: Arc<SchemaCodec>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            connection,
            codec,
            config,
            subscriptions: Mutex::new(HashSet::new()),
        }
    }

    /// Register `handler` for `queue` and start consuming.
    ///
    /// At most one handler per queue; registering a second is an error.
    /// The consumer task survives broker disconnects by re-establishing its
    /// channel once the connection manager reports readiness.
    pub async fn subscribe(
        &self,
        queue: &str,
        type_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        if !self.codec.contains(type_name) {
            return Err(TransportError::Decode(format!(
                "Unknown message type '{}'",
                type_name
            )));
        }

        {
            let mut subscriptions = self.subscriptions.lock().await;
            if !subscriptions.insert(queue.to_string()) {
                return Err(TransportError::Subscribe(format!(
                    "Queue '{}' already has a handler",
                    queue
                )));
            }
        }

        let connection = Arc::clone(&self.connection);
        let codec = Arc::clone(&self.codec);
        let config = self.config.clone();
        let queue = queue.to_string();
        let type_name = type_name.to_string();

        tokio::spawn(async move {
            consume_loop(connection, codec, config, queue, type_name, handler).await;
        });

        Ok(())
    }
}

/// Consumer loop with reconnection.
async fn consume_loop(
    connection: Arc<ConnectionManager>,
    codec: Arc<SchemaCodec>,
    config: ConsumerConfig,
    queue: String,
    type_name: String,
    handler: Arc<dyn EventHandler>,
) {
    loop {
        // consume() rebuilds the connection itself when it is down, so a
        // consume-only process still drives reconnection
        match connection.consume(&queue, "courier-consumer", false).await {
            Ok((channel, mut consumer)) => {
                info!(queue = %queue, "Consumer connected, processing messages");

                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            process_delivery(
                                &channel, delivery, &codec, &config, &queue, &type_name, &handler,
                            )
                            .await;
                        }
                        Err(e) => {
                            error!(queue = %queue, error = %e, "Consumer delivery error, will reconnect");
                            break;
                        }
                    }
                }

                if connection.is_closed() {
                    break;
                }
                info!(queue = %queue, "Consumer stream ended, reconnecting");
            }
            Err(TransportError::Closed) => break,
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to set up consumer, retrying");
            }
        }

        tokio::time::sleep(connection.reconnect_delay()).await;
    }

    debug!(queue = %queue, "Consumer loop stopped");
}

/// Decode, invoke the handler, and settle the delivery.
async fn process_delivery(
    channel: &lapin::Channel,
    delivery: lapin::message::Delivery,
    codec: &SchemaCodec,
    config: &ConsumerConfig,
    queue: &str,
    type_name: &str,
    handler: &Arc<dyn EventHandler>,
) {
    let value = match codec.decode(type_name, &delivery.data) {
        Ok(value) => value,
        Err(e) => {
            let reason = e.to_string();
            if let Err(settle_err) =
                dlq::settle_failure(channel, delivery, queue, config, &reason).await
            {
                error!(queue = %queue, error = %settle_err, "Failed to settle undecodable delivery");
            }
            return;
        }
    };

    debug!(queue = %queue, type_name = %type_name, "Received event");

    match handler.handle(value).await {
        Ok(()) => {
            if let Err(e) = delivery.ack(Default::default()).await {
                error!(queue = %queue, error = %e, "Failed to ack delivery");
            }
        }
        Err(e) => {
            let reason = e.to_string();
            if let Err(settle_err) =
                dlq::settle_failure(channel, delivery, queue, config, &reason).await
            {
                error!(queue = %queue, error = %settle_err, "Failed to settle failed delivery");
            }
        }
    }
}
