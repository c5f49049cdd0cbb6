//! RPC client: synchronous-style calls over the broker.
//!
//! Each call publishes a request carrying a fresh correlation id and a reply
//! address, then suspends its caller until the correlated reply arrives or
//! the deadline fires — whichever happens first, never both. A single reply
//! consumer, started lazily on first use, dispatches replies for all
//! outstanding calls on the connection.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;
use serde_json::Value;
use tokio::sync::{oneshot, watch, OnceCell, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::pending::{PendingRequests, ReplyMessage, ReplyOutcome};
use super::HANDLER_ERROR_HEADER;
use crate::codec::SchemaCodec;
use crate::config::{ReplyMode, RpcConfig};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::envelope::{Destination, Envelope};
use crate::error::{Result, TransportError};

/// RabbitMQ's built-in ephemeral reply pseudo-queue.
const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

struct ReplyConsumer {
    /// The `reply_to` address requests carry.
    address: String,
    /// Channel the reply consumer lives on. Direct reply-to requires
    /// requests to be published on this same channel.
    channel: Arc<RwLock<Option<Channel>>>,
}

/// Issues typed calls against named queues.
pub struct RpcClient {
    connection: Arc<ConnectionManager>,
    codec: Arc<SchemaCodec>,
    config: RpcConfig,
    pending: Arc<PendingRequests>,
    reply: OnceCell<ReplyConsumer>,
}

impl RpcClient {
    pub fn new(
        connection: Arc<ConnectionManager>,
        codec: Arc<SchemaCodec>,
        config: RpcConfig,
    ) -> Self {
        Self {
            connection,
            codec,
            config,
            pending: Arc::new(PendingRequests::new()),
            reply: OnceCell::new(),
        }
    }

    /// Call `queue` with a `type_name`-typed request and await the reply.
    ///
    /// `timeout` defaults to the configured RPC timeout. The caller receives
    /// the decoded reply, a `Timeout`, a `Handler` error raised by the remote
    /// handler, or a `Publish`/`Connection` failure — all potentially
    /// retryable at the business layer; the transport itself never retries a
    /// call.
    pub async fn call(
        &self,
        queue: &str,
        type_name: &str,
        request: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.connection.is_closed() {
            return Err(TransportError::Closed);
        }

        let reply = self.reply_consumer().await?;
        let payload = self.codec.encode(type_name, request)?;

        let correlation_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), sender);

        let envelope = Envelope::new(Destination::Queue(queue.to_string()), type_name, payload)
            .with_correlation(correlation_id.clone())
            .with_reply_to(reply.address.clone());

        let published = match self.config.reply {
            ReplyMode::ExclusiveQueue => self.connection.publish(&envelope).await,
            ReplyMode::DirectReplyTo => {
                let channel = reply.channel.read().await.clone();
                match channel {
                    Some(channel) => self.connection.publish_on(&channel, &envelope).await,
                    None => Err(TransportError::Publish(
                        "Reply channel unavailable".to_string(),
                    )),
                }
            }
        };

        if let Err(e) = published {
            // the pending entry must not outlive a failed publish
            self.pending.take(&correlation_id);
            return Err(e);
        }

        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());
        let message =
            await_reply(receiver, &self.pending, &correlation_id, queue, timeout).await?;

        if let Some(error) = message.handler_error {
            return Err(TransportError::Handler(error));
        }

        let reply_type = message.type_name.ok_or_else(|| {
            TransportError::Decode("Reply carries no message type".to_string())
        })?;
        self.codec.decode(&reply_type, &message.payload)
    }

    /// Number of calls currently awaiting replies.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Start the shared reply consumer on first use.
    async fn reply_consumer(&self) -> Result<&ReplyConsumer> {
        self.reply
            .get_or_try_init(|| async {
                let address = match self.config.reply {
                    ReplyMode::ExclusiveQueue => format!("courier.reply.{}", Uuid::new_v4()),
                    ReplyMode::DirectReplyTo => DIRECT_REPLY_TO.to_string(),
                };

                let slot = Arc::new(RwLock::new(None));

                // First setup happens before the first request is published,
                // so a fast reply cannot beat the consumer.
                let consumer =
                    setup_reply_consumer(&self.connection, self.config.reply, &address, &slot)
                        .await?;

                tokio::spawn(reply_loop(
                    Arc::clone(&self.connection),
                    Arc::clone(&self.pending),
                    self.config.reply,
                    address.clone(),
                    Arc::clone(&slot),
                    consumer,
                ));
                tokio::spawn(watch_disconnects(
                    self.connection.subscribe_state(),
                    Arc::clone(&self.pending),
                ));

                info!(reply_to = %address, "RPC reply consumer started");

                Ok(ReplyConsumer {
                    address,
                    channel: slot,
                })
            })
            .await
    }
}

/// Declare (if needed) and consume the reply address on a fresh channel.
async fn setup_reply_consumer(
    connection: &Arc<ConnectionManager>,
    mode: ReplyMode,
    address: &str,
    slot: &Arc<RwLock<Option<Channel>>>,
) -> Result<lapin::Consumer> {
    let channel = connection.create_channel().await?;

    if mode == ReplyMode::ExclusiveQueue {
        channel
            .queue_declare(
                address,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                TransportError::Subscribe(format!("Failed to declare reply queue: {}", e))
            })?;
    }

    // Replies are consumed without acks; a lost reply is covered by the
    // caller's deadline.
    let consumer = channel
        .basic_consume(
            address,
            "courier-reply",
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| TransportError::Subscribe(format!("Failed to consume replies: {}", e)))?;

    *slot.write().await = Some(channel);
    Ok(consumer)
}

/// Reply consumer loop with reconnection.
async fn reply_loop(
    connection: Arc<ConnectionManager>,
    pending: Arc<PendingRequests>,
    mode: ReplyMode,
    address: String,
    slot: Arc<RwLock<Option<Channel>>>,
    initial: lapin::Consumer,
) {
    let mut consumer = Some(initial);

    loop {
        let mut stream = match consumer.take() {
            Some(stream) => stream,
            // setup rebuilds the connection itself when it is down
            None => match setup_reply_consumer(&connection, mode, &address, &slot).await {
                Ok(stream) => stream,
                Err(TransportError::Closed) => break,
                Err(e) => {
                    error!(error = %e, "Failed to re-establish reply consumer, retrying");
                    tokio::time::sleep(connection.reconnect_delay()).await;
                    continue;
                }
            },
        };

        while let Some(delivery) = stream.next().await {
            match delivery {
                Ok(delivery) => dispatch_reply(delivery, &pending),
                Err(e) => {
                    error!(error = %e, "Reply consumer error, will reconnect");
                    break;
                }
            }
        }

        *slot.write().await = None;
        if connection.is_closed() {
            break;
        }
        info!("Reply stream ended, reconnecting");
        tokio::time::sleep(connection.reconnect_delay()).await;
    }

    debug!("Reply consumer loop stopped");
}

/// Route one reply to the pending call it correlates with.
fn dispatch_reply(delivery: Delivery, pending: &PendingRequests) {
    let correlation_id = match delivery.properties.correlation_id() {
        Some(id) => id.to_string(),
        None => {
            warn!("Dropping reply without correlation id");
            return;
        }
    };

    let handler_error = delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(HANDLER_ERROR_HEADER))
        .and_then(|value| match value {
            AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
            _ => None,
        });

    let message = ReplyMessage {
        payload: delivery.data,
        type_name: delivery
            .properties
            .kind()
            .as_ref()
            .map(|kind| kind.to_string()),
        handler_error,
    };

    if !pending.complete(&correlation_id, Ok(message)) {
        // the call already timed out; drop without error or leak
        debug!(correlation_id = %correlation_id, "Dropping reply with no pending request");
    }
}

/// Fail all outstanding calls whenever the connection drops.
///
/// A reply addressed to the stale ephemeral reply queue is lost anyway, so
/// waiting out each deadline only delays a guaranteed failure.
async fn watch_disconnects(
    mut state: watch::Receiver<ConnectionState>,
    pending: Arc<PendingRequests>,
) {
    loop {
        if state.changed().await.is_err() {
            break;
        }
        let current = *state.borrow_and_update();
        match current {
            ConnectionState::Disconnected => {
                let failed =
                    pending.drain(|| TransportError::Connection("Connection lost".to_string()));
                if failed > 0 {
                    warn!(failed = %failed, "Failed outstanding calls after disconnect");
                }
            }
            ConnectionState::Closed => {
                pending.drain(|| TransportError::Closed);
                break;
            }
            _ => {}
        }
    }
}

/// Race the reply against the deadline; exactly one side resolves the call.
pub(crate) async fn await_reply(
    mut receiver: oneshot::Receiver<ReplyOutcome>,
    pending: &PendingRequests,
    correlation_id: &str,
    queue: &str,
    timeout: Duration,
) -> Result<ReplyMessage> {
    tokio::select! {
        outcome = &mut receiver => {
            outcome.map_err(|_| TransportError::Connection("Reply channel dropped".to_string()))?
        }
        _ = tokio::time::sleep(timeout) => {
            if pending.take(correlation_id) {
                Err(TransportError::Timeout {
                    queue: queue.to_string(),
                    timeout,
                })
            } else {
                // a reply won the race; its send is imminent
                match receiver.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(TransportError::Connection(
                        "Reply channel dropped".to_string(),
                    )),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::time::Instant;

    fn reply_message(payload: &[u8]) -> ReplyMessage {
        ReplyMessage {
            payload: payload.to_vec(),
            type_name: Some("courier.test.Order".to_string()),
            handler_error: None,
        }
    }

    #[tokio::test]
    async fn test_correlation_ids_distinct_under_concurrency() {
        let handles: Vec<_> = (0..32)
            .map(|_| tokio::spawn(async { (0..64).map(|_| Uuid::new_v4().to_string()).collect::<Vec<_>>() }))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.expect("task") {
                assert!(seen.insert(id), "correlation id collision");
            }
        }
        assert_eq!(seen.len(), 32 * 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_before_deadline_resolves_call() {
        let pending = Arc::new(PendingRequests::new());
        let (tx, rx) = oneshot::channel();
        pending.insert("corr-1".to_string(), tx);

        let dispatcher = Arc::clone(&pending);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            dispatcher.complete("corr-1", Ok(reply_message(b"ok")));
        });

        let message = await_reply(rx, &pending, "corr-1", "q", Duration::from_millis(100))
            .await
            .expect("reply wins");
        assert_eq!(message.payload, b"ok");
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_at_timeout_not_before() {
        let pending = Arc::new(PendingRequests::new());
        let (tx, rx) = oneshot::channel();
        pending.insert("corr-1".to_string(), tx);

        let start = Instant::now();
        let err = await_reply(rx, &pending, "corr-1", "orders.get.queue", Duration::from_millis(100))
            .await
            .expect_err("no reply ever comes");

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(150), "fired late: {:?}", elapsed);
        assert!(matches!(err, TransportError::Timeout { .. }));

        // no leak: the pending entry is gone
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_after_timeout_is_dropped() {
        let pending = Arc::new(PendingRequests::new());
        let (tx, rx) = oneshot::channel();
        pending.insert("corr-1".to_string(), tx);

        let err = await_reply(rx, &pending, "corr-1", "q", Duration::from_millis(100))
            .await
            .expect_err("timeout");
        assert!(matches!(err, TransportError::Timeout { .. }));

        // the late reply finds no pending request and is silently dropped
        assert!(!pending.complete("corr-1", Ok(reply_message(b"late"))));
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_racing_the_deadline_is_not_lost() {
        // the reply removes the sender before the deadline task can take it;
        // whichever select branch runs, the call resolves with the reply
        let pending = Arc::new(PendingRequests::new());
        let (tx, rx) = oneshot::channel();
        pending.insert("corr-1".to_string(), tx);
        pending.complete("corr-1", Ok(reply_message(b"photo-finish")));

        let message = await_reply(rx, &pending, "corr-1", "q", Duration::from_millis(1))
            .await
            .expect("reply accepted");
        assert_eq!(message.payload, b"photo-finish");
    }
}
