//! RPC server: consumes requests, invokes registered handlers, replies.
//!
//! Whether a handler succeeds or returns a business-level error, the result
//! is encoded and published to the request's `reply_to` with the original
//! correlation id — callers always receive a typed reply for business
//! errors, never a transport failure. Only transport and decoding failures
//! go through the bounded redelivery ladder.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::HANDLER_ERROR_HEADER;
use crate::codec::SchemaCodec;
use crate::config::ConsumerConfig;
use crate::connection::ConnectionManager;
use crate::dlq;
use crate::envelope::{Destination, Envelope};
use crate::error::{Result, TransportError};

/// A handler's successful result: a typed reply value.
#[derive(Debug, Clone)]
pub struct RpcReply {
    pub type_name: String,
    pub value: Value,
}

impl RpcReply {
    pub fn new(type_name: impl Into<String>, value: Value) -> Self {
        Self {
            type_name: type_name.into(),
            value,
        }
    }
}

/// Handler for requests consumed from a registered queue.
pub trait RpcHandler: Send + Sync {
    /// Process one decoded request.
    ///
    /// An `Err` is delivered to the caller as a typed error payload, not a
    /// transport fault.
    fn handle(
        &self,
        request: Value,
    ) -> BoxFuture<'static, std::result::Result<RpcReply, TransportError>>;
}

/// Serves RPC requests from registered queues.
pub struct RpcServer {
    connection: Arc<ConnectionManager>,
    codec: Arc<SchemaCodec>,
    config: ConsumerConfig,
    registered: Mutex<HashSet<String>>,
}

impl RpcServer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        codec: Arc<SchemaCodec>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            connection,
            codec,
            config,
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// Register `handler` for requests of `request_type` on `queue` and
    /// start serving.
    ///
    /// At most one handler per queue; registering a second is an error.
    pub async fn handle(
        &self,
        queue: &str,
        request_type: &str,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<()> {
        if !self.codec.contains(request_type) {
            return Err(TransportError::Decode(format!(
                "Unknown message type '{}'",
                request_type
            )));
        }

        {
            let mut registered = self.registered.lock().await;
            if !registered.insert(queue.to_string()) {
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
        let request_type = request_type.to_string();

        tokio::spawn(async move {
            serve_loop(connection, codec, config, queue, request_type, handler).await;
        });

        Ok(())
    }
}

/// Server consumer loop with reconnection.
async fn serve_loop(
    connection: Arc<ConnectionManager>,
    codec: Arc<SchemaCodec>,
    config: ConsumerConfig,
    queue: String,
    request_type: String,
    handler: Arc<dyn RpcHandler>,
) {
    loop {
        match connection.consume(&queue, "courier-rpc-server", false).await {
            Ok((channel, mut consumer)) => {
                info!(queue = %queue, request_type = %request_type, "RPC server consuming");

                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            serve_request(
                                &connection,
                                &channel,
                                delivery,
                                &codec,
                                &config,
                                &queue,
                                &request_type,
                                &handler,
                            )
                            .await;
                        }
                        Err(e) => {
                            error!(queue = %queue, error = %e, "RPC consumer error, will reconnect");
                            break;
                        }
                    }
                }

                if connection.is_closed() {
                    break;
                }
                info!(queue = %queue, "RPC server stream ended, reconnecting");
            }
            Err(TransportError::Closed) => break,
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to set up RPC server consumer, retrying");
            }
        }

        tokio::time::sleep(connection.reconnect_delay()).await;
    }

    debug!(queue = %queue, "RPC server loop stopped");
}

/// Decode, invoke, reply, ack.
#[allow(clippy::too_many_arguments)]
async fn serve_request(
    connection: &Arc<ConnectionManager>,
    channel: &Channel,
    delivery: Delivery,
    codec: &SchemaCodec,
    config: &ConsumerConfig,
    queue: &str,
    request_type: &str,
    handler: &Arc<dyn RpcHandler>,
) {
    // A request we cannot reply to is a transport-level failure; the
    // redelivery ladder eventually parks it instead of looping forever.
    let (correlation_id, reply_to) = match (
        delivery.properties.correlation_id().clone(),
        delivery.properties.reply_to().clone(),
    ) {
        (Some(correlation_id), Some(reply_to)) => {
            (correlation_id.to_string(), reply_to.to_string())
        }
        _ => {
            let reason = "Request missing correlation_id or reply_to";
            if let Err(e) = dlq::settle_failure(channel, delivery, queue, config, reason).await {
                error!(queue = %queue, error = %e, "Failed to settle unroutable request");
            }
            return;
        }
    };

    let request = match codec.decode(request_type, &delivery.data) {
        Ok(request) => request,
        Err(e) => {
            let reason = e.to_string();
            if let Err(settle_err) =
                dlq::settle_failure(channel, delivery, queue, config, &reason).await
            {
                error!(queue = %queue, error = %settle_err, "Failed to settle undecodable request");
            }
            return;
        }
    };

    debug!(queue = %queue, correlation_id = %correlation_id, "Received RPC request");

    // Business errors become typed error replies; so do replies that fail
    // to encode, since the caller would otherwise only see a timeout.
    let reply = match handler.handle(request).await {
        Ok(reply) => match codec.encode(&reply.type_name, &reply.value) {
            Ok(payload) => {
                Envelope::new(Destination::Queue(reply_to), &reply.type_name, payload)
                    .with_correlation(correlation_id.clone())
            }
            Err(e) => error_reply(&reply_to, request_type, &correlation_id, &e.to_string()),
        },
        Err(e) => error_reply(&reply_to, request_type, &correlation_id, &e.to_string()),
    };

    if let Err(e) = connection.publish(&reply).await {
        // the caller can still be served by a redelivery, so requeue the
        // request rather than dropping it
        error!(queue = %queue, correlation_id = %correlation_id, error = %e, "Failed to publish reply");
        if let Err(settle_err) =
            dlq::settle_failure(channel, delivery, queue, config, &e.to_string()).await
        {
            error!(queue = %queue, error = %settle_err, "Failed to settle unreplied request");
        }
        return;
    }

    if let Err(e) = delivery.ack(Default::default()).await {
        error!(queue = %queue, error = %e, "Failed to ack request");
    }
}

/// Reply envelope carrying a business-level error.
fn error_reply(reply_to: &str, request_type: &str, correlation_id: &str, message: &str) -> Envelope {
    let mut headers = FieldTable::default();
    headers.insert(
        HANDLER_ERROR_HEADER.into(),
        AMQPValue::LongString(message.into()),
    );

    Envelope::new(
        Destination::Queue(reply_to.to_string()),
        request_type,
        bytes::Bytes::new(),
    )
    .with_correlation(correlation_id)
    .with_headers(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_reply_carries_header_and_correlation() {
        let envelope = error_reply(
            "courier.reply.abc",
            "courier.test.GetOrder",
            "corr-1",
            "order not found",
        );

        assert_eq!(
            envelope.destination,
            Destination::Queue("courier.reply.abc".to_string())
        );
        assert_eq!(envelope.correlation_id.as_deref(), Some("corr-1"));
        assert!(envelope.payload.is_empty());

        let headers = envelope.headers.expect("headers set");
        match headers.inner().get(HANDLER_ERROR_HEADER) {
            Some(AMQPValue::LongString(s)) => {
                assert_eq!(String::from_utf8_lossy(s.as_bytes()), "order not found");
            }
            other => panic!("unexpected header value: {:?}", other),
        }
    }
}
