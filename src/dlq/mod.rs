//! Bounded redelivery and dead-letter routing for failed deliveries.
//!
//! A delivery that fails processing is retried a bounded number of times and
//! then parked on `<queue>.dlq` for manual review and replay. Without the
//! bound, a permanently-failing message would be redelivered forever.
//!
//! The ladder, per failed delivery:
//! 1. First failure: negative-acknowledge with requeue.
//! 2. Subsequent failures: republish to the same queue with an incremented
//!    `x-retry-count` header, then ack the original (a requeue cannot carry
//!    an updated header).
//! 3. Retry budget exhausted: publish to the dead-letter queue with the
//!    failure reason attached, then ack. With dead-lettering disabled the
//!    message is rejected without requeue instead.

use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicRejectOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;
use tracing::{debug, error, warn};

use crate::config::ConsumerConfig;
use crate::error::{Result, TransportError};

/// Header carrying the republish count.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// Header carrying the terminal failure reason on dead-lettered messages.
pub const DEAD_REASON_HEADER: &str = "x-dead-reason";

/// Dead-letter queue name for `queue`.
pub fn dlq_name(queue: &str) -> String {
    format!("{}.dlq", queue)
}

/// What to do with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryDecision {
    /// Negative-acknowledge with requeue.
    Requeue,
    /// Republish with this retry count, ack the original.
    Retry(u32),
    /// Out of budget; park on the DLQ (or drop), ack the original.
    DeadLetter,
}

/// Pick the next step for a failed delivery.
///
/// `count` is the `x-retry-count` header value, `redelivered` the broker's
/// redelivery flag. The first failure of a fresh message requeues so the
/// redelivery is broker-native; everything after that goes through counted
/// republishes.
pub fn decide(redelivered: bool, count: u32, max_retries: u32) -> RedeliveryDecision {
    if max_retries == 0 {
        return RedeliveryDecision::DeadLetter;
    }
    if count == 0 && !redelivered {
        return RedeliveryDecision::Requeue;
    }
    if count + 1 < max_retries {
        RedeliveryDecision::Retry(count + 1)
    } else {
        RedeliveryDecision::DeadLetter
    }
}

/// Read the retry count header from delivery properties.
pub fn retry_count(delivery: &Delivery) -> u32 {
    delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(RETRY_COUNT_HEADER))
        .and_then(|value| match value {
            AMQPValue::LongInt(n) => Some(*n as u32),
            AMQPValue::LongLongInt(n) => Some(*n as u32),
            AMQPValue::ShortInt(n) => Some(*n as u32),
            _ => None,
        })
        .unwrap_or(0)
}

/// Settle a failed delivery according to the consumer's redelivery policy.
///
/// `queue` is the queue the delivery was consumed from; republishes and the
/// dead-letter copy go out on the consumer's own `channel`.
pub(crate) async fn settle_failure(
    channel: &Channel,
    delivery: Delivery,
    queue: &str,
    config: &ConsumerConfig,
    reason: &str,
) -> Result<()> {
    let count = retry_count(&delivery);

    match decide(delivery.redelivered, count, config.max_retries) {
        RedeliveryDecision::Requeue => {
            debug!(queue = %queue, reason = %reason, "Requeueing failed delivery");
            delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
                .map_err(|e| TransportError::Subscribe(format!("Failed to nack: {}", e)))?;
        }
        RedeliveryDecision::Retry(next_count) => {
            warn!(
                queue = %queue,
                retry = %next_count,
                max_retries = %config.max_retries,
                reason = %reason,
                "Republishing failed delivery"
            );

            let mut headers = delivery
                .properties
                .headers()
                .clone()
                .unwrap_or_else(FieldTable::default);
            headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongInt(next_count as i32));
            let properties = delivery.properties.clone().with_headers(headers);

            channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions::default(),
                    &delivery.data,
                    properties,
                )
                .await
                .map_err(|e| TransportError::Publish(format!("Failed to republish: {}", e)))?
                .await
                .map_err(|e| TransportError::Publish(format!("Republish confirm failed: {}", e)))?;

            delivery
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| TransportError::Subscribe(format!("Failed to ack: {}", e)))?;
        }
        RedeliveryDecision::DeadLetter => {
            if config.dead_letter {
                let dlq = dlq_name(queue);
                error!(queue = %queue, dlq = %dlq, reason = %reason, "Dead-lettering poisoned delivery");

                channel
                    .queue_declare(
                        &dlq,
                        QueueDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| {
                        TransportError::Publish(format!("Failed to declare '{}': {}", dlq, e))
                    })?;

                let mut headers = delivery
                    .properties
                    .headers()
                    .clone()
                    .unwrap_or_else(FieldTable::default);
                headers.insert(
                    DEAD_REASON_HEADER.into(),
                    AMQPValue::LongString(reason.into()),
                );
                let properties = delivery
                    .properties
                    .clone()
                    .with_headers(headers)
                    .with_delivery_mode(2);

                channel
                    .basic_publish(
                        "",
                        &dlq,
                        BasicPublishOptions::default(),
                        &delivery.data,
                        properties,
                    )
                    .await
                    .map_err(|e| {
                        TransportError::Publish(format!("Failed to dead-letter: {}", e))
                    })?
                    .await
                    .map_err(|e| {
                        TransportError::Publish(format!("Dead-letter confirm failed: {}", e))
                    })?;

                delivery
                    .ack(BasicAckOptions::default())
                    .await
                    .map_err(|e| TransportError::Subscribe(format!("Failed to ack: {}", e)))?;
            } else {
                error!(queue = %queue, reason = %reason, "Dropping poisoned delivery");
                delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await
                    .map_err(|e| TransportError::Subscribe(format!("Failed to reject: {}", e)))?;
            }
        }
    }

    Ok(())
}
