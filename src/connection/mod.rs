//! Broker connection lifecycle.
//!
//! One logical connection per process. Publishing and consuming are
//! multiplexed over it on per-component channels. On broker-initiated
//! disconnect the manager transitions `Connected -> Disconnected` and the
//! next use rebuilds the connection with a fixed-delay retry loop; the full
//! topology is re-declared before readiness is signaled, so dependents never
//! see a connected-but-untopologized broker.

use std::sync::Arc;

use backon::{BackoffBuilder, ConstantBuilder};
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info};

use crate::config::BrokerConfig;
use crate::envelope::Envelope;
use crate::error::{Result, TransportError};
use crate::topology::Topology;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; entered only by explicit shutdown.
    Closed,
}

struct Active {
    connection: Connection,
    /// Shared publishing channel. Consumers get their own channels.
    channel: Channel,
}

/// Owns the process-wide broker connection.
pub struct ConnectionManager {
    config: BrokerConfig,
    topology: Topology,
    inner: RwLock<Option<Active>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    // Serializes reconnection so concurrent callers share one attempt.
    connect_lock: Mutex<()>,
}

impl ConnectionManager {
    /// Connect to the broker and declare `topology`.
    ///
    /// Retries with a fixed delay until the broker is reachable; startup
    /// failures loop internally rather than crashing the process.
    pub async fn connect(config: BrokerConfig, topology: Topology) -> Result<Arc<Self>> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let manager = Arc::new(Self {
            config,
            topology,
            inner: RwLock::new(None),
            state_tx: Arc::new(state_tx),
            state_rx,
            connect_lock: Mutex::new(()),
        });

        manager.ensure_connected().await?;
        Ok(manager)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch for lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Fixed delay between reconnection attempts.
    pub fn reconnect_delay(&self) -> std::time::Duration {
        self.config.reconnect_delay()
    }

    /// Block until the connection is ready (topology declared).
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
            .await
            .map_err(|_| TransportError::Closed)?;
        match *state {
            ConnectionState::Connected => Ok(()),
            _ => Err(TransportError::Closed),
        }
    }

    /// Ensure an established connection, rebuilding it if necessary.
    async fn ensure_connected(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;

        // Another caller may have finished the rebuild while we waited.
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.state_tx.send_replace(ConnectionState::Connecting);

        let backoff_builder = ConstantBuilder::default()
            .with_delay(self.config.reconnect_delay())
            .with_max_times(usize::MAX);
        let mut backoff_iter = backoff_builder.build();

        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }

            match self.establish().await {
                Ok(active) => {
                    // a close() racing the rebuild must stay terminal
                    if self.is_closed() {
                        return Err(TransportError::Closed);
                    }
                    *self.inner.write().await = Some(active);
                    self.state_tx.send_replace(ConnectionState::Connected);
                    info!(url = %self.config.url, "Connected to broker");
                    return Ok(());
                }
                Err(e) => {
                    let delay = backoff_iter
                        .next()
                        .unwrap_or_else(|| self.config.reconnect_delay());
                    error!(
                        error = %e,
                        retry_ms = %delay.as_millis(),
                        "Broker connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One connection attempt: connect, open the publish channel, declare
    /// topology, wire the disconnect callback.
    async fn establish(&self) -> Result<Active> {
        let uri = self.config.amqp_uri();
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to create channel: {}", e)))?;

        self.topology.declare(&channel).await?;

        let state_tx = Arc::clone(&self.state_tx);
        connection.on_error(move |err| {
            error!(error = %err, "Broker connection lost");
            // Closed is terminal; a late error callback must not resurrect it.
            state_tx.send_if_modified(|state| {
                if *state == ConnectionState::Connected {
                    *state = ConnectionState::Disconnected;
                    true
                } else {
                    false
                }
            });
        });

        Ok(Active {
            connection,
            channel,
        })
    }

    /// Publish one envelope.
    ///
    /// Fails with `Publish` when the channel is unavailable; the caller
    /// decides whether to retry.
    pub async fn publish(&self, envelope: &Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.ensure_connected().await?;

        let channel = {
            let guard = self.inner.read().await;
            guard
                .as_ref()
                .map(|active| active.channel.clone())
                .ok_or_else(|| TransportError::Publish("Channel unavailable".to_string()))?
        };

        self.publish_on(&channel, envelope).await
    }

    /// Publish one envelope on a caller-owned channel.
    ///
    /// Needed by direct reply-to, where requests must flow over the same
    /// channel that consumes the pseudo-queue.
    pub(crate) async fn publish_on(&self, channel: &Channel, envelope: &Envelope) -> Result<()> {
        let destination = &envelope.destination;

        let result = channel
            .basic_publish(
                destination.exchange(),
                destination.routing_key(),
                BasicPublishOptions::default(),
                &envelope.payload,
                envelope.properties(),
            )
            .await;

        let confirm = match result {
            Ok(confirm) => confirm,
            Err(e) => {
                self.mark_disconnected();
                return Err(TransportError::Publish(format!("Failed to publish: {}", e)));
            }
        };

        if let Err(e) = confirm.await {
            self.mark_disconnected();
            return Err(TransportError::Publish(format!(
                "Publish confirmation failed: {}",
                e
            )));
        }

        debug!(
            exchange = %destination.exchange(),
            routing_key = %destination.routing_key(),
            type_name = %envelope.type_name,
            "Published message"
        );

        Ok(())
    }

    /// Open a fresh channel on the current connection.
    pub(crate) async fn create_channel(&self) -> Result<Channel> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.ensure_connected().await?;

        let guard = self.inner.read().await;
        let active = guard
            .as_ref()
            .ok_or_else(|| TransportError::Connection("Connection unavailable".to_string()))?;

        active.connection.create_channel().await.map_err(|e| {
            self.mark_disconnected();
            TransportError::Connection(format!("Failed to create channel: {}", e))
        })
    }

    /// Start a consumer on its own channel with a single in-flight delivery.
    ///
    /// Returns the channel alongside the consumer so callers can ack, nack,
    /// and republish on it.
    pub(crate) async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<(Channel, Consumer)> {
        let channel = self.create_channel().await?;

        if !no_ack {
            channel
                .basic_qos(1, BasicQosOptions::default())
                .await
                .map_err(|e| TransportError::Subscribe(format!("Failed to set QoS: {}", e)))?;
        }

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok((channel, consumer))
    }

    fn mark_disconnected(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }

    /// Tear the connection down. Terminal.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.state_tx.send_replace(ConnectionState::Closed);

        if let Some(active) = self.inner.write().await.take() {
            if let Err(e) = active.connection.close(320, "shutdown").await {
                debug!(error = %e, "Connection close reported an error");
            }
        }

        info!("Broker connection closed");
        Ok(())
    }
}
