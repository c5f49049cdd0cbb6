//! Collaborator-facing facade over the transport components.
//!
//! Business services use this surface only: register a handler for a queue
//! and message type, issue typed calls and publishes, and receive typed
//! decoded results or errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::codec::SchemaCodec;
use crate::command::CommandPublisher;
use crate::config::TransportConfig;
use crate::connection::ConnectionManager;
use crate::error::{Result, TransportError};
use crate::events::{EventConsumer, EventHandler, EventPublisher};
use crate::rpc::{RpcClient, RpcHandler, RpcServer};
use crate::topology::Topology;

/// The transport surface business services program against.
///
/// Implemented by [`MessageBus`]; services take `Arc<dyn MessageTransport>`
/// so tests can substitute a double.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Call `queue` with a typed request and await the typed reply.
    async fn call(
        &self,
        queue: &str,
        type_name: &str,
        request: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value>;

    /// Register an RPC handler for `queue` and start serving.
    async fn register_handler(
        &self,
        queue: &str,
        request_type: &str,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<()>;

    /// Publish a fire-and-forget event to the topic exchange.
    async fn publish_event(&self, routing_key: &str, type_name: &str, value: &Value) -> Result<()>;

    /// Subscribe an event handler to `queue` and start consuming.
    async fn subscribe(
        &self,
        queue: &str,
        type_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()>;

    /// Send a command to a named queue, no reply expected.
    async fn publish_command(&self, queue: &str, type_name: &str, value: &Value) -> Result<()>;
}

/// One connected transport: RPC, events, and commands over a shared broker
/// connection.
pub struct MessageBus {
    connection: Arc<ConnectionManager>,
    codec: Arc<SchemaCodec>,
    rpc_client: RpcClient,
    rpc_server: RpcServer,
    event_publisher: EventPublisher,
    event_consumer: EventConsumer,
    command_publisher: CommandPublisher,
}

impl MessageBus {
    /// Connect to the broker and declare `topology` plus the events
    /// exchange. Retries internally until the broker is reachable.
    pub async fn connect(
        config: TransportConfig,
        codec: SchemaCodec,
        topology: Topology,
    ) -> Result<Self> {
        let codec = Arc::new(codec);
        let topology = topology.topic_exchange(config.events.exchange.clone());

        let connection = ConnectionManager::connect(config.broker.clone(), topology).await?;

        let bus = Self {
            rpc_client: RpcClient::new(
                Arc::clone(&connection),
                Arc::clone(&codec),
                config.rpc.clone(),
            ),
            rpc_server: RpcServer::new(
                Arc::clone(&connection),
                Arc::clone(&codec),
                config.consumer.clone(),
            ),
            event_publisher: EventPublisher::new(
                Arc::clone(&connection),
                Arc::clone(&codec),
                config.events.exchange.clone(),
            ),
            event_consumer: EventConsumer::new(
                Arc::clone(&connection),
                Arc::clone(&codec),
                config.consumer.clone(),
            ),
            command_publisher: CommandPublisher::new(Arc::clone(&connection), Arc::clone(&codec)),
            connection,
            codec,
        };

        info!("Message bus ready");
        Ok(bus)
    }

    /// Connect using the codec named by `schema.descriptor_path`.
    pub async fn connect_from_config(config: TransportConfig, topology: Topology) -> Result<Self> {
        let path = config.schema.descriptor_path.clone().ok_or_else(|| {
            TransportError::Config("schema.descriptor_path is not set".to_string())
        })?;
        let codec = SchemaCodec::from_file(&path)?;
        Self::connect(config, codec, topology).await
    }

    /// Call `queue` with a typed request and await the typed reply.
    pub async fn call(
        &self,
        queue: &str,
        type_name: &str,
        request: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.rpc_client.call(queue, type_name, request, timeout).await
    }

    /// Register an RPC handler for `queue` and start serving.
    pub async fn register_handler(
        &self,
        queue: &str,
        request_type: &str,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<()> {
        self.rpc_server.handle(queue, request_type, handler).await
    }

    /// Publish a fire-and-forget event to the topic exchange.
    pub async fn publish_event(
        &self,
        routing_key: &str,
        type_name: &str,
        value: &Value,
    ) -> Result<()> {
        self.event_publisher
            .publish_event(routing_key, type_name, value)
            .await
    }

    /// Subscribe an event handler to `queue` and start consuming.
    pub async fn subscribe(
        &self,
        queue: &str,
        type_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        self.event_consumer.subscribe(queue, type_name, handler).await
    }

    /// Send a command to a named queue, no reply expected.
    pub async fn publish_command(&self, queue: &str, type_name: &str, value: &Value) -> Result<()> {
        self.command_publisher
            .publish_command(queue, type_name, value)
            .await
    }

    /// Calls currently awaiting replies.
    pub fn outstanding_calls(&self) -> usize {
        self.rpc_client.outstanding()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn codec(&self) -> &Arc<SchemaCodec> {
        &self.codec
    }

    /// Tear down the broker connection. Terminal.
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }
}

#[async_trait]
impl MessageTransport for MessageBus {
    async fn call(
        &self,
        queue: &str,
        type_name: &str,
        request: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        MessageBus::call(self, queue, type_name, request, timeout).await
    }

    async fn register_handler(
        &self,
        queue: &str,
        request_type: &str,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<()> {
        MessageBus::register_handler(self, queue, request_type, handler).await
    }

    async fn publish_event(&self, routing_key: &str, type_name: &str, value: &Value) -> Result<()> {
        MessageBus::publish_event(self, routing_key, type_name, value).await
    }

    async fn subscribe(
        &self,
        queue: &str,
        type_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        MessageBus::subscribe(self, queue, type_name, handler).await
    }

    async fn publish_command(&self, queue: &str, type_name: &str, value: &Value) -> Result<()> {
        MessageBus::publish_command(self, queue, type_name, value).await
    }
}
