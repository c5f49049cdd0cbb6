//! Point-to-point command channel.
//!
//! Commands go to a named durable queue through the default direct exchange;
//! no reply is expected. Consumption happens on the RPC server side or a
//! plain event-style consumer, depending on the service.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::codec::SchemaCodec;
use crate::connection::ConnectionManager;
use crate::envelope::{Destination, Envelope};
use crate::error::Result;

/// Publishes commands to named queues.
pub struct CommandPublisher {
    connection: Arc<ConnectionManager>,
    codec: Arc<SchemaCodec>,
}

impl CommandPublisher {
    pub fn new(connection: Arc<ConnectionManager>, codec: Arc<SchemaCodec>) -> Self {
        Self { connection, codec }
    }

    /// Send one command to `queue`. Persistent, fire-and-forget.
    pub async fn publish_command(&self, queue: &str, type_name: &str, value: &Value) -> Result<()> {
        let payload = self.codec.encode(type_name, value)?;
        let envelope = Envelope::new(
            Destination::Queue(queue.to_string()),
            type_name,
            payload,
        )
        .durable();

        self.connection.publish(&envelope).await?;

        debug!(queue = %queue, type_name = %type_name, "Published command");
        Ok(())
    }
}
