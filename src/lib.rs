//! Courier - broker-backed messaging transport
//!
//! Fabricates call/response (RPC) and fire-and-forget (event) semantics on
//! top of an at-least-once, unordered AMQP broker: correlated replies over a
//! multiplexed connection, deadline enforcement, idempotent topology, and a
//! schema-based binary codec.

pub mod bus;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod events;
pub mod rpc;
pub mod topology;

pub use bus::{MessageBus, MessageTransport};
pub use codec::SchemaCodec;
pub use command::CommandPublisher;
pub use config::{ReplyMode, TransportConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use envelope::{Destination, Envelope};
pub use error::{Result, TransportError};
pub use events::{EventConsumer, EventHandler, EventPublisher};
pub use rpc::{RpcClient, RpcHandler, RpcReply, RpcServer};
pub use topology::Topology;
