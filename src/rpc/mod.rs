//! Call/response semantics over the broker.
//!
//! This module contains:
//! - `RpcClient`: encode, publish with correlation id + reply address,
//!   await the correlated reply or time out
//! - `RpcServer`: consume requests, invoke registered handlers, reply
//! - `PendingRequests`: outstanding calls, resolved exactly once

pub mod client;
pub(crate) mod pending;
pub mod server;

pub use client::RpcClient;
pub use server::{RpcHandler, RpcReply, RpcServer};

/// Header marking a reply as a business-level error; carries the message.
pub const HANDLER_ERROR_HEADER: &str = "x-error";
