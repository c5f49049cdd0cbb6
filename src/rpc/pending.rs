//! Outstanding RPC calls, keyed by correlation id.
//!
//! Every pending request is resolved exactly once: insertion, removal by a
//! matching reply, removal on deadline expiry, and drain on disconnect all
//! contend on one mutex, and whichever path removes the sender owns the
//! resolution.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::TransportError;

/// A reply as it arrives off the wire, before decoding.
#[derive(Debug)]
pub(crate) struct ReplyMessage {
    pub payload: Vec<u8>,
    /// Message type from broker metadata; absent on error replies.
    pub type_name: Option<String>,
    /// Business-level error raised by the remote handler.
    pub handler_error: Option<String>,
}

pub(crate) type ReplyOutcome = Result<ReplyMessage, TransportError>;

/// Concurrency-safe map of outstanding calls.
#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<String, oneshot::Sender<ReplyOutcome>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<ReplyOutcome>>> {
        // senders are still valid after a panic elsewhere; recover the map
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call awaiting its reply.
    pub fn insert(&self, correlation_id: String, sender: oneshot::Sender<ReplyOutcome>) {
        self.map().insert(correlation_id, sender);
    }

    /// Resolve the call matching `correlation_id` with `outcome`.
    ///
    /// Returns false when no such call is outstanding — the reply is stale
    /// (its call already timed out) and must be dropped without error.
    pub fn complete(&self, correlation_id: &str, outcome: ReplyOutcome) -> bool {
        match self.map().remove(correlation_id) {
            // a send error means the caller went away; nothing left to do
            Some(sender) => {
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove a call without resolving it (deadline expiry path).
    ///
    /// Returns false when the call was already resolved by a reply.
    pub fn take(&self, correlation_id: &str) -> bool {
        self.map().remove(correlation_id).is_some()
    }

    /// Fail every outstanding call. Returns how many were failed.
    pub fn drain(&self, make_error: impl Fn() -> TransportError) -> usize {
        let drained: Vec<_> = self.map().drain().collect();
        let count = drained.len();
        for (_, sender) in drained {
            let _ = sender.send(Err(make_error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
