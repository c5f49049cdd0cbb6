//! Error taxonomy for transport operations.

use std::time::Duration;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
///
/// `Timeout` and `Handler` surface directly to the calling business logic as
/// typed results; the transport makes no retry decision on the caller's
/// behalf. All variants are potentially retryable at the business layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("No reply from '{queue}' within {timeout:?}")]
    Timeout { queue: String, timeout: Duration },

    #[error("Codec error: {0}")]
    Decode(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport is closed")]
    Closed,
}

impl TransportError {
    /// True for failures of the call/reply path that a caller may retry
    /// against a healthy broker (as opposed to schema or shutdown errors).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_)
                | TransportError::Publish(_)
                | TransportError::Timeout { .. }
        )
    }
}

impl From<config::ConfigError> for TransportError {
    fn from(err: config::ConfigError) -> Self {
        TransportError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TransportError::Connection("down".into()).is_retryable());
        assert!(TransportError::Publish("channel gone".into()).is_retryable());
        assert!(TransportError::Timeout {
            queue: "orders.get.queue".into(),
            timeout: Duration::from_millis(100),
        }
        .is_retryable());

        assert!(!TransportError::Decode("bad payload".into()).is_retryable());
        assert!(!TransportError::Closed.is_retryable());
    }
}
