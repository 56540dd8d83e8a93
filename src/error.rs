use std::time::Duration;

use thiserror::Error;

use crate::CorrelationId;

/// Errors that can occur while talking to the broker or waiting for a reply.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The broker connection could not be established or was lost.
    ///
    /// Fatal at startup; a request-level server error mid-operation.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// No reply carrying the expected correlation id arrived before the deadline.
    #[error("request {correlation_id} timed out after {elapsed:?}")]
    Timeout {
        correlation_id: CorrelationId,
        elapsed: Duration,
    },

    /// The reply payload did not decode into the expected structure.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// The broker refused an operation on a live connection
    /// (locked exclusive queue, inequivalent declaration, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration value missing or unparsable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The blocking worker running a call panicked or was torn down.
    #[error("rpc worker lost: {0}")]
    WorkerLost(String),
}

impl RpcError {
    /// True for errors that a connection retry can fix.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RpcError::TransportUnavailable(_))
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_timeout_display_carries_id() {
        // ---
        let id = CorrelationId::from("abc-123");
        let err = RpcError::Timeout {
            correlation_id: id,
            elapsed: Duration::from_millis(1500),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc-123"), "{msg}");
        assert!(msg.contains("1.5s"), "{msg}");
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        // ---
        assert!(RpcError::TransportUnavailable("down".into()).is_unavailable());
        assert!(!RpcError::Transport("locked".into()).is_unavailable());
        assert!(!RpcError::InvalidConfig("uri".into()).is_unavailable());
    }
}
