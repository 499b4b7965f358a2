//! RPC error types.

use thiserror::Error;

/// Errors surfaced by the transport and the layers stacked on it.
///
/// Errors are `Clone` so a single upstream failure can be delivered to
/// every caller that was coalesced into that call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The upstream call failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// HTTP error response.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The upstream sequence failed mid-stream.
    #[error("Sequence error: {0}")]
    Sequence(String),

    /// The caller cancelled before a reply arrived.
    #[error("Call cancelled")]
    Cancelled,

    /// Failed to encode or decode a payload.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The number of stream replicas does not match the number of waiters.
    #[error("Replication mismatch: expected {expected} replicas, got {actual}")]
    ReplicationMismatch { expected: usize, actual: usize },

    /// The reply channel was dropped without an answer.
    #[error("Call dropped before a reply was sent")]
    Dropped,
}

impl RpcError {
    /// Create a transport error from any displayable value.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        RpcError::Transport(message.to_string())
    }

    /// Create a sequence error from any displayable value.
    pub fn sequence(message: impl std::fmt::Display) -> Self {
        RpcError::Sequence(message.to_string())
    }

    /// Whether this error is a caller-side cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RpcError::Cancelled)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Decode(e.to_string())
    }
}
