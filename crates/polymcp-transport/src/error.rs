//! Transport error types.

use thiserror::Error;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while carrying JSON-RPC frames.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The transport has been closed.
    #[error("transport closed")]
    Closed,

    /// Failed to deliver a message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to read a message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Failed to serialize or deserialize a frame.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A session id was missing, unknown, or malformed.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// An event id presented for resumption is unknown to the store.
    #[error("unknown event id: {0}")]
    UnknownEventId(String),

    /// An underlying I/O failure.
    #[error("io error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
