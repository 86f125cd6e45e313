//! Server error types.

use thiserror::Error;

use polymcp_protocol::McpError;
use polymcp_transport::TransportError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors surfaced by the server façade and session plumbing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// Protocol-level failure, with its wire code preserved.
    #[error("protocol error: {0}")]
    Protocol(#[from] McpError),

    /// Transport-layer failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A feature was registered under a capability the server never declared.
    #[error("capability not declared by this server: {0}")]
    UnsupportedCapability(&'static str),

    /// A façade call named a session this server does not know.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Payload (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else.
    #[error("internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    /// The JSON-RPC code this error would map to on the wire.
    pub fn error_code(&self) -> i32 {
        match self {
            Self::Protocol(err) => err.code(),
            Self::Serialization(_) => -32602,
            Self::Transport(_)
            | Self::UnsupportedCapability(_)
            | Self::SessionNotFound(_)
            | Self::Internal(_) => -32603,
        }
    }
}
