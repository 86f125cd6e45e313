//! Protocol error taxonomy.
//!
//! [`McpError`] is the error type surfaced by handlers and by the protocol
//! engine's request futures. Variants map onto JSON-RPC wire codes via
//! [`McpError::code`]; application errors carry their own code, which must
//! sit outside the reserved `-32700..=-32000` range.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::jsonrpc::{ErrorCode, ErrorObject};

/// Result alias for protocol operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors produced while speaking MCP.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum McpError {
    /// The peer sent bytes that do not parse as JSON-RPC.
    #[error("parse error: {0}")]
    Parse(String),

    /// A structurally invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No handler is registered for the method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Parameters failed to decode or validate.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A handler failed in a way the protocol does not model.
    #[error("internal error: {0}")]
    Internal(String),

    /// The connection closed before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The request's deadline elapsed before a response arrived.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// A method was used whose capability the peer never declared.
    ///
    /// Raised locally, before anything reaches the transport.
    #[error("capability not declared by peer: {0}")]
    MissingCapability(String),

    /// An error received from (or destined for) the wire with its code intact.
    #[error("{message}")]
    Rpc {
        /// Wire error code
        code: i32,
        /// Error message
        message: String,
        /// Additional error data
        data: Option<Value>,
    },
}

impl McpError {
    /// Build an application-level error with an explicit wire code.
    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// The JSON-RPC wire code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse(_) => ErrorCode::ParseError.code(),
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest.code(),
            Self::MethodNotFound(_) => ErrorCode::MethodNotFound.code(),
            Self::InvalidParams(_) => ErrorCode::InvalidParams.code(),
            Self::Internal(_) | Self::MissingCapability(_) => ErrorCode::InternalError.code(),
            Self::ConnectionClosed => ErrorCode::ConnectionClosed.code(),
            Self::RequestTimeout(_) => ErrorCode::RequestTimeout.code(),
            Self::Rpc { code, .. } => *code,
        }
    }

    /// Render as a wire error object.
    ///
    /// The message is the error's display form; no backtraces or internal
    /// detail beyond that ever reach the wire.
    pub fn to_error_object(&self) -> ErrorObject {
        let data = match self {
            Self::Rpc { data, .. } => data.clone(),
            _ => None,
        };
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            data,
        }
    }

    /// Reconstruct from a wire error object, recovering known codes.
    pub fn from_error_object(error: &ErrorObject) -> Self {
        match ErrorCode::from(error.code) {
            ErrorCode::ParseError => Self::Parse(error.message.clone()),
            ErrorCode::InvalidRequest => Self::InvalidRequest(error.message.clone()),
            ErrorCode::MethodNotFound => Self::MethodNotFound(error.message.clone()),
            ErrorCode::InvalidParams => Self::InvalidParams(error.message.clone()),
            ErrorCode::ConnectionClosed => Self::ConnectionClosed,
            _ => Self::Rpc {
                code: error.code,
                message: error.message.clone(),
                data: error.data.clone(),
            },
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(McpError::Parse("x".into()).code(), -32700);
        assert_eq!(McpError::InvalidRequest("x".into()).code(), -32600);
        assert_eq!(McpError::MethodNotFound("x".into()).code(), -32601);
        assert_eq!(McpError::InvalidParams("x".into()).code(), -32602);
        assert_eq!(McpError::Internal("x".into()).code(), -32603);
        assert_eq!(McpError::ConnectionClosed.code(), -32000);
        assert_eq!(
            McpError::RequestTimeout(Duration::from_secs(1)).code(),
            -32001
        );
        assert_eq!(McpError::rpc(-32002, "not found").code(), -32002);
    }

    #[test]
    fn wire_object_roundtrip() {
        let err = McpError::rpc(-32002, "Resource not found: mem://x");
        let obj = err.to_error_object();
        assert_eq!(obj.code, -32002);
        let back = McpError::from_error_object(&obj);
        assert_eq!(back.code(), -32002);
        assert_eq!(back.to_string(), "Resource not found: mem://x");
    }

    #[test]
    fn known_codes_recover_variants() {
        let obj = ErrorObject::new(-32601, "Method not found: nope");
        assert!(matches!(
            McpError::from_error_object(&obj),
            McpError::MethodNotFound(_)
        ));
    }
}
