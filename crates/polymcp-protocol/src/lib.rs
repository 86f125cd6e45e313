//! # polymcp-protocol
//!
//! Protocol layer for the polymcp server runtime: JSON-RPC 2.0 framing with
//! MCP message classification, the method catalog, capability records, the
//! payload type catalog, protocol version negotiation, and URI templates.
//!
//! This crate is transport- and runtime-agnostic. Everything here is plain
//! data plus codecs; the session/engine machinery lives in `polymcp-server`
//! and the wire carriers in `polymcp-transport`.

pub mod error;
pub mod jsonrpc;
pub mod methods;
pub mod types;
pub mod uri_template;
pub mod version;

pub use error::{McpError, McpResult};
pub use jsonrpc::{
    ErrorObject, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, JSONRPC_VERSION,
};
pub use methods::Method;
pub use uri_template::UriTemplate;
pub use version::{
    negotiate_protocol_version, DEFAULT_NEGOTIATED_PROTOCOL_VERSION, LATEST_PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
