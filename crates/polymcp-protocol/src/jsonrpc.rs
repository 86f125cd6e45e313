//! JSON-RPC 2.0 framing for MCP.
//!
//! The wire format is plain JSON-RPC 2.0: requests and responses carry an
//! `id`, notifications do not, and error responses replace `result` with an
//! `error` object. [`JsonRpcMessage`] is the tagged union over the four
//! frame kinds; decoding classifies by the discriminators already present in
//! the wire format (`method`, presence of `id`, `result` vs `error`) rather
//! than trial deserialization, so malformed frames produce a single precise
//! error instead of an untagged-enum blur.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// JSON-RPC version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// Zero-sized marker that serializes as the literal `"2.0"` and refuses
/// anything else on decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "invalid JSON-RPC version: expected '{JSONRPC_VERSION}', got '{version}'"
            )))
        }
    }
}

/// Request identifier: a JSON string or a 64-bit signed integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String identifier
    String(String),
    /// Integer identifier
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// JSON-RPC request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Request identifier
    pub id: RequestId,
    /// Request method name
    pub method: String,
    /// Request parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new request.
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC notification message (no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Notification method name
    pub method: String,
    /// Notification parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }
}

/// Successful JSON-RPC response message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Identifier of the request being answered
    pub id: RequestId,
    /// Response result
    pub result: Value,
}

impl JsonRpcResponse {
    /// Create a new successful response.
    pub fn new(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            result,
        }
    }
}

/// JSON-RPC error object carried inside an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Create a new error object without extra data.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach extra data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// JSON-RPC error response message.
///
/// `id` is `None` (serialized as `null`) only for frames that could not be
/// correlated with a request, i.e. parse errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Identifier of the request being answered; `null` for parse errors
    pub id: Option<RequestId>,
    /// The error object
    pub error: ErrorObject,
}

impl JsonRpcError {
    /// Create a new error response for a known request.
    pub fn new(id: RequestId, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            error,
        }
    }

    /// Create an error response with a `null` id (parse/framing errors).
    pub fn without_id(error: ErrorObject) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: None,
            error,
        }
    }
}

/// Standard JSON-RPC and MCP error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Parse error (-32700)
    ParseError,
    /// Invalid request (-32600)
    InvalidRequest,
    /// Method not found (-32601)
    MethodNotFound,
    /// Invalid params (-32602)
    InvalidParams,
    /// Internal error (-32603)
    InternalError,
    /// Connection closed (-32000)
    ConnectionClosed,
    /// Request timeout (-32001)
    RequestTimeout,
    /// Application-defined error (outside the reserved range)
    Application(i32),
}

impl ErrorCode {
    /// Numeric wire code.
    pub fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ConnectionClosed => -32000,
            Self::RequestTimeout => -32001,
            Self::Application(code) => code,
        }
    }

    /// Standard message for the code.
    pub fn message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::ConnectionClosed => "Connection closed",
            Self::RequestTimeout => "Request timed out",
            Self::Application(_) => "Application error",
        }
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32000 => Self::ConnectionClosed,
            -32001 => Self::RequestTimeout,
            other => Self::Application(other),
        }
    }
}

impl From<ErrorCode> for ErrorObject {
    fn from(code: ErrorCode) -> Self {
        Self::new(code.code(), code.message())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// Tagged union over the four JSON-RPC frame kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// Request (has `id` and `method`)
    Request(JsonRpcRequest),
    /// Successful response (has `id` and `result`)
    Response(JsonRpcResponse),
    /// Error response (has `error`)
    Error(JsonRpcError),
    /// Notification (has `method`, no `id`)
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// The method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) | Self::Error(_) => None,
        }
    }

    /// The correlation id, when the frame carries one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Error(e) => e.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// True for frames that expect a response.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    /// True for response and error frames.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Response(_) | Self::Error(_))
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(r: JsonRpcRequest) -> Self {
        Self::Request(r)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(r: JsonRpcResponse) -> Self {
        Self::Response(r)
    }
}

impl From<JsonRpcError> for JsonRpcMessage {
    fn from(e: JsonRpcError) -> Self {
        Self::Error(e)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(n: JsonRpcNotification) -> Self {
        Self::Notification(n)
    }
}

impl Serialize for JsonRpcMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Request(r) => r.serialize(serializer),
            Self::Response(r) => r.serialize(serializer),
            Self::Error(e) => e.serialize(serializer),
            Self::Notification(n) => n.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error as DeError;

        let value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| DeError::custom("JSON-RPC message must be an object"))?;

        // Classification by the wire discriminators. A frame with `method`
        // is a request or notification depending on `id`; otherwise the
        // presence of `error` vs `result` picks the response kind.
        if obj.contains_key("method") {
            if obj.contains_key("id") {
                JsonRpcRequest::deserialize(value).map(Self::Request)
            } else {
                JsonRpcNotification::deserialize(value).map(Self::Notification)
            }
            .map_err(DeError::custom)
        } else if obj.contains_key("error") {
            JsonRpcError::deserialize(value)
                .map(Self::Error)
                .map_err(DeError::custom)
        } else if obj.contains_key("result") {
            JsonRpcResponse::deserialize(value)
                .map(Self::Response)
                .map_err(DeError::custom)
        } else {
            Err(DeError::custom(
                "JSON-RPC message has neither method, result, nor error",
            ))
        }
    }
}
