//! The transport seam.
//!
//! A [`Transport`] is a duplex carrier of [`JsonRpcMessage`] frames. The
//! protocol engine drives `receive` in its read loop and pushes outbound
//! frames through `send`; it never sees bytes, headers, or sockets. STDIO,
//! WebSocket, or any other carrier plugs in behind this trait; this crate
//! ships the in-memory pair and the Streamable HTTP implementation.

use std::fmt;

use async_trait::async_trait;

use polymcp_protocol::{JsonRpcMessage, RequestId};

use crate::error::TransportResult;

/// An outbound frame plus routing metadata.
///
/// `related_request_id` is set by the protocol engine when a notification or
/// server-initiated request is emitted in the context of an inbound request;
/// stream-oriented transports use it to pick the stream the frame belongs to.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    /// The frame to deliver.
    pub message: JsonRpcMessage,
    /// Inbound request this frame relates to, if any.
    pub related_request_id: Option<RequestId>,
}

impl TransportMessage {
    /// Wrap a frame with no related request.
    pub fn new(message: impl Into<JsonRpcMessage>) -> Self {
        Self {
            message: message.into(),
            related_request_id: None,
        }
    }

    /// Wrap a frame related to an inbound request.
    pub fn related(message: impl Into<JsonRpcMessage>, request_id: RequestId) -> Self {
        Self {
            message: message.into(),
            related_request_id: Some(request_id),
        }
    }
}

impl From<JsonRpcMessage> for TransportMessage {
    fn from(message: JsonRpcMessage) -> Self {
        Self::new(message)
    }
}

/// A duplex carrier of JSON-RPC frames.
///
/// Implementations are cheap to clone behind `Arc` internals and are closed
/// exactly once by the session that owns them; `close` after `close` is a
/// no-op.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Deliver a frame to the peer.
    ///
    /// May suspend under backpressure from a slow peer. Fails with
    /// [`crate::TransportError::Closed`] once the transport is closed.
    async fn send(&self, message: TransportMessage) -> TransportResult<()>;

    /// Wait for the next inbound frame.
    ///
    /// Returns `Ok(None)` once the transport is closed and drained; the
    /// engine treats that as end-of-connection.
    async fn receive(&self) -> TransportResult<Option<JsonRpcMessage>>;

    /// Close the transport, waking any pending `receive`.
    async fn close(&self) -> TransportResult<()>;

    /// Transport-assigned session identifier, when the carrier has one
    /// (the Streamable HTTP transport mints one per stateful session).
    fn session_id(&self) -> Option<String> {
        None
    }
}
