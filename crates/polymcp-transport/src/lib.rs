//! # polymcp-transport
//!
//! Transport layer for the polymcp server runtime.
//!
//! The [`Transport`] trait is the seam between the protocol engine and the
//! wire: a duplex carrier of JSON-RPC frames. This crate provides
//!
//! - [`InMemoryTransport`]: a connected pair for tests and same-process
//!   embedding,
//! - [`StreamableHttpService`] / [`StreamableHttpServerTransport`]: the MCP
//!   Streamable HTTP transport (POST/GET/DELETE on one endpoint, SSE
//!   streaming, session affinity, resumable replay),
//! - [`EventStore`] and an in-memory implementation backing `Last-Event-ID`
//!   resumption,
//! - a pure SSE codec in [`sse`].

pub mod error;
pub mod event_store;
pub mod memory;
pub mod sse;
pub mod streamable;
pub mod traits;

pub use error::{TransportError, TransportResult};
pub use event_store::{EventStore, InMemoryEventStore};
pub use memory::InMemoryTransport;
pub use streamable::{
    StreamableHttpConfig, StreamableHttpConfigBuilder, StreamableHttpServerTransport,
    StreamableHttpService, HEADER_LAST_EVENT_ID, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID,
};
pub use traits::{Transport, TransportMessage};
