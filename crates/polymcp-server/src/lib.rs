//! # polymcp-server
//!
//! The MCP server runtime: a session-aware JSON-RPC dispatcher with
//! capability negotiation, feature registries with change fan-out, and
//! server-initiated client calls.
//!
//! ## Architecture
//!
//! - [`ProtocolEngine`]: one per connection; request/response correlation,
//!   timeouts, cooperative cancellation.
//! - [`FeatureRegistry`]: thread-safe tool/prompt/resource maps with
//!   ordered change listeners.
//! - [`NotificationService`]: stamps registry events and fans them out to
//!   per-session jobs with subscription filtering.
//! - [`ServerSession`]: one engine per client; handles `initialize`,
//!   routes feature requests, exposes server→client operations.
//! - [`Server`]: owns registries and sessions; everything composes, nothing
//!   inherits.
//!
//! ## Example
//!
//! ```no_run
//! use polymcp_protocol::types::{CallToolResult, ServerCapabilities, Tool};
//! use polymcp_server::{tool_handler, Server};
//! use polymcp_transport::StreamableHttpConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::builder()
//!     .name("demo-server")
//!     .version("1.0.0")
//!     .capabilities(ServerCapabilities::default().with_tools(true))
//!     .build();
//!
//! server.add_tool(
//!     Tool::new("greet").with_description("Say hello"),
//!     tool_handler(|_params, _ctx| async move { Ok(CallToolResult::text("hello")) }),
//! )?;
//!
//! let service = server.streamable_http_service(StreamableHttpConfig::default());
//! let router = service.router();
//! // axum::serve(listener, router) ...
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod context;
pub mod error;
pub mod handlers;
pub mod notifications;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use context::Context;
pub use error::{ServerError, ServerResult};
pub use handlers::{
    prompt_handler, resource_handler, tool_handler, PromptHandler, RegisteredPrompt,
    RegisteredResource, RegisteredResourceTemplate, RegisteredTool, ResourceHandler, ToolHandler,
};
pub use notifications::{NotificationService, NotificationSink, ServerEvent};
pub use protocol::{
    notification_handler, request_handler, NotificationHandler, ProtocolEngine, ProtocolOptions,
    RequestContext, RequestHandler, RequestOptions,
};
pub use registry::{FeatureKey, FeatureRegistry, RegistryListener};
pub use server::{Server, ServerBuilder};
pub use session::ServerSession;
