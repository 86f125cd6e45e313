//! User-facing feature handlers.
//!
//! A registered feature pairs its wire descriptor with a suspendable
//! handler. Handlers receive the typed params plus a [`Context`] exposing
//! the owning session; capturing the context beyond the handler's lifetime
//! is not supported.

use std::sync::Arc;

use async_trait::async_trait;

use polymcp_protocol::types::{
    CallToolParams, CallToolResult, GetPromptParams, GetPromptResult, Prompt, ReadResourceParams,
    ReadResourceResult, Resource, ResourceTemplate, Tool,
};
use polymcp_protocol::{McpResult, UriTemplate};

use crate::context::Context;

/// Handler behind `tools/call` for one tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool.
    async fn call(&self, params: CallToolParams, ctx: Context) -> McpResult<CallToolResult>;
}

/// Handler behind `prompts/get` for one prompt.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    /// Expand the prompt.
    async fn get(&self, params: GetPromptParams, ctx: Context) -> McpResult<GetPromptResult>;
}

/// Handler behind `resources/read` for one resource or resource template.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Read the resource contents.
    async fn read(&self, params: ReadResourceParams, ctx: Context)
        -> McpResult<ReadResourceResult>;
}

macro_rules! fn_handler {
    ($adapter:ident, $trait:ident, $method:ident, $params:ty, $result:ty, $factory:ident) => {
        struct $adapter<F>(F);

        #[async_trait]
        impl<F, Fut> $trait for $adapter<F>
        where
            F: Fn($params, Context) -> Fut + Send + Sync,
            Fut: std::future::Future<Output = McpResult<$result>> + Send,
        {
            async fn $method(&self, params: $params, ctx: Context) -> McpResult<$result> {
                (self.0)(params, ctx).await
            }
        }

        /// Wrap an async closure as a handler.
        pub fn $factory<F, Fut>(f: F) -> Arc<dyn $trait>
        where
            F: Fn($params, Context) -> Fut + Send + Sync + 'static,
            Fut: std::future::Future<Output = McpResult<$result>> + Send + 'static,
        {
            Arc::new($adapter(f))
        }
    };
}

fn_handler!(
    FnToolHandler,
    ToolHandler,
    call,
    CallToolParams,
    CallToolResult,
    tool_handler
);
fn_handler!(
    FnPromptHandler,
    PromptHandler,
    get,
    GetPromptParams,
    GetPromptResult,
    prompt_handler
);
fn_handler!(
    FnResourceHandler,
    ResourceHandler,
    read,
    ReadResourceParams,
    ReadResourceResult,
    resource_handler
);

/// A tool plus its handler.
#[derive(Clone)]
pub struct RegisteredTool {
    /// Wire descriptor
    pub tool: Tool,
    /// Execution handler
    pub handler: Arc<dyn ToolHandler>,
}

/// A prompt plus its handler.
#[derive(Clone)]
pub struct RegisteredPrompt {
    /// Wire descriptor
    pub prompt: Prompt,
    /// Expansion handler
    pub handler: Arc<dyn PromptHandler>,
}

/// A concrete resource plus its handler.
#[derive(Clone)]
pub struct RegisteredResource {
    /// Wire descriptor
    pub resource: Resource,
    /// Read handler
    pub handler: Arc<dyn ResourceHandler>,
}

/// A resource template plus its compiled matcher and handler.
#[derive(Clone)]
pub struct RegisteredResourceTemplate {
    /// Wire descriptor
    pub template: ResourceTemplate,
    /// Matcher compiled from `template.uri_template` at registration
    pub compiled: UriTemplate,
    /// Read handler for matching URIs
    pub handler: Arc<dyn ResourceHandler>,
}
