//! Server sessions.
//!
//! A [`ServerSession`] is one client connection: a protocol engine bound to
//! that client's transport, the peer state learned at `initialize`, the
//! session's logging level, and the request handlers for exactly the
//! capabilities this server declared. Sessions never outlive their entry in
//! the server's session registry; closing is idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock as SyncRwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use polymcp_protocol::types::{
    CallToolParams, CallToolResult, ClientCapabilities, CreateMessageParams, CreateMessageResult,
    ElicitParams, ElicitResult, EmptyResult, GetPromptParams, Implementation, InitializeParams,
    InitializeResult, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListRootsResult, ListToolsResult, LoggingLevel, LoggingMessageParams, ProgressToken,
    ReadResourceParams, ResourceUpdatedParams, ServerCapabilities, SetLevelParams,
    SubscribeParams, UnsubscribeParams,
};
use polymcp_protocol::version::negotiate_protocol_version;
use polymcp_protocol::{McpError, McpResult, Method, RequestId};
use polymcp_transport::Transport;

use crate::capabilities::{assert_client_capability, assert_server_capability, server_supports};
use crate::context::Context;
use crate::handlers::{
    RegisteredPrompt, RegisteredResource, RegisteredResourceTemplate, RegisteredTool,
};
use crate::notifications::{NotificationService, NotificationSink, ServerEvent};
use crate::protocol::{
    notification_handler, request_handler, ProtocolEngine, RequestContext, RequestOptions,
};
use crate::registry::FeatureRegistry;
use crate::server::ServerInner;

struct PeerInfo {
    client_info: Implementation,
    capabilities: ClientCapabilities,
    protocol_version: String,
}

pub(crate) struct SessionCore {
    id: String,
    engine: ProtocolEngine,
    server: Weak<ServerInner>,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    tools: Arc<FeatureRegistry<RegisteredTool>>,
    prompts: Arc<FeatureRegistry<RegisteredPrompt>>,
    resources: Arc<FeatureRegistry<RegisteredResource>>,
    resource_templates: Arc<FeatureRegistry<RegisteredResourceTemplate>>,
    notifications: NotificationService,
    peer: SyncRwLock<Option<PeerInfo>>,
    logging_level: SyncRwLock<Option<LoggingLevel>>,
    initialized: AtomicBool,
    cleaned: AtomicBool,
}

/// One client connection to the server.
#[derive(Clone)]
pub struct ServerSession {
    core: Arc<SessionCore>,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.core.id)
            .field("initialized", &self.core.initialized.load(Ordering::Acquire))
            .finish()
    }
}

fn parse_params<P: DeserializeOwned>(params: Option<Value>) -> McpResult<P> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|err| McpError::InvalidParams(err.to_string()))
}

fn extract_progress_token(params: &Option<Value>) -> Option<ProgressToken> {
    params
        .as_ref()
        .and_then(|value| value.get("_meta"))
        .and_then(|meta| meta.get("progressToken"))
        .and_then(|token| serde_json::from_value(token.clone()).ok())
}

/// Installs `$handler` on the engine for `$method`, holding the session core
/// weakly so handler registration does not keep a closed session alive.
macro_rules! install_request_handler {
    ($engine:expr, $core:expr, $method:expr, $handler:ident) => {{
        let weak = Arc::downgrade($core);
        $engine.set_request_handler(
            &$method,
            request_handler(move |params, ctx| {
                let weak = weak.clone();
                async move {
                    let core = weak.upgrade().ok_or(McpError::ConnectionClosed)?;
                    SessionCore::$handler(core, params, ctx).await
                }
            }),
        );
    }};
}

impl ServerSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        engine: ProtocolEngine,
        server: Weak<ServerInner>,
        server_info: Implementation,
        capabilities: ServerCapabilities,
        instructions: Option<String>,
        tools: Arc<FeatureRegistry<RegisteredTool>>,
        prompts: Arc<FeatureRegistry<RegisteredPrompt>>,
        resources: Arc<FeatureRegistry<RegisteredResource>>,
        resource_templates: Arc<FeatureRegistry<RegisteredResourceTemplate>>,
        notifications: NotificationService,
    ) -> Self {
        let session = Self {
            core: Arc::new(SessionCore {
                id,
                engine,
                server,
                server_info,
                capabilities,
                instructions,
                tools,
                prompts,
                resources,
                resource_templates,
                notifications,
                peer: SyncRwLock::new(None),
                logging_level: SyncRwLock::new(None),
                initialized: AtomicBool::new(false),
                cleaned: AtomicBool::new(false),
            }),
        };
        session.install_handlers();
        session
    }

    /// Handlers are installed for exactly the methods whose capability this
    /// server declared; everything else falls through to MethodNotFound.
    fn install_handlers(&self) {
        let core = &self.core;
        let engine = &core.engine;
        let caps = &core.capabilities;

        install_request_handler!(engine, core, Method::Initialize, handle_initialize);
        install_request_handler!(engine, core, Method::Ping, handle_ping);

        if caps.tools.is_some() {
            install_request_handler!(engine, core, Method::ToolsList, handle_tools_list);
            install_request_handler!(engine, core, Method::ToolsCall, handle_tools_call);
        }
        if caps.prompts.is_some() {
            install_request_handler!(engine, core, Method::PromptsList, handle_prompts_list);
            install_request_handler!(engine, core, Method::PromptsGet, handle_prompts_get);
        }
        if caps.resources.is_some() {
            install_request_handler!(engine, core, Method::ResourcesList, handle_resources_list);
            install_request_handler!(
                engine,
                core,
                Method::ResourcesTemplatesList,
                handle_resource_templates_list
            );
            install_request_handler!(engine, core, Method::ResourcesRead, handle_resources_read);
            let subscribe_declared = caps
                .resources
                .as_ref()
                .is_some_and(|resources| resources.subscribe == Some(true));
            if subscribe_declared {
                install_request_handler!(
                    engine,
                    core,
                    Method::ResourcesSubscribe,
                    handle_resources_subscribe
                );
                install_request_handler!(
                    engine,
                    core,
                    Method::ResourcesUnsubscribe,
                    handle_resources_unsubscribe
                );
            }
        }
        if caps.logging.is_some() {
            install_request_handler!(engine, core, Method::LoggingSetLevel, handle_set_level);
        }

        let weak = Arc::downgrade(core);
        engine.set_notification_handler(
            &Method::NotificationInitialized,
            notification_handler(move |_params| {
                let weak = weak.clone();
                async move {
                    if let Some(core) = weak.upgrade() {
                        core.initialized.store(true, Ordering::Release);
                        tracing::debug!(session_id = %core.id, "client confirmed initialization");
                    }
                }
            }),
        );
        engine.set_notification_handler(
            &Method::NotificationRootsListChanged,
            notification_handler(|_params| async move {
                tracing::debug!("client roots changed");
            }),
        );
    }

    /// Bind to the transport and start serving.
    pub(crate) fn connect(&self, transport: Arc<dyn Transport>) {
        let session = self.clone();
        self.core.engine.on_close(move || {
            session.spawn_cleanup();
        });
        self.core.engine.connect(transport);
    }

    /// The session id (transport-assigned, or a fresh UUID v4).
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// True once the client sent `notifications/initialized`.
    pub fn is_initialized(&self) -> bool {
        self.core.initialized.load(Ordering::Acquire)
    }

    /// Capabilities the client declared at `initialize`.
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.core
            .peer
            .read()
            .as_ref()
            .map(|peer| peer.capabilities.clone())
    }

    /// Client implementation info from `initialize`.
    pub fn client_info(&self) -> Option<Implementation> {
        self.core
            .peer
            .read()
            .as_ref()
            .map(|peer| peer.client_info.clone())
    }

    /// The protocol version negotiated with this client.
    pub fn negotiated_protocol_version(&self) -> Option<String> {
        self.core
            .peer
            .read()
            .as_ref()
            .map(|peer| peer.protocol_version.clone())
    }

    /// The session's current logging threshold, if the client set one.
    pub fn logging_level(&self) -> Option<LoggingLevel> {
        *self.core.logging_level.read()
    }

    fn strict(&self) -> bool {
        self.core.engine.options().enforce_strict_capabilities
    }

    async fn request_typed<R: DeserializeOwned>(
        &self,
        method: Method,
        params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<R> {
        if self.strict() {
            let caps = self.client_capabilities();
            assert_client_capability(caps.as_ref(), &method)?;
        }
        let value = self.core.engine.request(&method, params, options).await?;
        serde_json::from_value(value)
            .map_err(|err| McpError::Parse(format!("malformed {method} result: {err}")))
    }

    pub(crate) async fn notify_with_related(
        &self,
        method: &Method,
        params: Option<Value>,
        related_request_id: Option<RequestId>,
    ) -> McpResult<()> {
        self.core
            .engine
            .notification(method, params, related_request_id)
            .await
    }

    fn assert_own_capability(&self, method: &Method) -> McpResult<()> {
        if self.strict() {
            assert_server_capability(&self.core.capabilities, method)?;
        }
        Ok(())
    }

    /// Ping the client.
    pub async fn ping(&self) -> McpResult<EmptyResult> {
        self.request_typed(Method::Ping, None, RequestOptions::default())
            .await
    }

    /// Ask the client to sample a model response. Requires the client's
    /// `sampling` capability.
    pub async fn create_message(
        &self,
        params: CreateMessageParams,
    ) -> McpResult<CreateMessageResult> {
        self.create_message_with_options(params, RequestOptions::default())
            .await
    }

    pub(crate) async fn create_message_with_options(
        &self,
        params: CreateMessageParams,
        options: RequestOptions,
    ) -> McpResult<CreateMessageResult> {
        self.request_typed(
            Method::SamplingCreateMessage,
            Some(serde_json::to_value(params)?),
            options,
        )
        .await
    }

    /// Ask the client for its filesystem roots. Requires the client's
    /// `roots` capability.
    pub async fn list_roots(&self) -> McpResult<ListRootsResult> {
        self.list_roots_with_options(RequestOptions::default()).await
    }

    pub(crate) async fn list_roots_with_options(
        &self,
        options: RequestOptions,
    ) -> McpResult<ListRootsResult> {
        self.request_typed(Method::RootsList, None, options).await
    }

    /// Ask the client's user for structured input. Requires the client's
    /// `elicitation` capability.
    pub async fn elicit(&self, params: ElicitParams) -> McpResult<ElicitResult> {
        self.elicit_with_options(params, RequestOptions::default())
            .await
    }

    pub(crate) async fn elicit_with_options(
        &self,
        params: ElicitParams,
        options: RequestOptions,
    ) -> McpResult<ElicitResult> {
        self.request_typed(
            Method::ElicitationCreate,
            Some(serde_json::to_value(params)?),
            options,
        )
        .await
    }

    /// Send `notifications/message`, subject to the session's logging level:
    /// messages below the threshold are dropped without touching the wire.
    pub async fn send_logging_message(&self, params: LoggingMessageParams) -> McpResult<()> {
        self.assert_own_capability(&Method::NotificationMessage)?;
        if let Some(current) = *self.core.logging_level.read() {
            if params.level < current {
                return Ok(());
            }
        }
        self.core
            .engine
            .notification(
                &Method::NotificationMessage,
                Some(serde_json::to_value(params)?),
                None,
            )
            .await
    }

    /// Send `notifications/resources/updated` for one URI.
    pub async fn send_resource_updated(&self, uri: impl Into<String>) -> McpResult<()> {
        self.assert_own_capability(&Method::NotificationResourcesUpdated)?;
        let params = ResourceUpdatedParams { uri: uri.into() };
        self.core
            .engine
            .notification(
                &Method::NotificationResourcesUpdated,
                Some(serde_json::to_value(params)?),
                None,
            )
            .await
    }

    /// Send `notifications/resources/list_changed`.
    pub async fn send_resource_list_changed(&self) -> McpResult<()> {
        self.assert_own_capability(&Method::NotificationResourcesListChanged)?;
        self.core
            .engine
            .notification(&Method::NotificationResourcesListChanged, None, None)
            .await
    }

    /// Send `notifications/tools/list_changed`.
    pub async fn send_tool_list_changed(&self) -> McpResult<()> {
        self.assert_own_capability(&Method::NotificationToolsListChanged)?;
        self.core
            .engine
            .notification(&Method::NotificationToolsListChanged, None, None)
            .await
    }

    /// Send `notifications/prompts/list_changed`.
    pub async fn send_prompt_list_changed(&self) -> McpResult<()> {
        self.assert_own_capability(&Method::NotificationPromptsListChanged)?;
        self.core
            .engine
            .notification(&Method::NotificationPromptsListChanged, None, None)
            .await
    }

    /// Close the session: fail pending requests, close the transport,
    /// deregister from the server, stop the notification job. Idempotent.
    pub async fn close(&self) -> McpResult<()> {
        self.core.engine.close().await?;
        self.cleanup().await;
        Ok(())
    }

    async fn cleanup(&self) {
        if self.core.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(session_id = %self.core.id, "session closing");
        self.core.notifications.unsubscribe_session(&self.core.id).await;
        if let Some(server) = self.core.server.upgrade() {
            server.sessions.remove(&self.core.id);
            server.run_session_closed_hooks(&self.core.id);
        }
    }

    /// Engine-close hook path (peer disconnect): cleanup off the read loop.
    pub(crate) fn spawn_cleanup(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            session.cleanup().await;
        });
    }
}

impl SessionCore {
    fn session(self: &Arc<Self>) -> ServerSession {
        ServerSession {
            core: Arc::clone(self),
        }
    }

    async fn handle_initialize(
        self: Arc<Self>,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> McpResult<Value> {
        let params: InitializeParams = parse_params(params)?;
        let negotiated = negotiate_protocol_version(&params.protocol_version);
        tracing::debug!(
            session_id = %self.id,
            client = %params.client_info.name,
            requested = %params.protocol_version,
            negotiated,
            "initializing session"
        );
        *self.peer.write() = Some(PeerInfo {
            client_info: params.client_info,
            capabilities: params.capabilities,
            protocol_version: negotiated.to_string(),
        });
        let result = InitializeResult {
            protocol_version: negotiated.to_string(),
            capabilities: self.capabilities.clone(),
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_ping(
        self: Arc<Self>,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> McpResult<Value> {
        Ok(json!({}))
    }

    async fn handle_tools_list(
        self: Arc<Self>,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> McpResult<Value> {
        let result = ListToolsResult {
            tools: self
                .tools
                .values()
                .into_iter()
                .map(|registered| registered.tool)
                .collect(),
            next_cursor: None,
        };
        Ok(serde_json::to_value(result)?)
    }

    /// Tool failures are reported in-band as `CallToolResult{is_error}`;
    /// only cancellation surfaces as a protocol error.
    async fn handle_tools_call(
        self: Arc<Self>,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> McpResult<Value> {
        let progress_token = extract_progress_token(&params);
        let params: CallToolParams = parse_params(params)?;
        let name = params.name.clone();

        let Some(registered) = self.tools.get(&name) else {
            let result = CallToolResult::error(format!("Tool {name} not found"));
            return Ok(serde_json::to_value(result)?);
        };

        let context = Context::new(self.session(), ctx.clone(), progress_token);
        let result = match registered.handler.call(params, context).await {
            Ok(result) => result,
            Err(_) if ctx.is_cancelled() => {
                return Err(McpError::Internal(format!(
                    "tool {name} cancelled before completion"
                )));
            }
            Err(err) => CallToolResult::error(format!("Error executing tool {name}: {err}")),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_prompts_list(
        self: Arc<Self>,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> McpResult<Value> {
        let result = ListPromptsResult {
            prompts: self
                .prompts
                .values()
                .into_iter()
                .map(|registered| registered.prompt)
                .collect(),
            next_cursor: None,
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_prompts_get(
        self: Arc<Self>,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> McpResult<Value> {
        let params: GetPromptParams = parse_params(params)?;
        let Some(registered) = self.prompts.get(&params.name) else {
            return Err(McpError::InvalidParams(format!(
                "Prompt not found: {}",
                params.name
            )));
        };
        let context = Context::new(self.session(), ctx, None);
        let result = registered.handler.get(params, context).await?;
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_resources_list(
        self: Arc<Self>,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> McpResult<Value> {
        let result = ListResourcesResult {
            resources: self
                .resources
                .values()
                .into_iter()
                .map(|registered| registered.resource)
                .collect(),
            next_cursor: None,
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_resource_templates_list(
        self: Arc<Self>,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> McpResult<Value> {
        let result = ListResourceTemplatesResult {
            resource_templates: self
                .resource_templates
                .values()
                .into_iter()
                .map(|registered| registered.template)
                .collect(),
            next_cursor: None,
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_resources_read(
        self: Arc<Self>,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> McpResult<Value> {
        let params: ReadResourceParams = parse_params(params)?;
        let context = Context::new(self.session(), ctx, None);

        if let Some(registered) = self.resources.get(&params.uri) {
            let result = registered.handler.read(params, context).await?;
            return Ok(serde_json::to_value(result)?);
        }
        if let Some(registered) = self.resource_templates.get(&params.uri) {
            let result = registered.handler.read(params, context).await?;
            return Ok(serde_json::to_value(result)?);
        }
        Err(McpError::rpc(
            -32002,
            format!("Resource not found: {}", params.uri),
        ))
    }

    async fn handle_resources_subscribe(
        self: Arc<Self>,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> McpResult<Value> {
        let params: SubscribeParams = parse_params(params)?;
        self.notifications.subscribe_to_resource(&self.id, &params.uri);
        tracing::debug!(session_id = %self.id, uri = %params.uri, "resource subscription added");
        // The protocol does not define an acknowledgement payload.
        Ok(json!({}))
    }

    async fn handle_resources_unsubscribe(
        self: Arc<Self>,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> McpResult<Value> {
        let params: UnsubscribeParams = parse_params(params)?;
        self.notifications
            .unsubscribe_from_resource(&self.id, &params.uri);
        tracing::debug!(session_id = %self.id, uri = %params.uri, "resource subscription removed");
        Ok(json!({}))
    }

    async fn handle_set_level(
        self: Arc<Self>,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> McpResult<Value> {
        let params: SetLevelParams = parse_params(params)?;
        *self.logging_level.write() = Some(params.level);
        Ok(json!({}))
    }
}

/// Adapter feeding the notification broker's filtered events into a
/// session's transport. Capability-gated by skipping: a notification the
/// server never declared support for is silently not sent.
pub(crate) struct SessionNotificationSink {
    pub(crate) session: ServerSession,
}

#[async_trait]
impl NotificationSink for SessionNotificationSink {
    fn sink_id(&self) -> String {
        self.session.id().to_string()
    }

    async fn deliver(&self, event: &ServerEvent) -> McpResult<()> {
        let method = match event {
            ServerEvent::ToolListChanged => Method::NotificationToolsListChanged,
            ServerEvent::PromptListChanged => Method::NotificationPromptsListChanged,
            ServerEvent::ResourceListChanged => Method::NotificationResourcesListChanged,
            ServerEvent::ResourceUpdated { .. } => Method::NotificationResourcesUpdated,
        };
        if !server_supports(&self.session.core.capabilities, &method) {
            return Ok(());
        }
        let params = match event {
            ServerEvent::ResourceUpdated { uri } => Some(serde_json::to_value(
                ResourceUpdatedParams { uri: uri.clone() },
            )?),
            _ => None,
        };
        self.session.core.engine.notification(&method, params, None).await
    }
}
