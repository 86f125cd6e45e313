//! The server façade.
//!
//! A [`Server`] owns the feature registries, the notification broker, and
//! the session registry. It spawns one [`ServerSession`] per connected
//! transport and never extends the protocol engine; sessions compose one.
//!
//! Registry mutations feed the notification broker through listeners, so a
//! single `add_tool` fans out to every connected session that negotiated
//! the matching capability.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock as SyncRwLock;
use uuid::Uuid;

use polymcp_protocol::types::{
    CreateMessageParams, CreateMessageResult, ElicitParams, ElicitResult, EmptyResult,
    Implementation, ListRootsResult, LoggingMessageParams, Prompt, Resource, ResourceTemplate,
    ServerCapabilities, Tool,
};
use polymcp_protocol::{McpError, UriTemplate};
use polymcp_transport::{
    StreamableHttpConfig, StreamableHttpService, Transport,
};

use crate::error::{ServerError, ServerResult};
use crate::handlers::{
    PromptHandler, RegisteredPrompt, RegisteredResource, RegisteredResourceTemplate,
    RegisteredTool, ResourceHandler, ToolHandler,
};
use crate::notifications::{NotificationService, ServerEvent};
use crate::protocol::{ProtocolEngine, ProtocolOptions};
use crate::registry::{FeatureKey, FeatureRegistry, RegistryListener};
use crate::session::{ServerSession, SessionNotificationSink};

type InstructionsProvider = Arc<dyn Fn() -> String + Send + Sync>;
type SessionHook = Arc<dyn Fn(&ServerSession) + Send + Sync>;
type SessionClosedHook = Arc<dyn Fn(&str) + Send + Sync>;

pub(crate) struct ServerInner {
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<InstructionsProvider>,
    options: ProtocolOptions,
    tools: Arc<FeatureRegistry<RegisteredTool>>,
    prompts: Arc<FeatureRegistry<RegisteredPrompt>>,
    resources: Arc<FeatureRegistry<RegisteredResource>>,
    resource_templates: Arc<FeatureRegistry<RegisteredResourceTemplate>>,
    pub(crate) sessions: DashMap<String, ServerSession>,
    pub(crate) notifications: NotificationService,
    connect_hooks: SyncRwLock<Vec<SessionHook>>,
    closed_hooks: SyncRwLock<Vec<SessionClosedHook>>,
}

impl ServerInner {
    pub(crate) fn run_session_closed_hooks(&self, session_id: &str) {
        let hooks = self.closed_hooks.read().clone();
        for hook in hooks {
            hook(session_id);
        }
    }
}

/// An MCP server: registries, notification fan-out, and a session per
/// connected client.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.inner.server_info.name)
            .field("sessions", &self.inner.sessions.len())
            .field("tools", &self.inner.tools.len())
            .finish()
    }
}

// Registry listeners feeding the notification broker. Emission is sync and
// non-blocking, so firing inside the registry's mutation lock is safe.
struct ToolEventsBridge(NotificationService);

impl RegistryListener<RegisteredTool> for ToolEventsBridge {
    fn on_feature_updated(
        &self,
        _key: &FeatureKey,
        _old: Option<&RegisteredTool>,
        _new: Option<&RegisteredTool>,
    ) {
    }

    fn on_list_changed(&self) {
        self.0.emit(ServerEvent::ToolListChanged);
    }
}

struct PromptEventsBridge(NotificationService);

impl RegistryListener<RegisteredPrompt> for PromptEventsBridge {
    fn on_feature_updated(
        &self,
        _key: &FeatureKey,
        _old: Option<&RegisteredPrompt>,
        _new: Option<&RegisteredPrompt>,
    ) {
    }

    fn on_list_changed(&self) {
        self.0.emit(ServerEvent::PromptListChanged);
    }
}

struct ResourceEventsBridge(NotificationService);

impl RegistryListener<RegisteredResource> for ResourceEventsBridge {
    fn on_feature_updated(
        &self,
        key: &FeatureKey,
        _old: Option<&RegisteredResource>,
        new: Option<&RegisteredResource>,
    ) {
        // Any (re-)registration of a concrete resource counts as an update
        // of its contents; subscribed sessions get resources/updated.
        if new.is_some() {
            self.0.emit(ServerEvent::ResourceUpdated {
                uri: key.as_str().to_string(),
            });
        }
    }

    fn on_list_changed(&self) {
        self.0.emit(ServerEvent::ResourceListChanged);
    }
}

struct ResourceTemplateEventsBridge(NotificationService);

impl RegistryListener<RegisteredResourceTemplate> for ResourceTemplateEventsBridge {
    fn on_feature_updated(
        &self,
        _key: &FeatureKey,
        _old: Option<&RegisteredResourceTemplate>,
        _new: Option<&RegisteredResourceTemplate>,
    ) {
    }

    fn on_list_changed(&self) {
        self.0.emit(ServerEvent::ResourceListChanged);
    }
}

impl Server {
    /// Start building a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The server's implementation info.
    pub fn server_info(&self) -> &Implementation {
        &self.inner.server_info
    }

    /// The capabilities this server declares at `initialize`.
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.inner.capabilities
    }

    // -- feature registration ------------------------------------------------

    /// Register a tool. Requires the `tools` capability.
    pub fn add_tool(
        &self,
        tool: Tool,
        handler: Arc<dyn ToolHandler>,
    ) -> ServerResult<()> {
        if self.inner.capabilities.tools.is_none() {
            return Err(ServerError::UnsupportedCapability("tools"));
        }
        let key = FeatureKey::literal(tool.name.clone());
        self.inner.tools.add(key, RegisteredTool { tool, handler });
        Ok(())
    }

    /// Register several tools as one atomic mutation.
    pub fn add_tools(&self, tools: Vec<(Tool, Arc<dyn ToolHandler>)>) -> ServerResult<()> {
        if self.inner.capabilities.tools.is_none() {
            return Err(ServerError::UnsupportedCapability("tools"));
        }
        let items = tools
            .into_iter()
            .map(|(tool, handler)| {
                (
                    FeatureKey::literal(tool.name.clone()),
                    RegisteredTool { tool, handler },
                )
            })
            .collect();
        self.inner.tools.add_all(items);
        Ok(())
    }

    /// Remove a tool by name. Returns whether it existed.
    pub fn remove_tool(&self, name: &str) -> bool {
        self.inner.tools.remove(&FeatureKey::literal(name)).is_some()
    }

    /// Register a prompt. Requires the `prompts` capability.
    pub fn add_prompt(
        &self,
        prompt: Prompt,
        handler: Arc<dyn PromptHandler>,
    ) -> ServerResult<()> {
        if self.inner.capabilities.prompts.is_none() {
            return Err(ServerError::UnsupportedCapability("prompts"));
        }
        let key = FeatureKey::literal(prompt.name.clone());
        self.inner
            .prompts
            .add(key, RegisteredPrompt { prompt, handler });
        Ok(())
    }

    /// Remove a prompt by name. Returns whether it existed.
    pub fn remove_prompt(&self, name: &str) -> bool {
        self.inner
            .prompts
            .remove(&FeatureKey::literal(name))
            .is_some()
    }

    /// Register a concrete resource. Requires the `resources` capability.
    ///
    /// Re-registering an existing URI counts as an update: subscribed
    /// sessions receive `notifications/resources/updated`.
    pub fn add_resource(
        &self,
        resource: Resource,
        handler: Arc<dyn ResourceHandler>,
    ) -> ServerResult<()> {
        if self.inner.capabilities.resources.is_none() {
            return Err(ServerError::UnsupportedCapability("resources"));
        }
        let key = FeatureKey::literal(resource.uri.clone());
        self.inner
            .resources
            .add(key, RegisteredResource { resource, handler });
        Ok(())
    }

    /// Remove a resource by URI. Returns whether it existed.
    pub fn remove_resource(&self, uri: &str) -> bool {
        self.inner
            .resources
            .remove(&FeatureKey::literal(uri))
            .is_some()
    }

    /// Register a resource template. The URI template is compiled here;
    /// malformed templates are rejected. Requires the `resources`
    /// capability.
    pub fn add_resource_template(
        &self,
        template: ResourceTemplate,
        handler: Arc<dyn ResourceHandler>,
    ) -> ServerResult<()> {
        if self.inner.capabilities.resources.is_none() {
            return Err(ServerError::UnsupportedCapability("resources"));
        }
        let compiled = UriTemplate::parse(&template.uri_template)
            .map_err(|err| ServerError::Protocol(McpError::InvalidParams(err.to_string())))?;
        let key = FeatureKey::template(compiled.clone());
        self.inner.resource_templates.add(
            key,
            RegisteredResourceTemplate {
                template,
                compiled,
                handler,
            },
        );
        Ok(())
    }

    /// Remove a resource template by its template text. Returns whether it
    /// existed.
    pub fn remove_resource_template(&self, uri_template: &str) -> bool {
        match UriTemplate::parse(uri_template) {
            Ok(template) => self
                .inner
                .resource_templates
                .remove(&FeatureKey::template(template))
                .is_some(),
            Err(_) => false,
        }
    }

    // -- sessions ------------------------------------------------------------

    /// Create a session over a connected transport.
    ///
    /// Installs the per-capability request handlers, starts the engine's
    /// read loop, records the session, subscribes it to notifications, and
    /// runs connect hooks.
    pub fn create_session(&self, transport: Arc<dyn Transport>) -> ServerSession {
        let session_id = transport
            .session_id()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let engine = ProtocolEngine::new(self.inner.options.clone());
        let instructions = self.inner.instructions.as_ref().map(|provider| provider());

        let session = ServerSession::new(
            session_id.clone(),
            engine,
            Arc::downgrade(&self.inner),
            self.inner.server_info.clone(),
            self.inner.capabilities.clone(),
            instructions,
            Arc::clone(&self.inner.tools),
            Arc::clone(&self.inner.prompts),
            Arc::clone(&self.inner.resources),
            Arc::clone(&self.inner.resource_templates),
            self.inner.notifications.clone(),
        );

        session.connect(transport);
        self.inner
            .sessions
            .insert(session_id.clone(), session.clone());
        self.inner
            .notifications
            .subscribe_session(Arc::new(SessionNotificationSink {
                session: session.clone(),
            }));

        let hooks = self.inner.connect_hooks.read().clone();
        for hook in hooks {
            hook(&session);
        }
        tracing::debug!(session_id, "session created");
        session
    }

    /// Look up a session by id.
    pub fn session(&self, session_id: &str) -> Option<ServerSession> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of all live sessions.
    pub fn sessions(&self) -> Vec<ServerSession> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    fn require_session(&self, session_id: &str) -> ServerResult<ServerSession> {
        self.session(session_id)
            .ok_or_else(|| ServerError::SessionNotFound(session_id.to_string()))
    }

    /// Run `hook` for every newly created session.
    pub fn on_session_connect<F>(&self, hook: F)
    where
        F: Fn(&ServerSession) + Send + Sync + 'static,
    {
        self.inner.connect_hooks.write().push(Arc::new(hook));
    }

    /// Run `hook` with the session id after a session closes.
    pub fn on_session_close<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.closed_hooks.write().push(Arc::new(hook));
    }

    // -- per-session server→client operations --------------------------------

    /// Ping one session's client.
    pub async fn ping_session(&self, session_id: &str) -> ServerResult<EmptyResult> {
        Ok(self.require_session(session_id)?.ping().await?)
    }

    /// Ask one session's client to sample a message.
    pub async fn create_message(
        &self,
        session_id: &str,
        params: CreateMessageParams,
    ) -> ServerResult<CreateMessageResult> {
        Ok(self
            .require_session(session_id)?
            .create_message(params)
            .await?)
    }

    /// Ask one session's client for its roots.
    pub async fn list_roots(&self, session_id: &str) -> ServerResult<ListRootsResult> {
        Ok(self.require_session(session_id)?.list_roots().await?)
    }

    /// Elicit user input from one session's client.
    pub async fn elicit(
        &self,
        session_id: &str,
        params: ElicitParams,
    ) -> ServerResult<ElicitResult> {
        Ok(self.require_session(session_id)?.elicit(params).await?)
    }

    /// Send a logging message to one session, subject to its level filter.
    pub async fn send_logging_message(
        &self,
        session_id: &str,
        params: LoggingMessageParams,
    ) -> ServerResult<()> {
        Ok(self
            .require_session(session_id)?
            .send_logging_message(params)
            .await?)
    }

    // -- broadcast fan-out ---------------------------------------------------

    /// Notify every eligible session that a resource changed.
    pub fn send_resource_updated(&self, uri: impl Into<String>) {
        self.inner
            .notifications
            .emit(ServerEvent::ResourceUpdated { uri: uri.into() });
    }

    /// Notify every eligible session that the resource list changed.
    pub fn send_resource_list_changed(&self) {
        self.inner.notifications.emit(ServerEvent::ResourceListChanged);
    }

    /// Notify every eligible session that the tool list changed.
    pub fn send_tool_list_changed(&self) {
        self.inner.notifications.emit(ServerEvent::ToolListChanged);
    }

    /// Notify every eligible session that the prompt list changed.
    pub fn send_prompt_list_changed(&self) {
        self.inner.notifications.emit(ServerEvent::PromptListChanged);
    }

    // -- transports ----------------------------------------------------------

    /// Mount this server behind a Streamable HTTP endpoint: the returned
    /// service creates a session for every transport it opens.
    pub fn streamable_http_service(&self, config: StreamableHttpConfig) -> StreamableHttpService {
        let server = self.clone();
        let service = StreamableHttpService::new(config, move |transport| {
            let server = server.clone();
            async move {
                server.create_session(Arc::new(transport));
            }
        });
        let server = self.clone();
        service.on_session_closed(move |session_id| {
            if let Some(session) = server.session(session_id) {
                session.spawn_cleanup();
            }
        });
        service
    }

    /// Close every session and shut down the notification broker.
    pub async fn close(&self) {
        let sessions = self.sessions();
        for session in sessions {
            if let Err(err) = session.close().await {
                tracing::debug!(error = %err, "session close failed");
            }
        }
        self.inner.notifications.close().await;
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    name: String,
    version: String,
    title: Option<String>,
    capabilities: ServerCapabilities,
    instructions: Option<InstructionsProvider>,
    enforce_strict_capabilities: bool,
    request_timeout: Duration,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// Create a builder with defaults.
    pub fn new() -> Self {
        let defaults = ProtocolOptions::default();
        Self {
            name: "polymcp-server".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            capabilities: ServerCapabilities::default(),
            instructions: None,
            enforce_strict_capabilities: defaults.enforce_strict_capabilities,
            request_timeout: defaults.request_timeout,
        }
    }

    /// Server name reported at `initialize`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Server version reported at `initialize`.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Human-readable title.
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Capabilities to declare.
    pub fn capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Fixed instructions included in every `InitializeResult`.
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        let instructions = instructions.into();
        self.instructions = Some(Arc::new(move || instructions.clone()));
        self
    }

    /// Instructions computed per session at create time.
    pub fn instructions_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.instructions = Some(Arc::new(provider));
        self
    }

    /// Toggle strict capability gating (on by default).
    pub fn enforce_strict_capabilities(mut self, enforce: bool) -> Self {
        self.enforce_strict_capabilities = enforce;
        self
    }

    /// Default timeout for server→client requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build the server and wire registry events into the notification
    /// broker.
    pub fn build(self) -> Server {
        let notifications = NotificationService::new();

        let tools = Arc::new(FeatureRegistry::new());
        tools.add_listener(Arc::new(ToolEventsBridge(notifications.clone())));
        let prompts = Arc::new(FeatureRegistry::new());
        prompts.add_listener(Arc::new(PromptEventsBridge(notifications.clone())));
        let resources = Arc::new(FeatureRegistry::new());
        resources.add_listener(Arc::new(ResourceEventsBridge(notifications.clone())));
        let resource_templates = Arc::new(FeatureRegistry::new());
        resource_templates.add_listener(Arc::new(ResourceTemplateEventsBridge(
            notifications.clone(),
        )));

        Server {
            inner: Arc::new(ServerInner {
                server_info: Implementation {
                    name: self.name,
                    version: self.version,
                    title: self.title,
                },
                capabilities: self.capabilities,
                instructions: self.instructions,
                options: ProtocolOptions {
                    enforce_strict_capabilities: self.enforce_strict_capabilities,
                    request_timeout: self.request_timeout,
                },
                tools,
                prompts,
                resources,
                resource_templates,
                sessions: DashMap::new(),
                notifications,
                connect_hooks: SyncRwLock::new(Vec::new()),
                closed_hooks: SyncRwLock::new(Vec::new()),
            }),
        }
    }
}
