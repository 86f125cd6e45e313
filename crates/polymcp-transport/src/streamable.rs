//! MCP Streamable HTTP transport.
//!
//! One endpoint handles the whole protocol surface:
//!
//! - `POST` carries client→server messages and answers with `202` (no
//!   requests in the batch), a buffered JSON body, or an SSE stream that
//!   closes once every request in the batch has a terminal response.
//! - `GET` opens the session's standalone SSE stream (at most one), with
//!   resumption via `Last-Event-ID` when an [`EventStore`] is configured.
//! - `DELETE` ends the session.
//!
//! In stateful mode the service mints an `Mcp-Session-Id` on `initialize`
//! and validates it on every later request; stateless mode creates a
//! throwaway transport per request and skips the state machine.
//!
//! Outbound routing: responses follow the `request id → stream` map,
//! request-scoped notifications follow `related_request_id`, everything else
//! goes to the standalone stream or is dropped. Responses are never written
//! to the standalone stream.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use polymcp_protocol::{
    version::is_supported_protocol_version, JsonRpcMessage, RequestId,
    DEFAULT_NEGOTIATED_PROTOCOL_VERSION,
};

use crate::error::{TransportError, TransportResult};
use crate::event_store::EventStore;
use crate::traits::{Transport, TransportMessage};

/// `Mcp-Session-Id` header name.
pub const HEADER_SESSION_ID: &str = "mcp-session-id";
/// `Mcp-Protocol-Version` header name.
pub const HEADER_PROTOCOL_VERSION: &str = "mcp-protocol-version";
/// `Last-Event-ID` header name.
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";

const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
const STREAM_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the Streamable HTTP service.
#[derive(Clone)]
pub struct StreamableHttpConfig {
    /// MCP endpoint path (default `/mcp`)
    pub endpoint_path: String,
    /// Maintain per-session state and `Mcp-Session-Id` validation
    pub stateful: bool,
    /// Answer POST batches with a buffered JSON body instead of SSE
    pub json_response: bool,
    /// Request body cap in bytes (default 4 MiB)
    pub max_body_bytes: usize,
    /// SSE keep-alive comment interval
    pub keep_alive: Duration,
    /// Validate `Host`/`Origin` headers against the allowlists
    pub dns_rebinding_protection: bool,
    /// Hosts accepted when rebinding protection is on
    pub allowed_hosts: Vec<String>,
    /// Origins accepted when rebinding protection is on
    pub allowed_origins: Vec<String>,
    /// Store enabling SSE resumption via `Last-Event-ID`
    pub event_store: Option<Arc<dyn EventStore>>,
}

impl Default for StreamableHttpConfig {
    fn default() -> Self {
        StreamableHttpConfigBuilder::new().build()
    }
}

impl fmt::Debug for StreamableHttpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpConfig")
            .field("endpoint_path", &self.endpoint_path)
            .field("stateful", &self.stateful)
            .field("json_response", &self.json_response)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("dns_rebinding_protection", &self.dns_rebinding_protection)
            .field("event_store", &self.event_store.is_some())
            .finish()
    }
}

/// Builder for [`StreamableHttpConfig`].
#[derive(Default)]
pub struct StreamableHttpConfigBuilder {
    endpoint_path: Option<String>,
    stateless: bool,
    json_response: bool,
    max_body_bytes: Option<usize>,
    keep_alive: Option<Duration>,
    dns_rebinding_protection: bool,
    allowed_hosts: Vec<String>,
    allowed_origins: Vec<String>,
    event_store: Option<Arc<dyn EventStore>>,
}

impl StreamableHttpConfigBuilder {
    /// Create a builder with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint path (default `/mcp`).
    pub fn with_endpoint_path(mut self, path: impl Into<String>) -> Self {
        self.endpoint_path = Some(path.into());
        self
    }

    /// Run without session state: a fresh transport per request, no
    /// `Mcp-Session-Id` minted or validated.
    pub fn stateless(mut self) -> Self {
        self.stateless = true;
        self
    }

    /// Answer POST batches with one JSON body instead of an SSE stream.
    pub fn with_json_response(mut self, json: bool) -> Self {
        self.json_response = json;
        self
    }

    /// Set the request body cap (default 4 MiB).
    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = Some(bytes);
        self
    }

    /// Set the SSE keep-alive interval (default 30 seconds).
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = Some(interval);
        self
    }

    /// Enable `Host`/`Origin` validation against the allowlists.
    pub fn with_dns_rebinding_protection(mut self, enabled: bool) -> Self {
        self.dns_rebinding_protection = enabled;
        self
    }

    /// Accept a host when rebinding protection is on.
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.push(host.into());
        self
    }

    /// Accept an origin when rebinding protection is on.
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Configure an event store, enabling `Last-Event-ID` resumption.
    pub fn with_event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> StreamableHttpConfig {
        StreamableHttpConfig {
            endpoint_path: self.endpoint_path.unwrap_or_else(|| "/mcp".to_string()),
            stateful: !self.stateless,
            json_response: self.json_response,
            max_body_bytes: self.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            keep_alive: self.keep_alive.unwrap_or(Duration::from_secs(30)),
            dns_rebinding_protection: self.dns_rebinding_protection,
            allowed_hosts: self.allowed_hosts,
            allowed_origins: self.allowed_origins,
            event_store: self.event_store,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-session transport
// ---------------------------------------------------------------------------

/// An SSE frame queued on a stream: the message plus its stored event id,
/// rendered into the response body by the HTTP handlers.
#[derive(Debug, Clone)]
pub struct SseStreamItem {
    /// Event id to put on the SSE frame, when a store is configured.
    pub event_id: Option<String>,
    /// The JSON-RPC message carried as `data`.
    pub message: JsonRpcMessage,
}

struct SseStreamState {
    tx: mpsc::Sender<SseStreamItem>,
    /// Request ids still awaiting a terminal response on this stream.
    pending: HashSet<RequestId>,
    /// Close the stream once `pending` drains. False for the standalone
    /// stream and for resumed streams, which live until the session ends.
    close_on_complete: bool,
}

struct JsonBatchState {
    order: Vec<RequestId>,
    collected: HashMap<RequestId, JsonRpcMessage>,
    reply: Option<oneshot::Sender<Vec<JsonRpcMessage>>>,
}

enum StreamEntry {
    Sse(SseStreamState),
    Json(JsonBatchState),
}

/// `streams` and `request_to_stream` share one mutex: batch-completion
/// bookkeeping must observe both maps atomically.
#[derive(Default)]
struct StreamTable {
    streams: HashMap<String, StreamEntry>,
    request_to_stream: HashMap<RequestId, String>,
}

struct HttpTransportInner {
    session_id: Option<String>,
    standalone_stream_id: String,
    protocol_version: SyncMutex<Option<String>>,
    incoming_tx: SyncMutex<Option<mpsc::UnboundedSender<JsonRpcMessage>>>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<JsonRpcMessage>>,
    table: SyncMutex<StreamTable>,
    event_store: Option<Arc<dyn EventStore>>,
    closed: AtomicBool,
}

/// Server end of one Streamable HTTP session.
///
/// The HTTP service feeds POST bodies into it and drains its streams into
/// SSE responses; the protocol engine sees only the [`Transport`] trait.
#[derive(Clone)]
pub struct StreamableHttpServerTransport {
    inner: Arc<HttpTransportInner>,
}

impl fmt::Debug for StreamableHttpServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpServerTransport")
            .field("session_id", &self.inner.session_id)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl StreamableHttpServerTransport {
    /// Create a transport, optionally bound to a session id.
    pub fn new(session_id: Option<String>, event_store: Option<Arc<dyn EventStore>>) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(HttpTransportInner {
                session_id,
                standalone_stream_id: Uuid::new_v4().to_string(),
                protocol_version: SyncMutex::new(None),
                incoming_tx: SyncMutex::new(Some(incoming_tx)),
                incoming_rx: Mutex::new(incoming_rx),
                table: SyncMutex::new(StreamTable::default()),
                event_store,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The negotiated protocol version echoed on responses.
    pub fn protocol_version(&self) -> Option<String> {
        self.inner.protocol_version.lock().clone()
    }

    /// Record the protocol version seen on a request.
    pub fn set_protocol_version(&self, version: Option<String>) {
        *self.inner.protocol_version.lock() = version;
    }

    /// Inject a message received over HTTP into the engine's read loop.
    pub fn push_incoming(&self, message: JsonRpcMessage) -> TransportResult<()> {
        let guard = self.inner.incoming_tx.lock();
        let sender = guard.as_ref().ok_or(TransportError::Closed)?;
        sender
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    /// Register a JSON-mode batch: the returned receiver fires with the
    /// responses in request order once every id has a terminal response.
    pub fn open_json_batch(
        &self,
        stream_id: &str,
        request_ids: Vec<RequestId>,
    ) -> oneshot::Receiver<Vec<JsonRpcMessage>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut table = self.inner.table.lock();
        for id in &request_ids {
            table
                .request_to_stream
                .insert(id.clone(), stream_id.to_string());
        }
        table.streams.insert(
            stream_id.to_string(),
            StreamEntry::Json(JsonBatchState {
                order: request_ids,
                collected: HashMap::new(),
                reply: Some(reply_tx),
            }),
        );
        reply_rx
    }

    /// Register an SSE-mode batch stream that closes once every request id
    /// has a terminal response.
    pub fn open_request_stream(
        &self,
        stream_id: &str,
        request_ids: Vec<RequestId>,
    ) -> mpsc::Receiver<SseStreamItem> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut table = self.inner.table.lock();
        for id in &request_ids {
            table
                .request_to_stream
                .insert(id.clone(), stream_id.to_string());
        }
        table.streams.insert(
            stream_id.to_string(),
            StreamEntry::Sse(SseStreamState {
                tx,
                pending: request_ids.into_iter().collect(),
                close_on_complete: true,
            }),
        );
        rx
    }

    /// Attach (or re-attach) a long-lived stream: the standalone GET stream
    /// or a stream being resumed via `Last-Event-ID`. Fails when the stream
    /// already has a live connection.
    pub fn attach_stream(
        &self,
        stream_id: &str,
    ) -> TransportResult<mpsc::Receiver<SseStreamItem>> {
        let mut table = self.inner.table.lock();
        if let Some(StreamEntry::Sse(existing)) = table.streams.get(stream_id) {
            if !existing.tx.is_closed() {
                return Err(TransportError::SendFailed(format!(
                    "stream {stream_id} already has an active connection"
                )));
            }
        }
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        // A dead predecessor may still track pending request ids; carry
        // them over so their responses reach the resumed connection.
        let pending = match table.streams.remove(stream_id) {
            Some(StreamEntry::Sse(old)) => old.pending,
            _ => HashSet::new(),
        };
        table.streams.insert(
            stream_id.to_string(),
            StreamEntry::Sse(SseStreamState {
                tx,
                pending,
                close_on_complete: false,
            }),
        );
        Ok(rx)
    }

    /// Attach the session's standalone SSE stream.
    pub fn attach_standalone_stream(
        &self,
    ) -> TransportResult<mpsc::Receiver<SseStreamItem>> {
        let stream_id = self.inner.standalone_stream_id.clone();
        self.attach_stream(&stream_id)
    }

    /// The id under which standalone pushes are stored and resumed.
    pub fn standalone_stream_id(&self) -> &str {
        &self.inner.standalone_stream_id
    }

    async fn store_frame(
        &self,
        stream_id: &str,
        message: &JsonRpcMessage,
    ) -> Option<String> {
        let store = self.inner.event_store.as_ref()?;
        match store.store_event(stream_id, message).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::error!(error = %err, stream_id, "failed to store SSE event");
                None
            }
        }
    }

    async fn route_terminal(
        &self,
        id: &RequestId,
        message: JsonRpcMessage,
    ) -> TransportResult<()> {
        enum Target {
            Sse(mpsc::Sender<SseStreamItem>),
            Json,
        }

        let (stream_id, target) = {
            let mut table = self.inner.table.lock();
            let Some(stream_id) = table.request_to_stream.get(id).cloned() else {
                tracing::debug!(request_id = %id, "dropping response with no stream mapping");
                return Ok(());
            };
            match table.streams.get(&stream_id) {
                Some(StreamEntry::Sse(state)) => (stream_id, Target::Sse(state.tx.clone())),
                Some(StreamEntry::Json(_)) => (stream_id, Target::Json),
                None => {
                    table.request_to_stream.remove(id);
                    tracing::debug!(request_id = %id, "response stream already gone");
                    return Ok(());
                }
            }
        };

        match target {
            Target::Sse(tx) => {
                let event_id = self.store_frame(&stream_id, &message).await;
                if tx.send(SseStreamItem { event_id, message }).await.is_err() {
                    tracing::debug!(stream_id, "SSE client disconnected before response");
                }
                let mut table = self.inner.table.lock();
                table.request_to_stream.remove(id);
                if let Some(StreamEntry::Sse(state)) = table.streams.get_mut(&stream_id) {
                    state.pending.remove(id);
                    if state.close_on_complete && state.pending.is_empty() {
                        table.streams.remove(&stream_id);
                    }
                }
            }
            Target::Json => {
                let mut table = self.inner.table.lock();
                table.request_to_stream.remove(id);
                if let Some(StreamEntry::Json(batch)) = table.streams.get_mut(&stream_id) {
                    batch.collected.insert(id.clone(), message);
                    if batch.collected.len() == batch.order.len() {
                        let responses = batch
                            .order
                            .iter()
                            .filter_map(|rid| batch.collected.remove(rid))
                            .collect();
                        if let Some(reply) = batch.reply.take() {
                            let _ = reply.send(responses);
                        }
                        table.streams.remove(&stream_id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn route_related(
        &self,
        related: &RequestId,
        message: JsonRpcMessage,
    ) -> TransportResult<()> {
        let (stream_id, tx) = {
            let table = self.inner.table.lock();
            let Some(stream_id) = table.request_to_stream.get(related).cloned() else {
                tracing::debug!(related_request_id = %related, "dropping message for unknown request stream");
                return Ok(());
            };
            match table.streams.get(&stream_id) {
                Some(StreamEntry::Sse(state)) => (stream_id, state.tx.clone()),
                Some(StreamEntry::Json(_)) => {
                    tracing::debug!(
                        related_request_id = %related,
                        "JSON-mode batch cannot carry request-scoped messages; dropping"
                    );
                    return Ok(());
                }
                None => return Ok(()),
            }
        };
        let event_id = self.store_frame(&stream_id, &message).await;
        if tx.send(SseStreamItem { event_id, message }).await.is_err() {
            tracing::debug!(stream_id, "SSE client disconnected; related message lost");
        }
        Ok(())
    }

    async fn route_standalone(&self, message: JsonRpcMessage) -> TransportResult<()> {
        if message.is_terminal() {
            tracing::warn!("responses are forbidden on the standalone stream; dropping");
            return Ok(());
        }
        let stream_id = self.inner.standalone_stream_id.clone();
        let tx = {
            let table = self.inner.table.lock();
            match table.streams.get(&stream_id) {
                Some(StreamEntry::Sse(state)) if !state.tx.is_closed() => state.tx.clone(),
                _ => {
                    tracing::debug!(
                        method = message.method().unwrap_or("?"),
                        "no standalone stream attached; dropping message"
                    );
                    return Ok(());
                }
            }
        };
        let event_id = self.store_frame(&stream_id, &message).await;
        if tx.send(SseStreamItem { event_id, message }).await.is_err() {
            tracing::debug!("standalone stream client disconnected");
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for StreamableHttpServerTransport {
    async fn send(&self, message: TransportMessage) -> TransportResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let TransportMessage {
            message,
            related_request_id,
        } = message;

        match &message {
            JsonRpcMessage::Response(response) => {
                let id = response.id.clone();
                self.route_terminal(&id, message).await
            }
            JsonRpcMessage::Error(error) if error.id.is_some() => {
                let id = error.id.clone().unwrap_or(RequestId::Number(0));
                self.route_terminal(&id, message).await
            }
            _ => match related_request_id {
                Some(related) => self.route_related(&related, message).await,
                None => self.route_standalone(message).await,
            },
        }
    }

    async fn receive(&self) -> TransportResult<Option<JsonRpcMessage>> {
        let mut incoming = self.inner.incoming_rx.lock().await;
        Ok(incoming.recv().await)
    }

    async fn close(&self) -> TransportResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Dropping the only incoming sender lets a pending receive drain
        // buffered messages and then observe end-of-stream.
        self.inner.incoming_tx.lock().take();
        let mut table = self.inner.table.lock();
        // Dropping the senders ends every live SSE response body; pending
        // JSON batches resolve as errors on the handler side.
        table.streams.clear();
        table.request_to_stream.clear();
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.inner.session_id.clone()
    }
}

// ---------------------------------------------------------------------------
// HTTP service
// ---------------------------------------------------------------------------

type SessionHook =
    dyn Fn(StreamableHttpServerTransport) -> BoxFuture<'static, ()> + Send + Sync;
type SessionClosedHook = dyn Fn(&str) + Send + Sync;

struct ServiceState {
    config: StreamableHttpConfig,
    transports: DashMap<String, StreamableHttpServerTransport>,
    on_session_started: Box<SessionHook>,
    on_session_closed: SyncMutex<Option<Arc<SessionClosedHook>>>,
}

/// The Streamable HTTP endpoint, mountable as an axum [`Router`].
///
/// The service owns transport lifecycles; the embedding server supplies a
/// hook that binds each new transport to a protocol session.
#[derive(Clone)]
pub struct StreamableHttpService {
    state: Arc<ServiceState>,
}

impl fmt::Debug for StreamableHttpService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpService")
            .field("config", &self.state.config)
            .field("sessions", &self.state.transports.len())
            .finish()
    }
}

impl StreamableHttpService {
    /// Create a service. `on_session_started` runs for every new transport
    /// (per session when stateful, per request when stateless) and must wire
    /// it to a protocol engine before returning.
    pub fn new<F, Fut>(config: StreamableHttpConfig, on_session_started: F) -> Self
    where
        F: Fn(StreamableHttpServerTransport) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            state: Arc::new(ServiceState {
                config,
                transports: DashMap::new(),
                on_session_started: Box::new(move |transport| {
                    Box::pin(on_session_started(transport))
                }),
                on_session_closed: SyncMutex::new(None),
            }),
        }
    }

    /// Install a hook invoked with the session id after `DELETE` closes it.
    pub fn on_session_closed<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.state.on_session_closed.lock() = Some(Arc::new(hook));
    }

    /// The transport bound to a session id, when it exists.
    pub fn transport(&self, session_id: &str) -> Option<StreamableHttpServerTransport> {
        self.state
            .transports
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    /// Number of live stateful sessions.
    pub fn session_count(&self) -> usize {
        self.state.transports.len()
    }

    /// Build the axum router serving the configured endpoint path.
    pub fn router(&self) -> Router {
        Router::new()
            .route(
                &self.state.config.endpoint_path,
                post(handle_post).get(handle_get).delete(handle_delete),
            )
            .with_state(self.state.clone())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn rpc_error_response(status: StatusCode, code: i32, message: &str) -> Response {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {"code": code, "message": message},
    });
    (status, axum::Json(body)).into_response()
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn accept_includes(headers: &HeaderMap, mime: &str) -> bool {
    header_str(headers, header::ACCEPT.as_str())
        .map(|accept| {
            accept
                .split(',')
                .any(|part| {
                    let media = part.split(';').next().unwrap_or("").trim();
                    media == mime || media == "*/*"
                })
        })
        .unwrap_or(false)
}

fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let bare = host.rsplit_once(':').map_or(host, |(h, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            h
        } else {
            host
        }
    });
    allowed
        .iter()
        .any(|a| a.eq_ignore_ascii_case(host) || a.eq_ignore_ascii_case(bare))
}

fn validate_rebinding(config: &StreamableHttpConfig, headers: &HeaderMap) -> Result<(), Response> {
    if !config.dns_rebinding_protection {
        return Ok(());
    }
    if let Some(host) = header_str(headers, header::HOST.as_str()) {
        if !host_allowed(host, &config.allowed_hosts) {
            return Err(rpc_error_response(
                StatusCode::FORBIDDEN,
                -32000,
                &format!("Forbidden: host not allowed: {host}"),
            ));
        }
    }
    if let Some(origin) = header_str(headers, header::ORIGIN.as_str()) {
        let by_origin = config
            .allowed_origins
            .iter()
            .any(|a| a.eq_ignore_ascii_case(origin));
        let by_host = url::Url::parse(origin)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .is_some_and(|h| host_allowed(&h, &config.allowed_hosts));
        if !by_origin && !by_host {
            return Err(rpc_error_response(
                StatusCode::FORBIDDEN,
                -32000,
                &format!("Forbidden: origin not allowed: {origin}"),
            ));
        }
    }
    Ok(())
}

fn validate_protocol_version(headers: &HeaderMap) -> Result<Option<String>, Response> {
    match header_str(headers, HEADER_PROTOCOL_VERSION) {
        None => Ok(None),
        Some(version) if is_supported_protocol_version(version) => Ok(Some(version.to_string())),
        Some(version) => Err(rpc_error_response(
            StatusCode::BAD_REQUEST,
            -32000,
            &format!("Bad Request: unsupported protocol version: {version}"),
        )),
    }
}

fn parse_messages(body: &Bytes) -> Result<Vec<JsonRpcMessage>, Response> {
    let value: serde_json::Value = serde_json::from_slice(body.as_ref()).map_err(|err| {
        rpc_error_response(
            StatusCode::BAD_REQUEST,
            -32700,
            &format!("Parse error: {err}"),
        )
    })?;

    let raw = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    if raw.is_empty() {
        return Err(rpc_error_response(
            StatusCode::BAD_REQUEST,
            -32600,
            "Invalid Request: empty batch",
        ));
    }

    raw.into_iter()
        .map(|item| {
            serde_json::from_value::<JsonRpcMessage>(item).map_err(|err| {
                rpc_error_response(
                    StatusCode::BAD_REQUEST,
                    -32700,
                    &format!("Parse error: {err}"),
                )
            })
        })
        .collect()
}

fn response_headers(transport: &StreamableHttpServerTransport) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(session_id) = transport.session_id() {
        if let Ok(value) = HeaderValue::from_str(&session_id) {
            headers.insert(HEADER_SESSION_ID, value);
        }
    }
    let version = transport
        .protocol_version()
        .unwrap_or_else(|| DEFAULT_NEGOTIATED_PROTOCOL_VERSION.to_string());
    if let Ok(value) = HeaderValue::from_str(&version) {
        headers.insert(HEADER_PROTOCOL_VERSION, value);
    }
    headers
}

fn sse_event(item: SseStreamItem) -> Option<Event> {
    let data = match serde_json::to_string(&item.message) {
        Ok(data) => data,
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize SSE frame");
            return None;
        }
    };
    let mut event = Event::default().event("message").data(data);
    if let Some(id) = item.event_id {
        event = event.id(id);
    }
    Some(event)
}

/// Resolve the transport a POST applies to, creating one for `initialize`.
async fn resolve_post_transport(
    state: &Arc<ServiceState>,
    headers: &HeaderMap,
    has_initialize: bool,
) -> Result<(StreamableHttpServerTransport, bool), Response> {
    if !state.config.stateful {
        let transport =
            StreamableHttpServerTransport::new(None, state.config.event_store.clone());
        (state.on_session_started)(transport.clone()).await;
        return Ok((transport, true));
    }

    match header_str(headers, HEADER_SESSION_ID) {
        Some(session_id) => match state.transports.get(session_id) {
            Some(entry) => Ok((entry.value().clone(), false)),
            None => Err(rpc_error_response(
                StatusCode::NOT_FOUND,
                -32000,
                "Session not found",
            )),
        },
        None if has_initialize => {
            let session_id = Uuid::new_v4().to_string();
            let transport = StreamableHttpServerTransport::new(
                Some(session_id.clone()),
                state.config.event_store.clone(),
            );
            state
                .transports
                .insert(session_id.clone(), transport.clone());
            (state.on_session_started)(transport.clone()).await;
            tracing::debug!(session_id, "streamable HTTP session created");
            Ok((transport, false))
        }
        None => Err(rpc_error_response(
            StatusCode::BAD_REQUEST,
            -32000,
            "Bad Request: Server not initialized",
        )),
    }
}

async fn handle_post(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
) -> Response {
    if let Err(response) = validate_rebinding(&state.config, &headers) {
        return response;
    }
    if !accept_includes(&headers, "application/json")
        || !accept_includes(&headers, "text/event-stream")
    {
        return rpc_error_response(
            StatusCode::NOT_ACCEPTABLE,
            -32000,
            "Not Acceptable: client must accept both application/json and text/event-stream",
        );
    }
    let content_type_ok = header_str(&headers, header::CONTENT_TYPE.as_str())
        .map(|ct| ct.split(';').next().unwrap_or("").trim() == "application/json")
        .unwrap_or(false);
    if !content_type_ok {
        return rpc_error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            -32000,
            "Unsupported Media Type: Content-Type must be application/json",
        );
    }
    let body = match axum::body::to_bytes(request.into_body(), state.config.max_body_bytes).await
    {
        Ok(body) => body,
        Err(_) => {
            return rpc_error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                -32000,
                "Payload Too Large: request body exceeds limit",
            );
        }
    };
    let messages = match parse_messages(&body) {
        Ok(messages) => messages,
        Err(response) => return response,
    };
    let protocol_version = match validate_protocol_version(&headers) {
        Ok(version) => version,
        Err(response) => return response,
    };

    let has_initialize = messages
        .iter()
        .any(|m| matches!(m, JsonRpcMessage::Request(r) if r.method == "initialize"));
    if has_initialize && messages.len() > 1 {
        return rpc_error_response(
            StatusCode::BAD_REQUEST,
            -32600,
            "Invalid Request: initialize must not be batched with other messages",
        );
    }

    let (transport, ephemeral) =
        match resolve_post_transport(&state, &headers, has_initialize).await {
            Ok(resolved) => resolved,
            Err(response) => return response,
        };
    if protocol_version.is_some() {
        transport.set_protocol_version(protocol_version);
    }

    let request_ids: Vec<RequestId> = messages
        .iter()
        .filter_map(|m| match m {
            JsonRpcMessage::Request(r) => Some(r.id.clone()),
            _ => None,
        })
        .collect();

    // Notification/response-only batches are acknowledged immediately.
    if request_ids.is_empty() {
        for message in messages {
            if let Err(err) = transport.push_incoming(message) {
                tracing::warn!(error = %err, "failed to deliver message to session");
            }
        }
        if ephemeral {
            let _ = transport.close().await;
        }
        return (StatusCode::ACCEPTED, response_headers(&transport)).into_response();
    }

    let stream_id = Uuid::new_v4().to_string();

    if state.config.json_response {
        let reply = transport.open_json_batch(&stream_id, request_ids.clone());
        for message in messages {
            if let Err(err) = transport.push_incoming(message) {
                tracing::warn!(error = %err, "failed to deliver message to session");
            }
        }
        let responses = match reply.await {
            Ok(responses) => responses,
            Err(_) => {
                return rpc_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    -32000,
                    "Internal error: session terminated before responding",
                );
            }
        };
        let body = if responses.len() == 1 {
            serde_json::to_value(&responses[0])
        } else {
            serde_json::to_value(&responses)
        };
        let result = match body {
            Ok(value) => {
                (StatusCode::OK, response_headers(&transport), axum::Json(value)).into_response()
            }
            Err(err) => rpc_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                -32603,
                &format!("Internal error: {err}"),
            ),
        };
        if ephemeral {
            let _ = transport.close().await;
        }
        return result;
    }

    // SSE mode: the response stream stays open until every request in the
    // batch has a terminal response.
    let mut rx = transport.open_request_stream(&stream_id, request_ids);
    for message in messages {
        if let Err(err) = transport.push_incoming(message) {
            tracing::warn!(error = %err, "failed to deliver message to session");
        }
    }

    let priming_id = match state.config.event_store.as_ref() {
        Some(store) => store.prime_stream(&stream_id).await.ok(),
        None => None,
    };
    let cleanup = ephemeral.then(|| transport.clone());
    let stream = async_stream::stream! {
        let mut priming = Event::default().event("message").data("");
        if let Some(id) = priming_id {
            priming = priming.id(id);
        }
        yield Ok::<_, std::convert::Infallible>(priming);
        while let Some(frame) = rx.recv().await {
            if let Some(event) = sse_event(frame) {
                yield Ok(event);
            }
        }
        if let Some(transport) = cleanup {
            let _ = transport.close().await;
        }
    };

    let mut headers = response_headers(&transport);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    (
        headers,
        Sse::new(stream).keep_alive(KeepAlive::new().interval(state.config.keep_alive)),
    )
        .into_response()
}

async fn handle_get(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = validate_rebinding(&state.config, &headers) {
        return response;
    }
    if state.config.json_response {
        return rpc_error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            -32000,
            "Method Not Allowed: this server does not offer an SSE stream",
        );
    }
    if !accept_includes(&headers, "text/event-stream") {
        return rpc_error_response(
            StatusCode::NOT_ACCEPTABLE,
            -32000,
            "Not Acceptable: client must accept text/event-stream",
        );
    }
    if !state.config.stateful {
        return rpc_error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            -32000,
            "Method Not Allowed: standalone streams require stateful mode",
        );
    }
    let Some(session_id) = header_str(&headers, HEADER_SESSION_ID) else {
        return rpc_error_response(
            StatusCode::BAD_REQUEST,
            -32000,
            "Bad Request: Mcp-Session-Id header required",
        );
    };
    let Some(transport) = state.transports.get(session_id).map(|e| e.value().clone()) else {
        return rpc_error_response(StatusCode::NOT_FOUND, -32000, "Session not found");
    };

    // Resumption: replay everything after the client's last seen event on
    // that event's stream, then leave the stream attached for live pushes.
    let mut replayed: Vec<SseStreamItem> = Vec::new();
    let rx = match (
        header_str(&headers, HEADER_LAST_EVENT_ID),
        state.config.event_store.as_ref(),
    ) {
        (Some(last_event_id), Some(store)) => {
            let stream_id = match store.stream_for_event(last_event_id).await {
                Ok(Some(stream_id)) => stream_id,
                Ok(None) | Err(_) => {
                    return rpc_error_response(
                        StatusCode::BAD_REQUEST,
                        -32000,
                        &format!("Bad Request: unknown event id: {last_event_id}"),
                    );
                }
            };
            let events = match store.replay_after(last_event_id).await {
                Ok(events) => events,
                Err(err) => {
                    return rpc_error_response(
                        StatusCode::BAD_REQUEST,
                        -32000,
                        &format!("Bad Request: {err}"),
                    );
                }
            };
            replayed = events
                .into_iter()
                .map(|(event_id, message)| SseStreamItem {
                    event_id: Some(event_id),
                    message,
                })
                .collect();
            match transport.attach_stream(&stream_id) {
                Ok(rx) => rx,
                Err(_) => {
                    return rpc_error_response(
                        StatusCode::CONFLICT,
                        -32000,
                        "Conflict: stream already has an active connection",
                    );
                }
            }
        }
        _ => match transport.attach_standalone_stream() {
            Ok(rx) => rx,
            Err(_) => {
                return rpc_error_response(
                    StatusCode::CONFLICT,
                    -32000,
                    "Conflict: session already has a standalone SSE stream",
                );
            }
        },
    };

    let mut rx = rx;
    let stream = async_stream::stream! {
        for item in replayed {
            if let Some(event) = sse_event(item) {
                yield Ok::<_, std::convert::Infallible>(event);
            }
        }
        while let Some(frame) = rx.recv().await {
            if let Some(event) = sse_event(frame) {
                yield Ok(event);
            }
        }
    };

    let mut response_headers = response_headers(&transport);
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    (
        response_headers,
        Sse::new(stream).keep_alive(KeepAlive::new().interval(state.config.keep_alive)),
    )
        .into_response()
}

async fn handle_delete(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = validate_rebinding(&state.config, &headers) {
        return response;
    }
    if !state.config.stateful {
        return rpc_error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            -32000,
            "Method Not Allowed: stateless mode has no sessions",
        );
    }
    let Some(session_id) = header_str(&headers, HEADER_SESSION_ID) else {
        return rpc_error_response(
            StatusCode::BAD_REQUEST,
            -32000,
            "Bad Request: Mcp-Session-Id header required",
        );
    };
    let Some((session_id, transport)) = state.transports.remove(session_id) else {
        return rpc_error_response(StatusCode::NOT_FOUND, -32000, "Session not found");
    };

    if let Err(err) = transport.close().await {
        tracing::warn!(error = %err, session_id, "error closing session transport");
    }
    let hook = state.on_session_closed.lock().clone();
    if let Some(hook) = hook {
        hook(&session_id);
    }
    tracing::debug!(session_id, "streamable HTTP session deleted");
    StatusCode::OK.into_response()
}
