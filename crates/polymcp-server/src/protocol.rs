//! The per-connection protocol engine.
//!
//! A [`ProtocolEngine`] binds to one [`Transport`] and drives the JSON-RPC
//! state machine over it: outbound requests get a fresh id and a pending
//! slot completed by exactly one of response, error, timeout, or connection
//! close; inbound requests dispatch to at most one registered handler per
//! method; inbound cancellations cancel the matching in-flight handler
//! through its [`RequestContext`] token.
//!
//! The engine knows nothing about MCP semantics or capabilities; the session
//! layer installs handlers and gates methods.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use polymcp_protocol::{
    types::CancelledParams, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, McpError, McpResult, Method, RequestId,
};
use polymcp_transport::{Transport, TransportError, TransportMessage};

/// Engine-wide defaults and switches.
#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    /// Refuse methods whose capability the peer never declared.
    pub enforce_strict_capabilities: bool,
    /// Deadline applied to requests that do not set their own.
    pub request_timeout: Duration,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            enforce_strict_capabilities: true,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-request options for [`ProtocolEngine::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the engine-wide timeout.
    pub timeout: Option<Duration>,
    /// Inbound request this outbound call is made on behalf of; stream
    /// transports route the frame accordingly.
    pub related_request_id: Option<RequestId>,
}

impl RequestOptions {
    /// Options with an explicit timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            related_request_id: None,
        }
    }

    /// Options tying the call to an inbound request.
    pub fn related_to(request_id: RequestId) -> Self {
        Self {
            timeout: None,
            related_request_id: Some(request_id),
        }
    }
}

/// Context handed to request handlers.
///
/// Cancellation is cooperative: when the peer cancels the request (or the
/// engine shuts down) the token trips, and the handler is expected to notice
/// at its next suspension point. A handler that runs to completion after
/// cancellation has its response dropped rather than sent.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Id of the inbound request, when dispatching one.
    pub request_id: Option<RequestId>,
    /// Trips when the request is cancelled.
    pub cancellation: CancellationToken,
}

impl RequestContext {
    /// A context not tied to any inbound request.
    pub fn detached() -> Self {
        Self {
            request_id: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// True once the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Handler for one inbound request method.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce the result value for the request.
    async fn handle(&self, params: Option<Value>, ctx: RequestContext) -> McpResult<Value>;
}

/// Handler for one inbound notification method.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Consume the notification.
    async fn handle(&self, params: Option<Value>);
}

struct FnRequestHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = McpResult<Value>> + Send,
{
    async fn handle(&self, params: Option<Value>, ctx: RequestContext) -> McpResult<Value> {
        (self.0)(params, ctx).await
    }
}

/// Wrap an async closure as a [`RequestHandler`].
pub fn request_handler<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = McpResult<Value>> + Send + 'static,
{
    Arc::new(FnRequestHandler(f))
}

struct FnNotificationHandler<F>(F);

#[async_trait]
impl<F, Fut> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn handle(&self, params: Option<Value>) {
        (self.0)(params).await;
    }
}

/// Wrap an async closure as a [`NotificationHandler`].
pub fn notification_handler<F, Fut>(f: F) -> Arc<dyn NotificationHandler>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(FnNotificationHandler(f))
}

struct EngineInner {
    options: ProtocolOptions,
    transport: SyncMutex<Option<Arc<dyn Transport>>>,
    pending: DashMap<RequestId, oneshot::Sender<McpResult<Value>>>,
    inbound: DashMap<RequestId, CancellationToken>,
    request_handlers: DashMap<String, Arc<dyn RequestHandler>>,
    notification_handlers: DashMap<String, Arc<dyn NotificationHandler>>,
    next_request_id: AtomicI64,
    closed: AtomicBool,
    finalized: AtomicBool,
    close_hooks: SyncMutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    error_hooks: SyncMutex<Vec<Box<dyn Fn(&TransportError) + Send + Sync>>>,
}

/// A JSON-RPC 2.0 engine bound to one transport.
#[derive(Clone)]
pub struct ProtocolEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl ProtocolEngine {
    /// Create an engine; call [`connect`](Self::connect) to start it.
    pub fn new(options: ProtocolOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                options,
                transport: SyncMutex::new(None),
                pending: DashMap::new(),
                inbound: DashMap::new(),
                request_handlers: DashMap::new(),
                notification_handlers: DashMap::new(),
                next_request_id: AtomicI64::new(0),
                closed: AtomicBool::new(false),
                finalized: AtomicBool::new(false),
                close_hooks: SyncMutex::new(Vec::new()),
                error_hooks: SyncMutex::new(Vec::new()),
            }),
        }
    }

    /// Engine options.
    pub fn options(&self) -> &ProtocolOptions {
        &self.inner.options
    }

    /// Bind to a transport and start the read loop. The loop runs until
    /// the transport ends or the engine closes, then finalizes the engine.
    pub fn connect(&self, transport: Arc<dyn Transport>) {
        *self.inner.transport.lock() = Some(Arc::clone(&transport));
        let engine = self.clone();
        tokio::spawn(async move {
            engine.read_loop(transport).await;
        });
    }

    /// Register the handler for a request method, replacing any previous one.
    pub fn set_request_handler(&self, method: &Method, handler: Arc<dyn RequestHandler>) {
        self.inner
            .request_handlers
            .insert(method.as_str().to_string(), handler);
    }

    /// Remove the handler for a request method.
    pub fn remove_request_handler(&self, method: &Method) {
        self.inner.request_handlers.remove(method.as_str());
    }

    /// Register the handler for a notification method, replacing any
    /// previous one.
    pub fn set_notification_handler(&self, method: &Method, handler: Arc<dyn NotificationHandler>) {
        self.inner
            .notification_handlers
            .insert(method.as_str().to_string(), handler);
    }

    /// True once [`close`](Self::close) has run or the transport ended.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Run `hook` when the engine shuts down. Hooks run exactly once.
    pub fn on_close<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.close_hooks.lock().push(Box::new(hook));
    }

    /// Run `hook` on transport read errors.
    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.inner.error_hooks.lock().push(Box::new(hook));
    }

    fn transport(&self) -> McpResult<Arc<dyn Transport>> {
        self.inner
            .transport
            .lock()
            .clone()
            .ok_or(McpError::ConnectionClosed)
    }

    async fn send_message(&self, message: TransportMessage) -> McpResult<()> {
        let transport = self.transport()?;
        transport.send(message).await.map_err(|err| match err {
            TransportError::Closed => McpError::ConnectionClosed,
            other => McpError::Internal(format!("send failed: {other}")),
        })
    }

    /// Send a request and await its result.
    ///
    /// Exactly one of these completes the call: a matching response, a
    /// matching error, the per-request timeout, or connection close. On
    /// timeout a `notifications/cancelled{reason:"timeout"}` is sent to the
    /// peer and a late response, should one still arrive, is dropped.
    pub async fn request(
        &self,
        method: &Method,
        params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<Value> {
        if self.is_closed() {
            return Err(McpError::ConnectionClosed);
        }
        let id = RequestId::Number(self.inner.next_request_id.fetch_add(1, Ordering::AcqRel) + 1);
        let (respond, done) = oneshot::channel();
        self.inner.pending.insert(id.clone(), respond);

        let request = JsonRpcRequest::new(id.clone(), method.as_str(), params);
        let message = TransportMessage {
            message: JsonRpcMessage::Request(request),
            related_request_id: options.related_request_id.clone(),
        };
        if let Err(err) = self.send_message(message).await {
            self.inner.pending.remove(&id);
            return Err(err);
        }

        let timeout = options
            .timeout
            .unwrap_or(self.inner.options.request_timeout);
        match tokio::time::timeout(timeout, done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.remove(&id);
                let params = CancelledParams {
                    request_id: id.clone(),
                    reason: Some("timeout".to_string()),
                };
                let cancel = JsonRpcNotification::new(
                    Method::NotificationCancelled.as_str(),
                    serde_json::to_value(params).ok(),
                );
                let message = TransportMessage {
                    message: JsonRpcMessage::Notification(cancel),
                    related_request_id: options.related_request_id,
                };
                if let Err(err) = self.send_message(message).await {
                    tracing::debug!(error = %err, request_id = %id, "could not send timeout cancellation");
                }
                Err(McpError::RequestTimeout(timeout))
            }
        }
    }

    /// Send a notification; never suspends beyond the transport flush.
    pub async fn notification(
        &self,
        method: &Method,
        params: Option<Value>,
        related_request_id: Option<RequestId>,
    ) -> McpResult<()> {
        if self.is_closed() {
            return Err(McpError::ConnectionClosed);
        }
        let notification = JsonRpcNotification::new(method.as_str(), params);
        self.send_message(TransportMessage {
            message: JsonRpcMessage::Notification(notification),
            related_request_id,
        })
        .await
    }

    /// Shut down: fail pending requests with `ConnectionClosed`, cancel
    /// in-flight inbound handlers, run close hooks, close the transport.
    /// Idempotent.
    pub async fn close(&self) -> McpResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(transport) = self.inner.transport.lock().clone() {
            if let Err(err) = transport.close().await {
                tracing::debug!(error = %err, "transport close failed");
            }
        }
        self.finalize();
        Ok(())
    }

    fn finalize(&self) {
        if self.inner.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.closed.store(true, Ordering::Release);

        let pending: Vec<RequestId> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in pending {
            if let Some((_, respond)) = self.inner.pending.remove(&id) {
                let _ = respond.send(Err(McpError::ConnectionClosed));
            }
        }
        for entry in self.inner.inbound.iter() {
            entry.value().cancel();
        }

        let hooks = std::mem::take(&mut *self.inner.close_hooks.lock());
        for hook in &hooks {
            hook();
        }
    }

    async fn read_loop(self, transport: Arc<dyn Transport>) {
        loop {
            match transport.receive().await {
                Ok(Some(message)) => self.dispatch(message),
                Ok(None) => {
                    tracing::debug!("transport ended");
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "transport read failed");
                    let hooks = self.inner.error_hooks.lock();
                    for hook in hooks.iter() {
                        hook(&err);
                    }
                    drop(hooks);
                    break;
                }
            }
        }
        self.inner.closed.store(true, Ordering::Release);
        if let Err(err) = transport.close().await {
            tracing::debug!(error = %err, "transport close after read loop failed");
        }
        self.finalize();
    }

    fn dispatch(&self, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Request(request) => {
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.handle_request(request).await;
                });
            }
            JsonRpcMessage::Notification(notification) => {
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.handle_notification(notification).await;
                });
            }
            JsonRpcMessage::Response(response) => {
                self.complete_pending(&response.id, Ok(response.result));
            }
            JsonRpcMessage::Error(error) => match error.id {
                Some(id) => {
                    self.complete_pending(&id, Err(McpError::from_error_object(&error.error)));
                }
                None => {
                    tracing::warn!(code = error.error.code, "peer reported framing error");
                }
            },
        }
    }

    fn complete_pending(&self, id: &RequestId, result: McpResult<Value>) {
        match self.inner.pending.remove(id) {
            Some((_, respond)) => {
                let _ = respond.send(result);
            }
            // Late response after cancellation or timeout.
            None => tracing::debug!(request_id = %id, "dropping response with no pending request"),
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;

        let Some(handler) = self
            .inner
            .request_handlers
            .get(&method)
            .map(|entry| Arc::clone(entry.value()))
        else {
            tracing::debug!(%method, "no handler registered");
            let error = JsonRpcError::new(
                id,
                McpError::MethodNotFound(method.clone()).to_error_object(),
            );
            if let Err(err) = self
                .send_message(TransportMessage::new(JsonRpcMessage::Error(error)))
                .await
            {
                tracing::debug!(error = %err, "failed to send method-not-found");
            }
            return;
        };

        let token = CancellationToken::new();
        self.inner.inbound.insert(id.clone(), token.clone());
        let ctx = RequestContext {
            request_id: Some(id.clone()),
            cancellation: token.clone(),
        };

        let result = handler.handle(params, ctx).await;
        self.inner.inbound.remove(&id);

        if token.is_cancelled() {
            tracing::debug!(request_id = %id, "request was cancelled; dropping result");
            return;
        }

        let reply = match result {
            Ok(value) => JsonRpcMessage::Response(JsonRpcResponse::new(id, value)),
            Err(err) => {
                tracing::debug!(request_id = %id, error = %err, "handler failed");
                JsonRpcMessage::Error(JsonRpcError::new(id, err.to_error_object()))
            }
        };
        if let Err(err) = self.send_message(TransportMessage::new(reply)).await {
            tracing::debug!(error = %err, "failed to send response");
        }
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) {
        if notification.method == Method::NotificationCancelled.as_str() {
            self.handle_cancelled(&notification);
        }
        let handler = self
            .inner
            .notification_handlers
            .get(&notification.method)
            .map(|entry| Arc::clone(entry.value()));
        match handler {
            Some(handler) => handler.handle(notification.params).await,
            None if notification.method != Method::NotificationCancelled.as_str() => {
                // Unknown notifications are logged and dropped, never failed.
                tracing::debug!(method = %notification.method, "dropping unhandled notification");
            }
            None => {}
        }
    }

    fn handle_cancelled(&self, notification: &JsonRpcNotification) {
        let Some(params) = notification
            .params
            .clone()
            .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
        else {
            tracing::debug!("malformed cancellation notification");
            return;
        };
        match self.inner.inbound.get(&params.request_id) {
            Some(entry) => {
                tracing::debug!(
                    request_id = %params.request_id,
                    reason = params.reason.as_deref().unwrap_or("unspecified"),
                    "cancelling in-flight request"
                );
                entry.value().cancel();
            }
            None => tracing::debug!(
                request_id = %params.request_id,
                "cancellation for unknown request"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polymcp_transport::InMemoryTransport;
    use serde_json::json;

    fn engine_pair() -> (ProtocolEngine, Arc<InMemoryTransport>) {
        let (server_end, client_end) = InMemoryTransport::pair();
        let engine = ProtocolEngine::new(ProtocolOptions::default());
        engine.connect(Arc::new(server_end));
        (engine, Arc::new(client_end))
    }

    async fn client_request(
        client: &InMemoryTransport,
        id: i64,
        method: &str,
        params: Option<Value>,
    ) -> JsonRpcMessage {
        let request = JsonRpcRequest::new(RequestId::Number(id), method, params);
        client
            .send(JsonRpcMessage::Request(request).into())
            .await
            .unwrap();
        client.receive().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn echo_handler_round_trip() {
        let (engine, client) = engine_pair();
        engine.set_request_handler(
            &Method::Custom("echo".into()),
            request_handler(|params, _ctx| async move { Ok(params.unwrap_or(Value::Null)) }),
        );

        let reply = client_request(&client, 1, "echo", Some(json!({"x": 1}))).await;
        match reply {
            JsonRpcMessage::Response(response) => {
                assert_eq!(response.id, RequestId::Number(1));
                assert_eq!(response.result, json!({"x": 1}));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let (_engine, client) = engine_pair();
        let reply = client_request(&client, 2, "nope", None).await;
        match reply {
            JsonRpcMessage::Error(error) => {
                assert_eq!(error.error.code, -32601);
                assert_eq!(error.id, Some(RequestId::Number(2)));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_error_keeps_declared_code() {
        let (engine, client) = engine_pair();
        engine.set_request_handler(
            &Method::Custom("fail".into()),
            request_handler(|_params, _ctx| async move {
                Err(McpError::rpc(-32002, "Resource not found: mem://x"))
            }),
        );

        let reply = client_request(&client, 3, "fail", None).await;
        match reply {
            JsonRpcMessage::Error(error) => assert_eq!(error.error.code, -32002),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn outbound_request_completes_on_response() {
        let (engine, client) = engine_pair();

        let call = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .request(&Method::Ping, None, RequestOptions::default())
                    .await
            })
        };

        let inbound = client.receive().await.unwrap().unwrap();
        let JsonRpcMessage::Request(request) = inbound else {
            panic!("expected request");
        };
        assert_eq!(request.method, "ping");
        client
            .send(JsonRpcMessage::Response(JsonRpcResponse::new(request.id, json!({}))).into())
            .await
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!({}));
    }

    #[tokio::test]
    async fn timeout_sends_cancelled_and_drops_late_response() {
        let (engine, client) = engine_pair();

        let result = engine
            .request(
                &Method::Ping,
                None,
                RequestOptions::with_timeout(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(McpError::RequestTimeout(_))));

        // First frame is the request itself, second the cancellation.
        let request = client.receive().await.unwrap().unwrap();
        let JsonRpcMessage::Request(request) = request else {
            panic!("expected request");
        };
        let cancelled = client.receive().await.unwrap().unwrap();
        match cancelled {
            JsonRpcMessage::Notification(notification) => {
                assert_eq!(notification.method, "notifications/cancelled");
                let params: CancelledParams =
                    serde_json::from_value(notification.params.unwrap()).unwrap();
                assert_eq!(params.request_id, request.id);
                assert_eq!(params.reason.as_deref(), Some("timeout"));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }

        // A late response must be swallowed without effect.
        client
            .send(JsonRpcMessage::Response(JsonRpcResponse::new(request.id, json!({}))).into())
            .await
            .unwrap();
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn close_fails_pending_with_connection_closed() {
        let (engine, _client) = engine_pair();

        let call = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .request(&Method::Ping, None, RequestOptions::default())
                    .await
            })
        };
        tokio::task::yield_now().await;

        engine.close().await.unwrap();
        assert!(matches!(
            call.await.unwrap(),
            Err(McpError::ConnectionClosed)
        ));
        // Idempotent.
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_hooks_run_exactly_once() {
        use std::sync::atomic::AtomicUsize;
        let (engine, _client) = engine_pair();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            engine.on_close(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        engine.close().await.unwrap();
        engine.close().await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peer_disconnect_finalizes_engine() {
        let (engine, client) = engine_pair();
        client.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.is_closed());
    }

    #[tokio::test]
    async fn cancellation_suppresses_the_response() {
        let (engine, client) = engine_pair();
        engine.set_request_handler(
            &Method::Custom("slow".into()),
            request_handler(|_params, ctx| async move {
                ctx.cancellation.cancelled().await;
                Ok(json!("too late"))
            }),
        );

        let request = JsonRpcRequest::new(RequestId::Number(9), "slow", None);
        client
            .send(JsonRpcMessage::Request(request).into())
            .await
            .unwrap();
        tokio::task::yield_now().await;

        let cancel = JsonRpcNotification::new(
            "notifications/cancelled",
            Some(json!({"requestId": 9})),
        );
        client
            .send(JsonRpcMessage::Notification(cancel).into())
            .await
            .unwrap();

        // No response frame may arrive for the cancelled request.
        let outcome =
            tokio::time::timeout(Duration::from_millis(100), client.receive()).await;
        assert!(outcome.is_err(), "cancelled request must not be answered");
    }
}
