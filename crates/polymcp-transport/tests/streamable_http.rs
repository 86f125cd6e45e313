//! Streamable HTTP endpoint tests, driven through the axum router with
//! `tower::ServiceExt`; no sockets involved.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use polymcp_protocol::{JsonRpcMessage, JsonRpcResponse};
use polymcp_transport::sse::{SseEvent, SseParser};
use polymcp_transport::{
    InMemoryEventStore, StreamableHttpConfig, StreamableHttpConfigBuilder, StreamableHttpService,
    Transport, HEADER_LAST_EVENT_ID, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID,
};

const WAIT: Duration = Duration::from_millis(500);

/// A service whose sessions echo request params back as results; initialize
/// gets a fixed InitializeResult-shaped reply.
fn echo_service(config: StreamableHttpConfig) -> StreamableHttpService {
    StreamableHttpService::new(config, |transport| async move {
        tokio::spawn(async move {
            while let Ok(Some(message)) = transport.receive().await {
                if let JsonRpcMessage::Request(request) = message {
                    let result = if request.method == "initialize" {
                        json!({
                            "protocolVersion": "2025-03-26",
                            "capabilities": {},
                            "serverInfo": {"name": "test-server", "version": "1"},
                        })
                    } else {
                        request.params.clone().unwrap_or(json!({}))
                    };
                    let reply = JsonRpcMessage::Response(JsonRpcResponse::new(request.id, result));
                    if transport.send(reply.into()).await.is_err() {
                        break;
                    }
                }
            }
        });
    })
}

fn post(body: Value) -> Request<Body> {
    post_with(body, &[])
}

fn post_with(body: Value, extra_headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, "application/json, text/event-stream");
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn initialize_body() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "c", "version": "1"},
        },
    })
}

async fn read_all_sse(body: Body) -> Vec<SseEvent> {
    let bytes = axum::body::to_bytes(body, 1024 * 1024).await.unwrap();
    let mut parser = SseParser::new();
    parser.feed(&bytes)
}

/// Incremental reader over a live (unterminated) SSE body.
struct SseBody {
    stream: axum::body::BodyDataStream,
    parser: SseParser,
    pending: std::collections::VecDeque<SseEvent>,
}

impl SseBody {
    fn new(body: Body) -> Self {
        Self {
            stream: body.into_data_stream(),
            parser: SseParser::new(),
            pending: std::collections::VecDeque::new(),
        }
    }

    async fn next_event(&mut self) -> SseEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            let chunk = tokio::time::timeout(WAIT, self.stream.next())
                .await
                .expect("timed out reading SSE stream")
                .expect("stream ended early")
                .unwrap();
            self.pending.extend(self.parser.feed(&chunk));
        }
    }
}

async fn initialize_session(router: &Router) -> String {
    let response = router.clone().oneshot(post(initialize_body())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get(HEADER_SESSION_ID)
        .expect("initialize must mint a session id")
        .to_str()
        .unwrap()
        .to_string();
    // Drain the SSE body; the stream closes once the response is delivered.
    let events = read_all_sse(response.into_body()).await;
    assert!(
        events
            .iter()
            .any(|event| event.data.contains("test-server")),
        "{events:?}"
    );
    session_id
}

#[tokio::test]
async fn initialize_over_sse_mints_a_session() {
    let service = echo_service(StreamableHttpConfig::default());
    let router = service.router();

    let session_id = initialize_session(&router).await;
    assert!(!session_id.is_empty());
    assert_eq!(service.session_count(), 1);
}

#[tokio::test]
async fn json_mode_buffers_the_response() {
    let config = StreamableHttpConfigBuilder::new().with_json_response(true).build();
    let service = echo_service(config);
    let router = service.router();

    let response = router.clone().oneshot(post(initialize_body())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("application/json"));
    assert!(response.headers().contains_key(HEADER_PROTOCOL_VERSION));

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["id"], 1);
    assert_eq!(value["result"]["serverInfo"]["name"], "test-server");
}

#[tokio::test]
async fn json_mode_batch_preserves_request_order() {
    let config = StreamableHttpConfigBuilder::new()
        .with_json_response(true)
        .stateless()
        .build();
    let service = echo_service(config);
    let router = service.router();

    let batch = json!([
        {"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {"n": 1}},
        {"jsonrpc": "2.0", "id": 2, "method": "echo", "params": {"n": 2}},
        {"jsonrpc": "2.0", "id": 3, "method": "echo", "params": {"n": 3}},
    ]);
    let response = router.oneshot(post(batch)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let values: Vec<Value> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(values.len(), 3);
    for (index, value) in values.iter().enumerate() {
        assert_eq!(value["id"], index as i64 + 1);
        assert_eq!(value["result"]["n"], index as i64 + 1);
    }
}

#[tokio::test]
async fn missing_accept_is_not_acceptable() {
    let service = echo_service(StreamableHttpConfig::default());
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, "application/json")
        .body(Body::from(initialize_body().to_string()))
        .unwrap();
    let response = service.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
}

#[tokio::test]
async fn wrong_content_type_is_rejected() {
    let service = echo_service(StreamableHttpConfig::default());
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::ACCEPT, "application/json, text/event-stream")
        .body(Body::from("hello"))
        .unwrap();
    let response = service.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let config = StreamableHttpConfigBuilder::new().with_max_body_bytes(64).build();
    let service = echo_service(config);
    let big = json!({"jsonrpc": "2.0", "id": 1, "method": "x", "params": {"pad": "y".repeat(256)}});
    let response = service.router().oneshot(post(big)).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn unparseable_bodies_get_a_parse_error_envelope() {
    let service = echo_service(StreamableHttpConfig::default());
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, "application/json, text/event-stream")
        .body(Body::from("{not json"))
        .unwrap();
    let response = service.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["id"], Value::Null);
    assert_eq!(value["error"]["code"], -32700);
}

#[tokio::test]
async fn initialize_batched_with_other_messages_is_invalid() {
    let service = echo_service(StreamableHttpConfig::default());
    let body = json!([
        initialize_body(),
        {"jsonrpc": "2.0", "id": 2, "method": "ping"},
    ]);
    let response = service.router().oneshot(post(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["error"]["code"], -32600);
}

#[tokio::test]
async fn post_before_initialize_is_rejected() {
    let service = echo_service(StreamableHttpConfig::default());
    let body = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
    let response = service.router().oneshot(post(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(value["error"]["message"]
        .as_str()
        .unwrap()
        .contains("not initialized"));
}

#[tokio::test]
async fn unknown_session_id_is_not_found() {
    let service = echo_service(StreamableHttpConfig::default());
    let router = service.router();
    initialize_session(&router).await;

    let body = json!({"jsonrpc": "2.0", "id": 2, "method": "ping"});
    let response = router
        .oneshot(post_with(body, &[(HEADER_SESSION_ID, "no-such-session")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn notification_only_posts_are_accepted_without_a_body() {
    let service = echo_service(StreamableHttpConfig::default());
    let router = service.router();
    let session_id = initialize_session(&router).await;

    let body = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
    let response = router
        .oneshot(post_with(body, &[(HEADER_SESSION_ID, session_id.as_str())]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn sse_batch_stream_closes_after_all_responses() {
    let service = echo_service(StreamableHttpConfig::default());
    let router = service.router();
    let session_id = initialize_session(&router).await;

    let batch = json!([
        {"jsonrpc": "2.0", "id": 10, "method": "echo", "params": {"n": 10}},
        {"jsonrpc": "2.0", "id": 11, "method": "echo", "params": {"n": 11}},
    ]);
    let response = router
        .oneshot(post_with(batch, &[(HEADER_SESSION_ID, session_id.as_str())]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    // to_bytes returning proves the stream terminated once both requests
    // had terminal responses.
    let events = read_all_sse(response.into_body()).await;
    let ids: Vec<i64> = events
        .iter()
        .filter(|event| !event.data.is_empty())
        .map(|event| serde_json::from_str::<Value>(&event.data).unwrap()["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&10) && ids.contains(&11));
}

#[tokio::test]
async fn get_requires_a_session() {
    let service = echo_service(StreamableHttpConfig::default());
    let request = Request::builder()
        .method("GET")
        .uri("/mcp")
        .header(header::ACCEPT, "text/event-stream")
        .body(Body::empty())
        .unwrap();
    let response = service.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

fn get_request(session_id: &str, last_event_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("GET")
        .uri("/mcp")
        .header(header::ACCEPT, "text/event-stream")
        .header(HEADER_SESSION_ID, session_id);
    if let Some(id) = last_event_id {
        builder = builder.header(HEADER_LAST_EVENT_ID, id);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn second_standalone_stream_conflicts() {
    let service = echo_service(StreamableHttpConfig::default());
    let router = service.router();
    let session_id = initialize_session(&router).await;

    let first = router
        .clone()
        .oneshot(get_request(&session_id, None))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = router
        .oneshot(get_request(&session_id, None))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn server_push_rides_the_standalone_stream() {
    let service = echo_service(StreamableHttpConfig::default());
    let router = service.router();
    let session_id = initialize_session(&router).await;

    let response = router.oneshot(get_request(&session_id, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = SseBody::new(response.into_body());

    let transport = service.transport(&session_id).unwrap();
    let notification = JsonRpcMessage::Notification(
        polymcp_protocol::JsonRpcNotification::new("notifications/tools/list_changed", None),
    );
    transport.send(notification.into()).await.unwrap();

    let event = body.next_event().await;
    assert!(event.data.contains("tools/list_changed"));
}

#[tokio::test]
async fn delete_ends_the_session() {
    let service = echo_service(StreamableHttpConfig::default());
    let router = service.router();
    let session_id = initialize_session(&router).await;

    let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let closed = Arc::clone(&closed);
        service.on_session_closed(move |_id| {
            closed.store(true, std::sync::atomic::Ordering::SeqCst);
        });
    }

    let delete = Request::builder()
        .method("DELETE")
        .uri("/mcp")
        .header(HEADER_SESSION_ID, session_id.as_str())
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(delete).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(service.session_count(), 0);

    // The session id is gone for later requests.
    let body = json!({"jsonrpc": "2.0", "id": 5, "method": "ping"});
    let response = router
        .oneshot(post_with(body, &[(HEADER_SESSION_ID, session_id.as_str())]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn dns_rebinding_protection_rejects_foreign_origins() {
    let config = StreamableHttpConfigBuilder::new()
        .with_dns_rebinding_protection(true)
        .allow_host("localhost")
        .build();
    let service = echo_service(config);

    let ok = post_with(initialize_body(), &[("origin", "http://localhost:3000")]);
    let response = service.router().oneshot(ok).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bad = post_with(initialize_body(), &[("origin", "http://evil.example")]);
    let response = service.router().oneshot(bad).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn resume_replays_events_after_last_event_id() {
    let store = Arc::new(InMemoryEventStore::new());
    let config = StreamableHttpConfigBuilder::new()
        .with_event_store(store.clone())
        .build();
    let service = echo_service(config);
    let router = service.router();
    let session_id = initialize_session(&router).await;

    // Open the standalone stream and push three events through it.
    let response = router
        .clone()
        .oneshot(get_request(&session_id, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = SseBody::new(response.into_body());

    let transport = service.transport(&session_id).unwrap();
    for n in 1..=3 {
        let notification = JsonRpcMessage::Notification(polymcp_protocol::JsonRpcNotification::new(
            "notifications/message",
            Some(json!({"level": "info", "data": format!("event-{n}")})),
        ));
        transport.send(notification.into()).await.unwrap();
    }

    let mut events = Vec::new();
    for _ in 0..3 {
        events.push(body.next_event().await);
    }
    let e2_id = events[1].id.clone().expect("stored events carry ids");
    let e3_data = events[2].data.clone();
    // Client disconnects.
    drop(body);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Reconnect after e2: e3 replays first, then the stream goes live.
    let response = router
        .clone()
        .oneshot(get_request(&session_id, Some(&e2_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = SseBody::new(response.into_body());

    let replayed = body.next_event().await;
    assert_eq!(replayed.data, e3_data);
    let replay_id: u64 = replayed.id.clone().unwrap().parse().unwrap();

    // New events keep flowing with monotonically larger ids.
    let notification = JsonRpcMessage::Notification(polymcp_protocol::JsonRpcNotification::new(
        "notifications/message",
        Some(json!({"level": "info", "data": "event-4"})),
    ));
    transport.send(notification.into()).await.unwrap();
    let live = body.next_event().await;
    assert!(live.data.contains("event-4"));
    let live_id: u64 = live.id.clone().unwrap().parse().unwrap();
    assert!(live_id > replay_id);
}

#[tokio::test]
async fn resume_with_unknown_event_id_is_rejected() {
    let store = Arc::new(InMemoryEventStore::new());
    let config = StreamableHttpConfigBuilder::new()
        .with_event_store(store)
        .build();
    let service = echo_service(config);
    let router = service.router();
    let session_id = initialize_session(&router).await;

    let response = router
        .oneshot(get_request(&session_id, Some("999999")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stateless_mode_skips_session_tracking() {
    let config = StreamableHttpConfigBuilder::new().stateless().build();
    let service = echo_service(config);
    let router = service.router();

    // No session header needed, none minted.
    let body = json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {"ok": true}});
    let response = router.oneshot(post(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(HEADER_SESSION_ID).is_none());
    assert_eq!(service.session_count(), 0);

    let events = read_all_sse(response.into_body()).await;
    assert!(events.iter().any(|event| event.data.contains("\"ok\":true")));
}
