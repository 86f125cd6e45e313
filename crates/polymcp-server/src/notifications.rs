//! Notification fan-out.
//!
//! One in-process broker turns registry mutations into per-session
//! notifications. Every emitted event is stamped from a strictly monotonic
//! logical clock; a single dispatcher task fans events out to one long-lived
//! job per session, and each job filters by its session's view:
//!
//! - events stamped before the session subscribed are dropped,
//! - `ResourceUpdated` events are dropped unless the session subscribed to
//!   that URI, and only from the subscription's stamp onward,
//! - list-changed events are delivered unconditionally.
//!
//! Because stamping happens at emission and both the dispatcher and the
//! session jobs preserve arrival order, any one session observes events in
//! stamp order. Slow sessions backpressure the dispatcher through their
//! bounded job channels.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use polymcp_protocol::McpResult;

const SESSION_QUEUE_CAPACITY: usize = 64;

/// A server-side event to fan out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The tool list changed.
    ToolListChanged,
    /// The prompt list changed.
    PromptListChanged,
    /// The resource (or resource template) list changed.
    ResourceListChanged,
    /// A concrete resource changed.
    ResourceUpdated {
        /// URI of the changed resource
        uri: String,
    },
}

#[derive(Debug, Clone)]
struct StampedEvent {
    ts: u64,
    event: ServerEvent,
}

enum JobInput {
    Event(StampedEvent),
    End,
}

enum DispatcherInput {
    Event(StampedEvent),
    Shutdown,
}

/// Where a session job delivers filtered events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Stable identifier of the session behind this sink.
    fn sink_id(&self) -> String;

    /// Deliver one event to the session's peer.
    async fn deliver(&self, event: &ServerEvent) -> McpResult<()>;
}

struct SessionChannel {
    tx: mpsc::Sender<JobInput>,
    subscriptions: Arc<DashMap<String, u64>>,
    job: JoinHandle<()>,
}

struct ServiceInner {
    clock: AtomicU64,
    closing: AtomicBool,
    ingress: SyncMutex<Option<mpsc::UnboundedSender<DispatcherInput>>>,
    dispatcher: SyncMutex<Option<JoinHandle<()>>>,
    sessions: Arc<DashMap<String, SessionChannel>>,
}

/// The notification broker.
#[derive(Clone)]
pub struct NotificationService {
    inner: Arc<ServiceInner>,
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotificationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationService")
            .field("sessions", &self.inner.sessions.len())
            .field("closing", &self.inner.closing.load(Ordering::Acquire))
            .finish()
    }
}

impl NotificationService {
    /// Create the broker and start its dispatcher.
    pub fn new() -> Self {
        let (ingress_tx, mut ingress_rx) = mpsc::unbounded_channel::<DispatcherInput>();
        let sessions: Arc<DashMap<String, SessionChannel>> = Arc::new(DashMap::new());

        let dispatcher_sessions = Arc::clone(&sessions);
        let dispatcher = tokio::spawn(async move {
            while let Some(input) = ingress_rx.recv().await {
                match input {
                    DispatcherInput::Event(event) => {
                        let targets: Vec<mpsc::Sender<JobInput>> = dispatcher_sessions
                            .iter()
                            .map(|entry| entry.value().tx.clone())
                            .collect();
                        for tx in targets {
                            // A full queue suspends the dispatcher until the
                            // slow session drains; emitters stay unblocked.
                            if tx.send(JobInput::Event(event.clone())).await.is_err() {
                                tracing::debug!("session job gone during fan-out");
                            }
                        }
                    }
                    DispatcherInput::Shutdown => {
                        let targets: Vec<mpsc::Sender<JobInput>> = dispatcher_sessions
                            .iter()
                            .map(|entry| entry.value().tx.clone())
                            .collect();
                        for tx in targets {
                            let _ = tx.send(JobInput::End).await;
                        }
                        break;
                    }
                }
            }
        });

        Self {
            inner: Arc::new(ServiceInner {
                clock: AtomicU64::new(0),
                closing: AtomicBool::new(false),
                ingress: SyncMutex::new(Some(ingress_tx)),
                dispatcher: SyncMutex::new(Some(dispatcher)),
                sessions,
            }),
        }
    }

    /// Advance the logical clock and return the new reading. Every call
    /// observes a strictly larger value, so event stamps and subscription
    /// stamps are totally ordered.
    fn tick(&self) -> u64 {
        self.inner.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stamp and enqueue an event. Never blocks the caller; events emitted
    /// during shutdown are dropped.
    pub fn emit(&self, event: ServerEvent) {
        if self.inner.closing.load(Ordering::Acquire) {
            tracing::debug!(?event, "broker closing; event dropped");
            return;
        }
        let stamped = StampedEvent {
            ts: self.tick(),
            event,
        };
        let guard = self.inner.ingress.lock();
        if let Some(ingress) = guard.as_ref() {
            if ingress.send(DispatcherInput::Event(stamped)).is_err() {
                tracing::debug!("notification dispatcher gone");
            }
        }
    }

    /// Start a consumer job for a session. Events stamped before this call
    /// will not reach it.
    pub fn subscribe_session(&self, sink: Arc<dyn NotificationSink>) {
        let session_id = sink.sink_id();
        let start_ts = self.tick();
        let subscriptions: Arc<DashMap<String, u64>> = Arc::new(DashMap::new());
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);

        let job_subscriptions = Arc::clone(&subscriptions);
        let job = tokio::spawn(run_session_job(rx, sink, start_ts, job_subscriptions));

        if let Some(previous) = self.inner.sessions.insert(
            session_id.clone(),
            SessionChannel {
                tx,
                subscriptions,
                job,
            },
        ) {
            tracing::warn!(session_id, "replacing existing notification job");
            previous.job.abort();
        }
    }

    /// Stop and remove a session's consumer job, letting it drain what was
    /// already queued.
    pub async fn unsubscribe_session(&self, session_id: &str) {
        if let Some((_, channel)) = self.inner.sessions.remove(session_id) {
            let _ = channel.tx.send(JobInput::End).await;
            if let Err(err) = channel.job.await {
                if !err.is_cancelled() {
                    tracing::warn!(session_id, error = %err, "notification job panicked");
                }
            }
        }
    }

    /// Subscribe a session to updates of one resource, from now on.
    pub fn subscribe_to_resource(&self, session_id: &str, uri: &str) -> bool {
        match self.inner.sessions.get(session_id) {
            Some(channel) => {
                channel
                    .subscriptions
                    .insert(uri.to_string(), self.tick());
                true
            }
            None => false,
        }
    }

    /// Drop a session's subscription to one resource.
    pub fn unsubscribe_from_resource(&self, session_id: &str, uri: &str) -> bool {
        self.inner
            .sessions
            .get(session_id)
            .is_some_and(|channel| channel.subscriptions.remove(uri).is_some())
    }

    /// Whether a session currently watches a URI.
    pub fn is_subscribed(&self, session_id: &str, uri: &str) -> bool {
        self.inner
            .sessions
            .get(session_id)
            .is_some_and(|channel| channel.subscriptions.contains_key(uri))
    }

    /// Shut down: stop accepting events, flush what was already emitted,
    /// end every session job, and join them.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let ingress = self.inner.ingress.lock().take();
        if let Some(ingress) = ingress {
            // The shutdown marker queues behind in-flight events, so
            // everything emitted before close still reaches the jobs.
            let _ = ingress.send(DispatcherInput::Shutdown);
        }
        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
        let session_ids: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in session_ids {
            if let Some((_, channel)) = self.inner.sessions.remove(&session_id) {
                let _ = channel.job.await;
            }
        }
    }
}

async fn run_session_job(
    mut rx: mpsc::Receiver<JobInput>,
    sink: Arc<dyn NotificationSink>,
    start_ts: u64,
    subscriptions: Arc<DashMap<String, u64>>,
) {
    while let Some(input) = rx.recv().await {
        let stamped = match input {
            JobInput::Event(event) => event,
            JobInput::End => break,
        };
        if stamped.ts < start_ts {
            continue;
        }
        if let ServerEvent::ResourceUpdated { uri } = &stamped.event {
            let eligible = subscriptions
                .get(uri)
                .is_some_and(|subscribed_at| stamped.ts >= *subscribed_at);
            if !eligible {
                continue;
            }
        }
        if let Err(err) = sink.deliver(&stamped.event).await {
            tracing::debug!(
                session_id = sink.sink_id(),
                error = %err,
                "notification delivery failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct RecordingSink {
        id: String,
        delivered: SyncMutex<Vec<ServerEvent>>,
    }

    impl RecordingSink {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                delivered: SyncMutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<ServerEvent> {
            self.delivered.lock().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn sink_id(&self) -> String {
            self.id.clone()
        }

        async fn deliver(&self, event: &ServerEvent) -> McpResult<()> {
            self.delivered.lock().push(event.clone());
            Ok(())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn events_before_session_start_are_dropped() {
        let service = NotificationService::new();
        service.emit(ServerEvent::ToolListChanged);

        let sink = RecordingSink::new("s1");
        service.subscribe_session(sink.clone());
        service.emit(ServerEvent::PromptListChanged);
        settle().await;

        assert_eq!(sink.events(), vec![ServerEvent::PromptListChanged]);
        service.close().await;
    }

    #[tokio::test]
    async fn resource_updates_respect_subscription_time_and_uri() {
        let service = NotificationService::new();
        let sink = RecordingSink::new("s1");
        service.subscribe_session(sink.clone());

        // Before any subscription: dropped.
        service.emit(ServerEvent::ResourceUpdated {
            uri: "mem://x".into(),
        });
        settle().await;
        service.subscribe_to_resource("s1", "mem://x");

        // After subscription, matching URI: delivered.
        service.emit(ServerEvent::ResourceUpdated {
            uri: "mem://x".into(),
        });
        // Different URI: dropped.
        service.emit(ServerEvent::ResourceUpdated {
            uri: "mem://y".into(),
        });
        settle().await;

        assert_eq!(
            sink.events(),
            vec![ServerEvent::ResourceUpdated {
                uri: "mem://x".into()
            }]
        );
        service.close().await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_resource_updates() {
        let service = NotificationService::new();
        let sink = RecordingSink::new("s1");
        service.subscribe_session(sink.clone());
        service.subscribe_to_resource("s1", "mem://x");

        service.emit(ServerEvent::ResourceUpdated {
            uri: "mem://x".into(),
        });
        settle().await;
        assert!(service.unsubscribe_from_resource("s1", "mem://x"));
        service.emit(ServerEvent::ResourceUpdated {
            uri: "mem://x".into(),
        });
        settle().await;

        assert_eq!(sink.events().len(), 1);
        service.close().await;
    }

    #[tokio::test]
    async fn delivery_preserves_stamp_order() {
        let service = NotificationService::new();
        let sink = RecordingSink::new("s1");
        service.subscribe_session(sink.clone());

        for _ in 0..10 {
            service.emit(ServerEvent::ToolListChanged);
            service.emit(ServerEvent::PromptListChanged);
        }
        settle().await;

        let events = sink.events();
        assert_eq!(events.len(), 20);
        for pair in events.chunks(2) {
            assert_eq!(pair[0], ServerEvent::ToolListChanged);
            assert_eq!(pair[1], ServerEvent::PromptListChanged);
        }
        service.close().await;
    }

    #[tokio::test]
    async fn close_flushes_already_emitted_events() {
        let service = NotificationService::new();
        let sink = RecordingSink::new("s1");
        service.subscribe_session(sink.clone());

        service.emit(ServerEvent::ToolListChanged);
        service.close().await;

        assert_eq!(sink.events(), vec![ServerEvent::ToolListChanged]);
        // Emission after close is a no-op.
        service.emit(ServerEvent::PromptListChanged);
        settle().await;
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribed_sessions_stop_receiving() {
        let service = NotificationService::new();
        let sink = RecordingSink::new("s1");
        service.subscribe_session(sink.clone());

        service.emit(ServerEvent::ToolListChanged);
        settle().await;
        service.unsubscribe_session("s1").await;
        service.emit(ServerEvent::ToolListChanged);
        settle().await;

        assert_eq!(sink.events().len(), 1);
        service.close().await;
    }
}
