//! Pluggable event storage for SSE resumption.
//!
//! When a store is configured, every SSE frame the Streamable HTTP transport
//! emits is recorded under its stream and assigned an event id. A client
//! that reconnects with `Last-Event-ID` gets everything after that id, in
//! original order, before the stream goes live again.
//!
//! Event ids are strictly monotonic per stream and globally unique, so an id
//! alone identifies its stream.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use polymcp_protocol::JsonRpcMessage;

use crate::error::{TransportError, TransportResult};

/// Append-only event log indexed by event id.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Record a message on a stream, returning its event id.
    async fn store_event(
        &self,
        stream_id: &str,
        message: &JsonRpcMessage,
    ) -> TransportResult<String>;

    /// Allocate an id marking the start of a stream without storing a
    /// message. Emitted with the priming SSE frame so a client can resume
    /// from before the first real event.
    async fn prime_stream(&self, stream_id: &str) -> TransportResult<String>;

    /// The stream an event id belongs to, or `None` if unknown.
    async fn stream_for_event(&self, event_id: &str) -> TransportResult<Option<String>>;

    /// All messages stored after `event_id` on its stream, oldest first.
    async fn replay_after(
        &self,
        event_id: &str,
    ) -> TransportResult<Vec<(String, JsonRpcMessage)>>;
}

#[derive(Default)]
struct StoreState {
    next_id: u64,
    // Per stream: (event id, message); priming markers carry no message and
    // are skipped on replay.
    streams: HashMap<String, Vec<(u64, Option<JsonRpcMessage>)>>,
    index: HashMap<u64, String>,
}

/// In-memory [`EventStore`] with a global monotonic id counter.
#[derive(Default)]
pub struct InMemoryEventStore {
    state: Mutex<StoreState>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&self, stream_id: &str, message: Option<JsonRpcMessage>) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state
            .streams
            .entry(stream_id.to_string())
            .or_default()
            .push((id, message));
        state.index.insert(id, stream_id.to_string());
        id.to_string()
    }

    fn parse_id(event_id: &str) -> TransportResult<u64> {
        event_id
            .parse::<u64>()
            .map_err(|_| TransportError::UnknownEventId(event_id.to_string()))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(
        &self,
        stream_id: &str,
        message: &JsonRpcMessage,
    ) -> TransportResult<String> {
        Ok(self.append(stream_id, Some(message.clone())))
    }

    async fn prime_stream(&self, stream_id: &str) -> TransportResult<String> {
        Ok(self.append(stream_id, None))
    }

    async fn stream_for_event(&self, event_id: &str) -> TransportResult<Option<String>> {
        let id = match Self::parse_id(event_id) {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };
        Ok(self.state.lock().index.get(&id).cloned())
    }

    async fn replay_after(
        &self,
        event_id: &str,
    ) -> TransportResult<Vec<(String, JsonRpcMessage)>> {
        let id = Self::parse_id(event_id)?;
        let state = self.state.lock();
        let stream_id = state
            .index
            .get(&id)
            .ok_or_else(|| TransportError::UnknownEventId(event_id.to_string()))?;
        let events = state
            .streams
            .get(stream_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|(seq, _)| *seq > id)
                    .filter_map(|(seq, message)| {
                        message.as_ref().map(|m| (seq.to_string(), m.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polymcp_protocol::JsonRpcNotification;

    fn notification(method: &str) -> JsonRpcMessage {
        JsonRpcMessage::Notification(JsonRpcNotification::new(method, None))
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_indexed() {
        let store = InMemoryEventStore::new();
        let a = store.store_event("s1", &notification("a")).await.unwrap();
        let b = store.store_event("s1", &notification("b")).await.unwrap();
        let c = store.store_event("s2", &notification("c")).await.unwrap();

        assert!(a.parse::<u64>().unwrap() < b.parse::<u64>().unwrap());
        assert!(b.parse::<u64>().unwrap() < c.parse::<u64>().unwrap());
        assert_eq!(
            store.stream_for_event(&a).await.unwrap().as_deref(),
            Some("s1")
        );
        assert_eq!(
            store.stream_for_event(&c).await.unwrap().as_deref(),
            Some("s2")
        );
        assert_eq!(store.stream_for_event("999").await.unwrap(), None);
    }

    #[tokio::test]
    async fn replay_returns_later_events_in_order() {
        let store = InMemoryEventStore::new();
        let e1 = store.store_event("s", &notification("one")).await.unwrap();
        let _e2 = store.store_event("s", &notification("two")).await.unwrap();
        let _e3 = store.store_event("s", &notification("three")).await.unwrap();

        let replayed = store.replay_after(&e1).await.unwrap();
        let methods: Vec<_> = replayed
            .iter()
            .map(|(_, m)| m.method().unwrap().to_string())
            .collect();
        assert_eq!(methods, ["two", "three"]);
    }

    #[tokio::test]
    async fn priming_marker_resumes_from_stream_start() {
        let store = InMemoryEventStore::new();
        let primer = store.prime_stream("s").await.unwrap();
        store.store_event("s", &notification("one")).await.unwrap();

        assert_eq!(
            store.stream_for_event(&primer).await.unwrap().as_deref(),
            Some("s")
        );
        let replayed = store.replay_after(&primer).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].1.method(), Some("one"));
    }

    #[tokio::test]
    async fn unknown_id_is_an_error_for_replay() {
        let store = InMemoryEventStore::new();
        assert!(store.replay_after("42").await.is_err());
    }
}
