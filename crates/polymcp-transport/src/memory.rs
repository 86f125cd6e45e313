//! In-memory duplex transport.
//!
//! [`InMemoryTransport::pair`] yields two connected ends; frames sent on one
//! end arrive on the other. This is the standard harness for session and
//! engine tests, and works as an embedding transport where client and server
//! share a process.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use polymcp_protocol::JsonRpcMessage;

use crate::error::{TransportError, TransportResult};
use crate::traits::{Transport, TransportMessage};

const CHANNEL_CAPACITY: usize = 64;

/// One end of an in-memory duplex channel.
pub struct InMemoryTransport {
    outgoing: SyncMutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    incoming: Mutex<mpsc::Receiver<JsonRpcMessage>>,
    closed: CancellationToken,
}

impl InMemoryTransport {
    /// Create two connected transport ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self::from_halves(a_tx, b_rx), Self::from_halves(b_tx, a_rx))
    }

    fn from_halves(
        outgoing: mpsc::Sender<JsonRpcMessage>,
        incoming: mpsc::Receiver<JsonRpcMessage>,
    ) -> Self {
        Self {
            outgoing: SyncMutex::new(Some(outgoing)),
            incoming: Mutex::new(incoming),
            closed: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, message: TransportMessage) -> TransportResult<()> {
        let sender = self
            .outgoing
            .lock()
            .as_ref()
            .cloned()
            .ok_or(TransportError::Closed)?;
        sender
            .send(message.message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> TransportResult<Option<JsonRpcMessage>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            message = incoming.recv() => Ok(message),
            () = self.closed.cancelled() => Ok(None),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        // Dropping the sender ends the peer's receive loop once its buffer
        // drains; the token wakes any receive pending on this end, including
        // one that starts after the close.
        self.outgoing.lock().take();
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polymcp_protocol::{JsonRpcNotification, JsonRpcRequest, RequestId};

    #[tokio::test]
    async fn frames_cross_the_pair() {
        let (client, server) = InMemoryTransport::pair();

        let request = JsonRpcMessage::Request(JsonRpcRequest::new(
            RequestId::Number(1),
            "ping",
            None,
        ));
        client.send(request.clone().into()).await.unwrap();

        let received = server.receive().await.unwrap().unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_sends() {
        let (client, _server) = InMemoryTransport::pair();
        client.close().await.unwrap();
        client.close().await.unwrap();

        let notification =
            JsonRpcMessage::Notification(JsonRpcNotification::new("notifications/initialized", None));
        assert!(matches!(
            client.send(notification.into()).await,
            Err(TransportError::Closed)
        ));
        assert!(client.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closing_one_end_ends_the_peer_receive() {
        let (client, server) = InMemoryTransport::pair();
        client.close().await.unwrap();
        assert!(server.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_wakes_a_pending_receive() {
        use std::sync::Arc;
        let (client, _server) = InMemoryTransport::pair();
        let client = Arc::new(client);

        let receiver = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.receive().await })
        };
        tokio::task::yield_now().await;
        client.close().await.unwrap();

        let received = receiver.await.unwrap().unwrap();
        assert!(received.is_none());
    }
}
