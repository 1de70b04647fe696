//! In-process transport for tests and local wiring.
//!
//! Publishes are recorded instead of sent. `deliver()` routes a message to
//! matching subscribers and awaits them, so tests observe handler effects
//! deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmdlink_core::topic_matches;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::transport::{
    ConnectionState, InboundMessage, MessageHandler, Qos, Transport, TransportError,
};

/// A message accepted by [`MemoryTransport::publish`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub published_at: DateTime<Utc>,
}

impl PublishedMessage {
    /// Payload parsed as JSON, if it is JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

pub struct MemoryTransport {
    state_tx: watch::Sender<ConnectionState>,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: RwLock<Vec<(String, Arc<dyn MessageHandler>)>>,
    attempts: AtomicUsize,
    fail_next: Mutex<Option<TransportError>>,
}

impl MemoryTransport {
    /// A transport that starts out connected.
    pub fn new() -> Self {
        Self::with_state(ConnectionState::Connected)
    }

    pub fn with_state(state: ConnectionState) -> Self {
        let (state_tx, _) = watch::channel(state);
        Self {
            state_tx,
            published: Mutex::new(Vec::new()),
            subscriptions: RwLock::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Make the next connected publish fail with `error`.
    pub fn fail_next_publish(&self, error: TransportError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Messages accepted so far, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of publish calls made while connected, including failed ones.
    pub fn publish_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }

    /// Route a message to every matching subscriber and wait for them.
    /// Returns the number of handlers invoked.
    pub async fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let message = InboundMessage::new(topic, payload);
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .subscriptions
            .read()
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, topic))
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in &handlers {
            handler.handle(message.clone()).await;
        }
        handlers.len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }

        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            published_at: Utc::now(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        self.subscriptions
            .write()
            .push((pattern.to_string(), handler));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disconnected_publish_is_not_attempted() {
        let transport = MemoryTransport::with_state(ConnectionState::Disconnected);
        let err = transport
            .publish("device/AA/commands", b"{}".to_vec(), Qos::AtLeastOnce)
            .await
            .unwrap_err();

        assert_eq!(err, TransportError::NotConnected);
        assert_eq!(transport.publish_attempts(), 0);
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_fail_next_publish() {
        let transport = MemoryTransport::new();
        transport.fail_next_publish(TransportError::Timeout);

        let first = transport
            .publish("a/b", b"1".to_vec(), Qos::AtLeastOnce)
            .await;
        let second = transport
            .publish("a/b", b"2".to_vec(), Qos::AtLeastOnce)
            .await;

        assert_eq!(first, Err(TransportError::Timeout));
        assert_eq!(second, Ok(()));
        assert_eq!(transport.publish_attempts(), 2);
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn test_state_watch() {
        let transport = MemoryTransport::new();
        let mut rx = transport.watch_state();
        transport.set_state(ConnectionState::Disconnected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Disconnected);
    }
}
