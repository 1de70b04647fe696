//! Transport abstraction shared by all broker implementations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Transport error types.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Timed out waiting for broker acknowledgement")]
    Timeout,

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

/// MQTT QoS level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum Qos {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl Qos {
    /// QoS from its numeric level.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for Qos {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => Qos::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => Qos::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => Qos::ExactlyOnce,
        }
    }
}

/// Broker session state.
///
/// Transitions: `Disconnected -> Connecting` when a connection attempt starts,
/// `Connecting -> Connected` on CONNACK, any state `-> Disconnected` on a
/// network error or an explicit disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message received from the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: Qos::AtLeastOnce,
            retain: false,
            received_at: Utc::now(),
        }
    }
}

/// Handler invoked once per inbound message matching its subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage);
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Current session state.
    fn connection_state(&self) -> ConnectionState;

    /// Receiver notified on every state transition.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Publish a message.
    ///
    /// Fails with `NotConnected` without attempting delivery when the
    /// session is not established.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), TransportError>;

    /// Register a handler for every message matching `pattern`.
    ///
    /// Subscriptions survive reconnects.
    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError>;
}
