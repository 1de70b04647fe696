//! Single publish path for device commands.
//!
//! Both the HTTP trigger and the poll reconciler go through
//! [`CommandDispatcher::dispatch`], so validation and failure mapping live
//! here once.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use cmdlink_core::is_valid_publish_topic;
use cmdlink_transport::{Qos, Transport, TransportError};

/// Dispatch errors.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DispatchError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Broker connection unavailable")]
    TransportUnavailable,

    #[error("Publish failed: {0}")]
    PublishFailure(String),
}

impl DispatchError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DispatchError::Validation(_))
    }
}

/// A request to publish a payload on a topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DispatchRequest {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl DispatchRequest {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: Some(topic.into()),
            payload: Some(payload),
        }
    }
}

/// Successful dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchReceipt {
    pub topic: String,
    /// RFC 3339 UTC time the broker accepted the message.
    pub timestamp: String,
}

pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    qos: Qos,
}

impl CommandDispatcher {
    pub fn new(transport: Arc<dyn Transport>, qos: Qos) -> Self {
        Self { transport, qos }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Validate the request and publish it.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        let (topic, payload) = validate(request)?;

        if !self.transport.is_connected() {
            warn!(topic = %topic, "Dispatch rejected, broker not connected");
            return Err(DispatchError::TransportUnavailable);
        }

        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| DispatchError::Validation(format!("payload is not serialisable: {e}")))?;

        match self.transport.publish(&topic, bytes, self.qos).await {
            Ok(()) => {
                let timestamp = receipt_timestamp(Utc::now());
                debug!(topic = %topic, qos = self.qos.level(), "Command published");
                Ok(DispatchReceipt { topic, timestamp })
            }
            Err(TransportError::NotConnected) => Err(DispatchError::TransportUnavailable),
            Err(e) => Err(DispatchError::PublishFailure(e.to_string())),
        }
    }
}

fn validate(request: DispatchRequest) -> Result<(String, Value), DispatchError> {
    let topic = match request.topic {
        Some(topic) if !topic.trim().is_empty() => topic,
        _ => return Err(DispatchError::Validation("topic is required".to_string())),
    };
    if !is_valid_publish_topic(&topic) {
        return Err(DispatchError::Validation(format!(
            "topic '{topic}' is not a valid publish topic"
        )));
    }

    let payload = match request.payload {
        Some(Value::Null) | None => {
            return Err(DispatchError::Validation("payload is required".to_string()));
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            return Err(DispatchError::Validation("payload must not be empty".to_string()));
        }
        Some(payload) => payload,
    };

    Ok((topic, payload))
}

fn receipt_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
