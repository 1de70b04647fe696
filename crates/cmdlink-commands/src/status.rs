//! Device status report consumer.
//!
//! Validates reports arriving on `device/+/status` and overwrites the
//! command's outcome fields. Rejected reports are logged and dropped;
//! nothing is sent back to the broker.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use async_trait::async_trait;
use cmdlink_core::device_address_from_status_topic;
use cmdlink_transport::{InboundMessage, MessageHandler};

use crate::Clock;
use crate::command::{CommandStatus, CommandUpdate, command_id_of};
use crate::store::{CommandReportSink, StoreError};

/// Report rejection reasons.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Malformed status payload: {0}")]
    MalformedPayload(String),

    #[error("Status report has no command_id")]
    MissingCommandId,

    #[error("Unknown status '{0}'")]
    UnknownStatus(String),

    #[error("Failed to apply report: {0}")]
    Store(#[from] StoreError),
}

/// A report that passed validation and was written.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedReport {
    pub command_id: String,
    pub device: Option<String>,
    pub update: CommandUpdate,
}

pub struct StatusConsumer {
    sink: Arc<dyn CommandReportSink>,
    clock: Clock,
}

impl StatusConsumer {
    pub fn new(sink: Arc<dyn CommandReportSink>) -> Self {
        Self {
            sink,
            clock: crate::system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Validate and apply one report.
    pub async fn process(&self, topic: &str, payload: &[u8]) -> Result<AppliedReport, ReportError> {
        let device = device_address_from_status_topic(topic).map(str::to_string);

        let report: Value = serde_json::from_slice(payload)
            .map_err(|e| ReportError::MalformedPayload(e.to_string()))?;
        if !report.is_object() {
            return Err(ReportError::MalformedPayload("expected a JSON object".to_string()));
        }

        let command_id = command_id_of(&report).ok_or(ReportError::MissingCommandId)?;

        let status = match report.get("status") {
            Some(Value::String(s)) => {
                CommandStatus::from_report(s).ok_or_else(|| ReportError::UnknownStatus(s.clone()))?
            }
            other => {
                let shown = other.map(Value::to_string).unwrap_or_else(|| "missing".to_string());
                return Err(ReportError::UnknownStatus(shown));
            }
        };

        let error_message = match report.get("error_message") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };
        let result = report.get("result").filter(|r| !r.is_null()).cloned();

        let update = CommandUpdate::report(status, result, error_message, (self.clock)());
        self.sink.apply_report(&command_id, &update).await?;

        Ok(AppliedReport {
            command_id,
            device,
            update,
        })
    }
}

#[async_trait]
impl MessageHandler for StatusConsumer {
    async fn handle(&self, message: InboundMessage) {
        match self.process(&message.topic, &message.payload).await {
            Ok(applied) => info!(
                command_id = %applied.command_id,
                device = applied.device.as_deref().unwrap_or("unknown"),
                status = applied.update.status.map(|s| s.as_str()).unwrap_or_default(),
                "Command status updated"
            ),
            Err(ReportError::MissingCommandId) => {
                debug!(topic = %message.topic, "Ignoring status report without command_id");
            }
            Err(e @ ReportError::Store(_)) => {
                error!(topic = %message.topic, error = %e, "Failed to store status report");
            }
            Err(e) => warn!(topic = %message.topic, error = %e, "Dropping status report"),
        }
    }
}
