//! Command data structures.
//!
//! Mirrors the command record held by the item store. The store emits
//! identifiers as strings or integers; both are normalised to `String`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Unique command identifier.
pub type CommandId = String;

/// Command lifecycle status.
///
/// `Pending` is written by the control plane only; this system moves a
/// command forward to one of the other three states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Processing => "processing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    /// Parse a status reported by a device. `pending` is not reportable.
    pub fn from_report(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(CommandStatus::Processing),
            "completed" => Some(CommandStatus::Completed),
            "failed" => Some(CommandStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target device, read only to build topic names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Device {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub id: Option<String>,
    /// MAC-style physical address.
    #[serde(default, alias = "device_mac")]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Device {
    /// Address usable in a topic, if present and non-blank.
    pub fn address(&self) -> Option<&str> {
        self.mac_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }
}

/// Command record as returned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: CommandId,
    #[serde(rename = "type", default)]
    pub command_type: String,
    /// Expanded device record. A bare foreign key or null counts as absent.
    #[serde(default, deserialize_with = "deserialize_device")]
    pub device: Option<Device>,
    #[serde(default)]
    pub params: Value,
    pub status: CommandStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(rename = "date_created", default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
}

impl Command {
    /// A pending command, mainly for tests and fixtures.
    pub fn pending(id: impl Into<CommandId>, command_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command_type: command_type.into(),
            device: None,
            params: Value::Object(Default::default()),
            status: CommandStatus::Pending,
            result: None,
            error_message: None,
            created_at: Some(Utc::now()),
            executed_at: None,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Address of the target device, if it resolves.
    pub fn device_address(&self) -> Option<&str> {
        self.device.as_ref().and_then(Device::address)
    }

    /// Body published on the device command topic.
    pub fn dispatch_payload(&self) -> Value {
        serde_json::json!({
            "command_id": self.id,
            "type": self.command_type,
            "params": self.params,
            "timestamp": self.created_at.map(|t| t.to_rfc3339()),
        })
    }
}

/// Partial update written back to the store.
///
/// Only fields that are `Some` are sent. Inner `None` writes JSON null.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CommandUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Option<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
}

impl CommandUpdate {
    /// Full overwrite of the four report fields.
    pub fn report(
        status: CommandStatus,
        result: Option<Value>,
        error_message: Option<String>,
        executed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: Some(status),
            result: Some(result),
            error_message: Some(error_message),
            executed_at: Some(executed_at),
        }
    }

    /// Terminal failure for a command that cannot be routed to a device.
    pub fn unroutable(reason: impl Into<String>) -> Self {
        Self {
            status: Some(CommandStatus::Failed),
            error_message: Some(Some(reason.into())),
            ..Default::default()
        }
    }

    /// Apply the update to an in-memory record.
    pub fn apply_to(&self, command: &mut Command) {
        if let Some(status) = self.status {
            command.status = status;
        }
        if let Some(result) = &self.result {
            command.result = result.clone();
        }
        if let Some(error) = &self.error_message {
            command.error_message = error.clone();
        }
        if let Some(at) = self.executed_at {
            command.executed_at = Some(at);
        }
    }
}

fn id_from_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `command_id` field of a JSON body, as a string or integer.
pub fn command_id_of(body: &Value) -> Option<CommandId> {
    body.get("command_id").cloned().and_then(id_from_value)
}

/// Accept a string or integer identifier.
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    id_from_value(value)
        .ok_or_else(|| serde::de::Error::custom("identifier must be a non-empty string or a number"))
}

fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(id_from_value(Value::deserialize(deserializer)?))
}

fn deserialize_device<'de, D>(deserializer: D) -> Result<Option<Device>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_from_report() {
        assert_eq!(CommandStatus::from_report("completed"), Some(CommandStatus::Completed));
        assert_eq!(CommandStatus::from_report("processing"), Some(CommandStatus::Processing));
        assert_eq!(CommandStatus::from_report("failed"), Some(CommandStatus::Failed));
        assert_eq!(CommandStatus::from_report("pending"), None);
        assert_eq!(CommandStatus::from_report("COMPLETED"), None);
    }

    #[test]
    fn test_deserialize_store_record() {
        let command: Command = serde_json::from_value(json!({
            "id": 42,
            "type": "reboot",
            "status": "pending",
            "params": {"delay": 5},
            "date_created": "2024-05-01T10:00:00Z",
            "device": {"id": 7, "mac_address": "AA:BB:CC", "name": "Pump"}
        }))
        .unwrap();

        assert_eq!(command.id, "42");
        assert_eq!(command.command_type, "reboot");
        assert_eq!(command.device_address(), Some("AA:BB:CC"));
        assert_eq!(command.device.as_ref().unwrap().id.as_deref(), Some("7"));
        assert!(command.executed_at.is_none());
    }

    #[test]
    fn test_device_reference_forms() {
        let bare: Command =
            serde_json::from_value(json!({"id": "C1", "status": "pending", "device": 7})).unwrap();
        assert!(bare.device.is_none());

        let null: Command =
            serde_json::from_value(json!({"id": "C1", "status": "pending", "device": null}))
                .unwrap();
        assert!(null.device_address().is_none());

        let legacy: Command = serde_json::from_value(
            json!({"id": "C1", "status": "pending", "device": {"device_mac": "11:22"}}),
        )
        .unwrap();
        assert_eq!(legacy.device_address(), Some("11:22"));

        let blank = Device {
            mac_address: Some("  ".into()),
            ..Default::default()
        };
        assert!(blank.address().is_none());
    }

    #[test]
    fn test_dispatch_payload_uses_creation_time() {
        let mut command = Command::pending("C2", "set_valve").with_params(json!({"open": true}));
        command.created_at = Some("2024-05-01T10:00:00Z".parse().unwrap());

        let payload = command.dispatch_payload();
        assert_eq!(payload["command_id"], "C2");
        assert_eq!(payload["type"], "set_valve");
        assert_eq!(payload["params"]["open"], true);
        assert_eq!(payload["timestamp"], "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_command_id_of() {
        assert_eq!(command_id_of(&json!({"command_id": "C9"})).as_deref(), Some("C9"));
        assert_eq!(command_id_of(&json!({"command_id": 9})).as_deref(), Some("9"));
        assert_eq!(command_id_of(&json!({"command_id": ""})), None);
        assert_eq!(command_id_of(&json!({"cmd": "on"})), None);
        assert_eq!(command_id_of(&json!([1])), None);
    }

    #[test]
    fn test_report_update_serializes_nulls() {
        let at: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().unwrap();
        let update = CommandUpdate::report(CommandStatus::Completed, None, None, at);
        let body = serde_json::to_value(&update).unwrap();

        assert_eq!(body["status"], "completed");
        assert!(body["result"].is_null());
        assert!(body.as_object().unwrap().contains_key("error_message"));
        assert_eq!(body["executed_at"], "2024-05-01T10:00:00Z");

        let unroutable = serde_json::to_value(CommandUpdate::unroutable("no device")).unwrap();
        assert_eq!(unroutable, json!({"status": "failed", "error_message": "no device"}));
    }
}
