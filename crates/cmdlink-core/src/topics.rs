//! Broker topic layout.
//!
//! Commands go out on `device/{address}/commands`, outcomes come back on
//! `device/{address}/status`.

/// Subscription pattern for device status reports.
pub const STATUS_TOPIC_PATTERN: &str = "device/+/status";

/// Command topic for a device address.
pub fn command_topic(address: &str) -> String {
    format!("device/{}/commands", address)
}

/// Extract the device address from a `device/{address}/status` topic.
pub fn device_address_from_status_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("device"), Some(address), Some("status"), None) if !address.is_empty() => {
            Some(address)
        }
        _ => None,
    }
}

/// Whether a topic may be used as a publish target.
pub fn is_valid_publish_topic(topic: &str) -> bool {
    !topic.trim().is_empty() && !topic.contains(['+', '#', '\0'])
}

/// Match a concrete topic against a subscription pattern with `+` and `#` wildcards.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
