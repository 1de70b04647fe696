//! Core types shared by the cmdlink crates.
//!
//! Holds the process configuration loaded from the environment and the
//! broker topic layout used between the bridge and field devices.

pub mod config;
pub mod topics;

pub use config::{
    BrokerConfig, ConfigError, DedupConfig, PollConfig, Settings, StoreConfig, defaults, env_vars,
};
pub use topics::{
    STATUS_TOPIC_PATTERN, command_topic, device_address_from_status_topic, is_valid_publish_topic,
    topic_matches,
};
