//! Broker transport for cmdlink.
//!
//! Provides:
//! - The `Transport` trait used by the dispatcher and the status consumer
//! - An MQTT implementation with automatic reconnection (`MqttTransport`)
//! - An in-process implementation for tests and local runs (`MemoryTransport`)

mod ack;
pub mod memory;
pub mod mqtt;
pub mod transport;

pub use memory::{MemoryTransport, PublishedMessage};
pub use mqtt::MqttTransport;
pub use transport::{
    ConnectionState, InboundMessage, MessageHandler, Qos, Transport, TransportError,
};
