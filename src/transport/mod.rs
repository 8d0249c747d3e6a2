//! Outbound and inbound message transports.
//!
//! The engine only sees the [`Transport`] and [`Subscriber`] traits. The message
//! broker and the pub/sub bridge are both reached through [`MqttTransport`];
//! [`MemoryTransport`] is an in-process bus with the same contract.

mod jsonl;
mod memory;
mod mqtt;
mod tls;

use std::sync::Arc;

use crate::error::RelayResult;

pub use jsonl::JsonLinesSink;
pub use memory::MemoryTransport;
pub use mqtt::{MqttSettings, MqttTransport};
pub use tls::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};

/// Callback for a subscribed topic: `(topic, payload)`.
///
/// Runs on the transport's delivery thread.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Fire-and-forget publishing. Implementations must not block on the network.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    fn publish(&self, topic: &str, payload: &[u8]) -> RelayResult<()>;
}

pub trait Subscriber: Send + Sync {
    /// Register `handler` for messages on exactly `topic`.
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> RelayResult<()>;
}
