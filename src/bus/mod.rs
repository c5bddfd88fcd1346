//! Bus module - Publish/subscribe transport
//!
//! Agents coordinate only through bus messages. The [`Bus`] trait is the
//! narrow capability the run loop and tools are given:
//!
//! - `publish` resolves when the transport acknowledges delivery, so a
//!   caller awaiting it is the delivery callback
//! - `subscribe` takes MQTT-style filters (`+` one level, `#` the rest)
//! - inbound messages arrive on the receiver returned when connecting
//!
//! Two adapters exist: [`MemoryBroker`] for in-process use and tests, and
//! `MqttBus` (feature `mqtt`) for a real broker.

pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use memory::{MemoryBroker, MemoryBus};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttBus;

use async_trait::async_trait;
use std::fmt;

use crate::error::{Result, TachikomaError};

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    /// Best effort; used for ordinary chat turns.
    #[default]
    AtMostOnce,
    AtLeastOnce,
    /// Guaranteed; used for join/leave announcements.
    ExactlyOnce,
}

impl Qos {
    pub fn from_level(level: u8) -> Result<Self> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(TachikomaError::Config(format!("invalid QoS level {}", other))),
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.into(),
        }
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.topic, String::from_utf8_lossy(&self.payload))
    }
}

/// Topic-addressed publish/subscribe transport.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish and wait for the delivery acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`TachikomaError::Bus`] if the message could not be handed to
    /// the transport or the acknowledgement never arrived.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<()>;

    /// Leave the transport. Further publishes fail.
    async fn disconnect(&self) -> Result<()>;
}

/// MQTT topic-filter matching.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
