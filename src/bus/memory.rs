//! In-process bus.
//!
//! A [`MemoryBroker`] routes publishes to every connected client whose
//! filters match, including the publisher itself, the way an MQTT broker
//! echoes a client's own messages back to it.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use super::{topic_matches, Bus, BusMessage, Qos};
use crate::error::{Result, TachikomaError};

struct ClientEntry {
    id: String,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// Shared in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    clients: Arc<Mutex<Vec<ClientEntry>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client and return it with its inbound receiver.
    pub fn connect(&self, client_id: &str) -> (MemoryBus, mpsc::UnboundedReceiver<BusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(ClientEntry {
            id: client_id.to_string(),
            filters: Vec::new(),
            tx,
        });
        let bus = MemoryBus {
            broker: self.clone(),
            client_id: client_id.to_string(),
        };
        (bus, rx)
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ClientEntry>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One client connection to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryBus {
    broker: MemoryBroker,
    client_id: String,
}

impl MemoryBus {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: Qos) -> Result<()> {
        let mut clients = self.broker.lock();
        if !clients.iter().any(|c| c.id == self.client_id) {
            return Err(TachikomaError::Bus(format!(
                "client '{}' is not connected",
                self.client_id
            )));
        }
        let message = BusMessage::new(topic, payload);
        // Receivers that were dropped count as disconnected.
        clients.retain(|client| {
            if client.filters.iter().any(|f| topic_matches(f, topic)) {
                client.tx.send(message.clone()).is_ok()
            } else {
                !client.tx.is_closed()
            }
        });
        debug!(topic = %topic, "Delivered in-process publish");
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: Qos) -> Result<()> {
        let mut clients = self.broker.lock();
        let client = clients
            .iter_mut()
            .find(|c| c.id == self.client_id)
            .ok_or_else(|| TachikomaError::Bus("not connected".into()))?;
        if !client.filters.iter().any(|f| f == filter) {
            client.filters.push(filter.to_string());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.broker.lock().retain(|c| c.id != self.client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let broker = MemoryBroker::new();
        let (alice, mut alice_rx) = broker.connect("alice");
        let (bob, mut bob_rx) = broker.connect("bob");
        alice.subscribe("a2a/lobby/#", Qos::AtMostOnce).await.unwrap();
        bob.subscribe("a2a/other/#", Qos::AtMostOnce).await.unwrap();

        bob.publish("a2a/lobby/bob/INFO", b"hi".to_vec(), Qos::AtMostOnce)
            .await
            .unwrap();

        let received = alice_rx.recv().await.unwrap();
        assert_eq!(received.topic, "a2a/lobby/bob/INFO");
        assert_eq!(received.payload, b"hi");
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publisher_receives_own_message() {
        let broker = MemoryBroker::new();
        let (alice, mut rx) = broker.connect("alice");
        alice.subscribe("#", Qos::AtMostOnce).await.unwrap();
        alice.publish("x/y", b"1".to_vec(), Qos::ExactlyOnce).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().topic, "x/y");
    }

    #[tokio::test]
    async fn test_disconnect_fails_publish() {
        let broker = MemoryBroker::new();
        let (alice, _rx) = broker.connect("alice");
        assert_eq!(broker.client_count(), 1);
        alice.disconnect().await.unwrap();
        assert_eq!(broker.client_count(), 0);
        assert!(alice.publish("x", Vec::new(), Qos::AtMostOnce).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let broker = MemoryBroker::new();
        let (alice, _alice_rx) = broker.connect("alice");
        let (bob, bob_rx) = broker.connect("bob");
        bob.subscribe("#", Qos::AtMostOnce).await.unwrap();
        drop(bob_rx);
        alice.publish("x", Vec::new(), Qos::AtMostOnce).await.unwrap();
        assert_eq!(broker.client_count(), 1);
    }
}
