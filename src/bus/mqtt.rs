//! MQTT bus adapter.
//!
//! Wraps a `rumqttc` client and drives its event loop on a background task.
//! Every publish is matched to the acknowledgement that completes it:
//! QoS 0 completes when the packet is written, QoS 1 on `PUBACK` and QoS 2
//! on `PUBCOMP`. Across a connection error the client keeps its pending
//! requests and replays unacknowledged packets, so waiters stay registered;
//! a publish whose ack never arrives fails after `ack_timeout_secs`. The
//! event loop reconnects after `reconnect_secs`, restoring subscriptions.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{Bus, BusMessage, Qos};
use crate::config::BusConfig;
use crate::error::{Result, TachikomaError};

type Ack = oneshot::Sender<Result<()>>;

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Publishes waiting to be written, then waiting for their ack.
#[derive(Default)]
struct AckTracker {
    queued: Mutex<VecDeque<(QoS, Ack)>>,
    inflight: Mutex<HashMap<u16, Ack>>,
}

impl AckTracker {
    fn queue(&self, qos: QoS, ack: Ack) {
        lock(&self.queued).push_back((qos, ack));
    }

    fn unqueue_last(&self) {
        lock(&self.queued).pop_back();
    }

    /// The event loop wrote a publish packet.
    ///
    /// A packet id already in flight is a replay after reconnect and leaves
    /// the queue alone; anything else is the next queued publish.
    fn written(&self, pkid: u16) {
        if pkid != 0 && lock(&self.inflight).contains_key(&pkid) {
            debug!(pkid, "Replayed unacknowledged publish");
            return;
        }
        let Some((qos, ack)) = lock(&self.queued).pop_front() else {
            debug!(pkid, "Publish written with no waiter");
            return;
        };
        if qos == QoS::AtMostOnce {
            let _ = ack.send(Ok(()));
        } else {
            lock(&self.inflight).insert(pkid, ack);
        }
    }

    fn acknowledged(&self, pkid: u16) {
        if let Some(ack) = lock(&self.inflight).remove(&pkid) {
            let _ = ack.send(Ok(()));
        }
    }

    /// Publishes still queued or awaiting an ack.
    fn pending(&self) -> usize {
        lock(&self.queued).len() + lock(&self.inflight).len()
    }

    fn fail_all(&self, reason: &str) {
        let queued: Vec<Ack> = lock(&self.queued).drain(..).map(|(_, ack)| ack).collect();
        let inflight: Vec<Ack> = lock(&self.inflight).drain().map(|(_, ack)| ack).collect();
        for ack in queued.into_iter().chain(inflight) {
            let _ = ack.send(Err(TachikomaError::Bus(reason.to_string())));
        }
    }
}

/// Wait for a publish's acknowledgement, giving up after `within`.
async fn await_ack(rx: oneshot::Receiver<Result<()>>, within: Duration) -> Result<()> {
    match tokio::time::timeout(within, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(TachikomaError::Bus(
            "connection closed before acknowledgement".into(),
        )),
        Err(_) => Err(TachikomaError::Bus(format!(
            "no acknowledgement within {}s",
            within.as_secs()
        ))),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Broker-backed [`Bus`].
pub struct MqttBus {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    filters: Arc<Mutex<Vec<(String, QoS)>>>,
    // Keeps queue order equal to the order requests reach the event loop.
    publish_lock: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
}

impl MqttBus {
    /// Connect to the configured broker.
    ///
    /// The connection is established lazily by the event loop task; inbound
    /// publishes for every subscription arrive on the returned receiver.
    pub fn connect(config: &BusConfig) -> (Self, mpsc::UnboundedReceiver<BusMessage>) {
        let mut options = MqttOptions::new(config.session_client_id(), &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::unbounded_channel();
        let acks = Arc::new(AckTracker::default());
        let filters = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(drive(
            eventloop,
            client.clone(),
            tx,
            Arc::clone(&acks),
            Arc::clone(&filters),
            config.reconnect_delay(),
        ));
        info!(host = %config.host, port = config.port, "MQTT bus started");

        let bus = Self {
            client,
            acks,
            filters,
            publish_lock: tokio::sync::Mutex::new(()),
            ack_timeout: config.ack_timeout(),
        };
        (bus, rx)
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    inbound: mpsc::UnboundedSender<BusMessage>,
    acks: Arc<AckTracker>,
    filters: Arc<Mutex<Vec<(String, QoS)>>>,
    reconnect: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BusMessage::new(&publish.topic, publish.payload.to_vec());
                if inbound.send(message).is_err() {
                    debug!("Inbound receiver dropped");
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.acknowledged(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => acks.acknowledged(comp.pkid),
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to broker");
                for (filter, qos) in lock(&filters).iter() {
                    if let Err(e) = client.try_subscribe(filter.as_str(), *qos) {
                        warn!(filter = %filter, error = %e, "Failed to restore subscription");
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.written(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                acks.fail_all("disconnected");
                info!("Disconnected from broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, pending = acks.pending(), "MQTT connection error, reconnecting");
                tokio::time::sleep(reconnect).await;
            }
        }
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let _guard = self.publish_lock.lock().await;
            self.acks.queue(qos.into(), tx);
            if let Err(e) = self.client.publish(topic, qos.into(), false, payload).await {
                self.acks.unqueue_last();
                return Err(TachikomaError::Bus(e.to_string()));
            }
        }
        await_ack(rx, self.ack_timeout).await
    }

    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<()> {
        lock(&self.filters).push((filter.to_string(), qos.into()));
        self.client
            .subscribe(filter, qos.into())
            .await
            .map_err(|e| TachikomaError::Bus(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| TachikomaError::Bus(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_qos0_completes_when_written() {
        let tracker = AckTracker::default();
        let (tx, rx) = oneshot::channel();
        tracker.queue(QoS::AtMostOnce, tx);
        tracker.written(0);
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_qos2_waits_for_pubcomp() {
        let tracker = AckTracker::default();
        let (tx, mut rx) = oneshot::channel();
        tracker.queue(QoS::ExactlyOnce, tx);
        tracker.written(7);
        assert!(rx.try_recv().is_err());
        tracker.acknowledged(7);
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fail_all_reports_errors() {
        let tracker = AckTracker::default();
        let (queued_tx, queued_rx) = oneshot::channel();
        let (inflight_tx, inflight_rx) = oneshot::channel();
        tracker.queue(QoS::AtLeastOnce, inflight_tx);
        tracker.written(3);
        tracker.queue(QoS::AtMostOnce, queued_tx);
        tracker.fail_all("connection reset");
        assert!(queued_rx.await.unwrap().is_err());
        assert!(inflight_rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_replay_does_not_consume_queued_waiter() {
        let tracker = AckTracker::default();
        let (first_tx, first_rx) = oneshot::channel();
        tracker.queue(QoS::AtLeastOnce, first_tx);
        tracker.written(5);

        // Reconnect: the unacked packet 5 is replayed before the next publish.
        let (second_tx, mut second_rx) = oneshot::channel();
        tracker.queue(QoS::AtMostOnce, second_tx);
        tracker.written(5);
        assert!(second_rx.try_recv().is_err());
        assert_eq!(tracker.pending(), 2);

        tracker.written(0);
        assert!(second_rx.await.unwrap().is_ok());
        tracker.acknowledged(5);
        assert!(first_rx.await.unwrap().is_ok());
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_waiter_written_after_reconnect_completes() {
        let tracker = AckTracker::default();
        let (inflight_tx, inflight_rx) = oneshot::channel();
        tracker.queue(QoS::ExactlyOnce, inflight_tx);
        tracker.written(9);
        let (queued_tx, queued_rx) = oneshot::channel();
        tracker.queue(QoS::AtMostOnce, queued_tx);

        // A connection error leaves both registered; the client sends the
        // queued request once the connection is back.
        assert_eq!(tracker.pending(), 2);
        tracker.written(9);
        tracker.written(0);
        assert!(queued_rx.await.unwrap().is_ok());
        tracker.acknowledged(9);
        assert!(inflight_rx.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_times_out() {
        let tracker = AckTracker::default();
        let (tx, rx) = oneshot::channel();
        tracker.queue(QoS::AtLeastOnce, tx);
        tracker.written(4);

        let err = await_ack(rx, Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, TachikomaError::Bus(m) if m == "no acknowledgement within 30s"));
    }

    #[tokio::test]
    async fn test_dropped_waiter_reports_closed() {
        let (tx, rx) = oneshot::channel::<Result<()>>();
        drop(tx);
        let err = await_ack(rx, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("connection closed"));
    }

    #[test]
    fn test_qos_conversion() {
        assert_eq!(QoS::from(Qos::AtLeastOnce), QoS::AtLeastOnce);
    }
}
