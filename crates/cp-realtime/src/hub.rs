//! Subscriber registry and event fan-out.
//!
//! The hub owns nothing but opaque subscriber handles. Publishing walks a
//! snapshot of the current set; a subscriber whose send fails is dropped
//! from the set and closed, and delivery continues to everyone else. There
//! is no per-subscriber buffering — a slow consumer fails its own send and
//! evicts itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use cp_types::errors::TransportError;

/// Opaque live connection handle.
///
/// Implementations may wrap a WebSocket, a TCP socket, or an in-process
/// channel; the hub only needs byte delivery and a close hook.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn id(&self) -> Uuid;
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError>;
    async fn close(&self);
}

/// Wire envelope for every broadcast event.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn new(kind: &'static str, data: T) -> Self {
        Self { kind, data }
    }
}

/// Registry of live subscribers with fan-out publishing.
#[derive(Default)]
pub struct BroadcastHub {
    connections: RwLock<HashMap<Uuid, Arc<dyn Subscriber>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. Returns its id for later explicit disconnect.
    pub fn register(&self, subscriber: Arc<dyn Subscriber>) -> Uuid {
        let id = subscriber.id();
        self.connections.write().insert(id, subscriber);
        info!(subscriber = %id, "subscriber connected");
        id
    }

    /// Remove a subscriber explicitly. Returns whether it was present.
    pub fn unregister(&self, id: Uuid) -> bool {
        let removed = self.connections.write().remove(&id).is_some();
        if removed {
            info!(subscriber = %id, "subscriber disconnected");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Serialize once and deliver to every registered subscriber. Returns
    /// the number of successful deliveries.
    pub async fn publish<T: Serialize>(&self, envelope: &Envelope<T>) -> usize {
        let payload = match serde_json::to_vec(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(kind = envelope.kind, error = %e, "unserializable event dropped");
                return 0;
            }
        };
        self.publish_bytes(&payload).await
    }

    /// Deliver raw bytes to every registered subscriber.
    pub async fn publish_bytes(&self, payload: &[u8]) -> usize {
        // Snapshot under the lock, deliver outside it: one slow subscriber
        // must not block registration or other publishers.
        let targets: Vec<Arc<dyn Subscriber>> =
            self.connections.read().values().cloned().collect();

        let mut delivered = 0;
        let mut dead = Vec::new();

        for subscriber in targets {
            match subscriber.send(payload).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(subscriber = %subscriber.id(), error = %e, "send failed, dropping subscriber");
                    dead.push(subscriber);
                }
            }
        }

        if !dead.is_empty() {
            let mut connections = self.connections.write();
            for subscriber in &dead {
                connections.remove(&subscriber.id());
            }
        }
        for subscriber in dead {
            subscriber.close().await;
        }

        delivered
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// In-process subscriber backed by a bounded channel.
///
/// A full or closed channel is a delivery failure, which is exactly the
/// eviction signal the hub wants for slow or departed consumers.
pub struct ChannelSubscriber {
    id: Uuid,
    tx: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
}

impl ChannelSubscriber {
    /// Create a subscriber and the receiving half its consumer reads from.
    pub fn pair(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                id: Uuid::new_v4(),
                tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        self.tx
            .try_send(payload.to_vec())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::SendFailed {
                    subscriber: self.id.to_string(),
                    message: "channel full".to_string(),
                },
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let hub = BroadcastHub::new();
        let (sub_a, mut rx_a) = ChannelSubscriber::pair(8);
        let (sub_b, mut rx_b) = ChannelSubscriber::pair(8);
        let (sub_c, mut rx_c) = ChannelSubscriber::pair(8);

        hub.register(sub_a);
        hub.register(sub_b);
        hub.register(sub_c);

        let envelope = Envelope::new("price_update", json!({"ethereum": {"price": 2500.0}}));
        let delivered = hub.publish(&envelope).await;
        assert_eq!(delivered, 3);

        let expected = serde_json::to_vec(&envelope).unwrap();
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            assert_eq!(rx.try_recv().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn failed_subscriber_is_evicted_others_still_receive() {
        let hub = BroadcastHub::new();
        let (alive_a, mut rx_a) = ChannelSubscriber::pair(8);
        let (alive_b, mut rx_b) = ChannelSubscriber::pair(8);
        // Dropping the receiver makes every send fail.
        let (dead, rx_dead) = ChannelSubscriber::pair(8);
        drop(rx_dead);

        hub.register(alive_a);
        hub.register(dead);
        hub.register(alive_b);
        assert_eq!(hub.subscriber_count(), 3);

        let delivered = hub
            .publish(&Envelope::new("risk_update", json!({"aave": "high"})))
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(hub.subscriber_count(), 2);

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());

        // Subsequent publishes only reach the survivors.
        let delivered = hub
            .publish(&Envelope::new("risk_update", json!({"aave": "low"})))
            .await;
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn unregistered_subscriber_stops_receiving() {
        let hub = BroadcastHub::new();
        let (sub_a, mut rx_a) = ChannelSubscriber::pair(8);
        let (sub_b, mut rx_b) = ChannelSubscriber::pair(8);
        let id_b = sub_b.id();

        hub.register(sub_a);
        hub.register(sub_b);

        hub.publish(&Envelope::new("system_status", json!({"status": "operational"})))
            .await;
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());

        assert!(hub.unregister(id_b));
        hub.publish(&Envelope::new("system_status", json!({"status": "operational"})))
            .await;
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_consumer_evicts_itself_when_buffer_fills() {
        let hub = BroadcastHub::new();
        let (sub, _rx) = ChannelSubscriber::pair(1);
        hub.register(sub);

        // First fills the single-slot buffer, second fails and evicts.
        assert_eq!(hub.publish_bytes(b"one").await, 1);
        assert_eq!(hub.publish_bytes(b"two").await, 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn closed_subscriber_rejects_sends() {
        let (sub, mut rx) = ChannelSubscriber::pair(8);
        sub.close().await;
        assert!(sub.send(b"late").await.is_err());
        assert!(rx.try_recv().is_err());
    }
}
