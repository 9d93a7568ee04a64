//! Who is connected and what each connection watches.
//!
//! Every socket owns an outbound mpsc queue; the registry fans frames into
//! those queues without ever blocking on a slow consumer.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::channels::Channel;

struct ConnectionEntry {
    outbox: mpsc::Sender<String>,
    subscriptions: HashSet<String>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<Uuid, ConnectionEntry>,
    channels: HashMap<String, HashSet<Uuid>>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: Uuid, outbox: mpsc::Sender<String>) {
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            id,
            ConnectionEntry {
                outbox,
                subscriptions: HashSet::new(),
            },
        );
    }

    pub async fn unregister(&self, id: Uuid) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.remove(&id) else {
            return;
        };
        for name in entry.subscriptions {
            let emptied = match inner.channels.get_mut(&name) {
                Some(subscribers) => {
                    subscribers.remove(&id);
                    subscribers.is_empty()
                }
                None => false,
            };
            if emptied {
                inner.channels.remove(&name);
            }
        }
    }

    /// Adds the subscription and enqueues the snapshot frames behind the
    /// same write lock, so no live broadcast can interleave between the
    /// snapshot and the first update. Returns false for unknown connections.
    pub async fn subscribe(&self, id: Uuid, channel: &Channel, snapshot: Vec<String>) -> bool {
        let mut inner = self.inner.write().await;
        let name = channel.name();
        let Some(entry) = inner.connections.get_mut(&id) else {
            return false;
        };
        entry.subscriptions.insert(name.clone());
        for frame in snapshot {
            // Snapshot overflow is handled the same way as live overflow.
            let _ = entry.outbox.try_send(frame);
        }
        inner.channels.entry(name).or_default().insert(id);
        true
    }

    pub async fn unsubscribe(&self, id: Uuid, channel: &Channel) -> bool {
        let mut inner = self.inner.write().await;
        let name = channel.name();
        let Some(entry) = inner.connections.get_mut(&id) else {
            return false;
        };
        let was_subscribed = entry.subscriptions.remove(&name);
        let emptied = match inner.channels.get_mut(&name) {
            Some(subscribers) => {
                subscribers.remove(&id);
                subscribers.is_empty()
            }
            None => false,
        };
        if emptied {
            inner.channels.remove(&name);
        }
        was_subscribed
    }

    /// Queues a frame for every subscriber of a channel. Full outboxes drop
    /// the frame rather than stall the caller. Returns how many connections
    /// accepted it.
    pub async fn broadcast(&self, channel: &Channel, frame: &str) -> usize {
        let inner = self.inner.read().await;
        let Some(subscribers) = inner.channels.get(&channel.name()) else {
            return 0;
        };
        let mut delivered = 0;
        for id in subscribers {
            let Some(entry) = inner.connections.get(id) else {
                continue;
            };
            match entry.outbox.try_send(frame.to_string()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(connection = %id, channel = %channel, "Dropping frame for slow consumer");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// (open connections, active subscriptions) for health reporting.
    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        let subscriptions = inner.channels.values().map(HashSet::len).sum();
        (inner.connections.len(), subscriptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_channel() -> Channel {
        Channel::parse("route:R1:FORWARD").unwrap()
    }

    async fn connected(
        registry: &ConnectionRegistry,
        capacity: usize,
    ) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(capacity);
        registry.register(id, tx).await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers_only() {
        let registry = ConnectionRegistry::new();
        let (watcher, mut watcher_rx) = connected(&registry, 8).await;
        let (_other, mut other_rx) = connected(&registry, 8).await;

        assert!(registry.subscribe(watcher, &route_channel(), Vec::new()).await);
        let delivered = registry.broadcast(&route_channel(), "frame-1").await;

        assert_eq!(delivered, 1);
        assert_eq!(watcher_rx.recv().await.unwrap(), "frame-1");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_snapshot_frames_precede_live_frames() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = connected(&registry, 8).await;

        let snapshot = vec!["snap-1".to_string(), "snap-2".to_string()];
        registry.subscribe(id, &route_channel(), snapshot).await;
        registry.broadcast(&route_channel(), "live-1").await;

        assert_eq!(rx.recv().await.unwrap(), "snap-1");
        assert_eq!(rx.recv().await.unwrap(), "snap-2");
        assert_eq!(rx.recv().await.unwrap(), "live-1");
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = connected(&registry, 8).await;

        registry.subscribe(id, &route_channel(), Vec::new()).await;
        assert!(registry.unsubscribe(id, &route_channel()).await);
        assert!(!registry.unsubscribe(id, &route_channel()).await);

        assert_eq!(registry.broadcast(&route_channel(), "frame").await, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.counts().await, (1, 0));
    }

    #[tokio::test]
    async fn test_unregister_clears_channel_membership() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connected(&registry, 8).await;

        registry.subscribe(id, &route_channel(), Vec::new()).await;
        assert_eq!(registry.counts().await, (1, 1));

        registry.unregister(id).await;
        assert_eq!(registry.counts().await, (0, 0));
        assert!(!registry.subscribe(id, &route_channel(), Vec::new()).await);
    }

    #[tokio::test]
    async fn test_slow_consumer_loses_frames_without_blocking() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = connected(&registry, 1).await;

        registry.subscribe(id, &route_channel(), Vec::new()).await;
        assert_eq!(registry.broadcast(&route_channel(), "first").await, 1);
        assert_eq!(registry.broadcast(&route_channel(), "second").await, 0);

        assert_eq!(rx.recv().await.unwrap(), "first");
        assert!(rx.try_recv().is_err());
    }
}
