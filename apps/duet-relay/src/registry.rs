use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::config::DEFAULT_CHANNEL_DEPTH;
use crate::telemetry::names;

/// Every live relay connection, keyed by connection id.
///
/// Broadcasting snapshots the senders first and then delivers with
/// `try_send`, so no shard guard is ever held while a frame is handed off.
#[derive(Clone)]
pub struct RelayRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    clients: DashMap<Uuid, RelayClientHandle>,
    channel_depth: usize,
    connections_total: AtomicU64,
    frames_received: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
}

/// One connected socket as seen by the broadcaster.
#[derive(Clone, Debug)]
pub struct RelayClientHandle {
    pub id: Uuid,
    sender: mpsc::Sender<Message>,
}

pub struct Registration {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<Message>,
    pub active_connections: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RelayStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub frames_received: u64,
    pub deliveries: u64,
    pub evictions: u64,
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_DEPTH)
    }
}

impl RelayRegistry {
    pub fn new(channel_depth: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                clients: DashMap::new(),
                channel_depth: channel_depth.max(1),
                connections_total: AtomicU64::new(0),
                frames_received: AtomicU64::new(0),
                deliveries: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn register(&self) -> Registration {
        let (sender, receiver) = mpsc::channel(self.inner.channel_depth);
        let id = Uuid::new_v4();
        self.inner
            .clients
            .insert(id, RelayClientHandle { id, sender });
        self.inner.connections_total.fetch_add(1, Ordering::Relaxed);

        let active_connections = self.len();
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).set(active_connections as f64);
        Registration {
            id,
            receiver,
            active_connections,
        }
    }

    /// Returns whether the connection was still registered.
    pub fn unregister(&self, id: Uuid) -> bool {
        let removed = self.inner.clients.remove(&id).is_some();
        if removed {
            gauge!(names::CONNECTIONS_ACTIVE).set(self.len() as f64);
        }
        removed
    }

    /// Hands `message` to every connection except `source`. A connection
    /// whose buffer is full or whose writer is gone is evicted.
    pub fn broadcast(&self, source: Uuid, message: Message) -> BroadcastOutcome {
        self.inner.frames_received.fetch_add(1, Ordering::Relaxed);
        counter!(names::FRAMES_RECEIVED_TOTAL).increment(1);

        let targets: Vec<RelayClientHandle> = self
            .inner
            .clients
            .iter()
            .filter(|entry| *entry.key() != source)
            .map(|entry| entry.value().clone())
            .collect();

        let mut outcome = BroadcastOutcome::default();
        for target in targets {
            match target.sender.try_send(message.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        connection_id = %target.id,
                        "outbound buffer full; evicting connection"
                    );
                    outcome.evicted += usize::from(self.evict(target.id));
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(
                        connection_id = %target.id,
                        "writer gone; evicting connection"
                    );
                    outcome.evicted += usize::from(self.evict(target.id));
                }
            }
        }

        if outcome.delivered > 0 {
            self.inner
                .deliveries
                .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
            counter!(names::DELIVERIES_TOTAL).increment(outcome.delivered as u64);
        }
        outcome
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.clients.is_empty()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            active_connections: self.len(),
            total_connections: self.inner.connections_total.load(Ordering::Relaxed),
            frames_received: self.inner.frames_received.load(Ordering::Relaxed),
            deliveries: self.inner.deliveries.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    fn evict(&self, id: Uuid) -> bool {
        if !self.unregister(id) {
            return false;
        }
        self.inner.evictions.fetch_add(1, Ordering::Relaxed);
        counter!(names::EVICTIONS_TOTAL).increment(1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::describe_relay_metrics;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn text(body: &str) -> Message {
        Message::Text(body.to_string())
    }

    #[test_timeout::tokio_timeout_test]
    async fn broadcast_skips_the_sender() {
        let registry = RelayRegistry::new(8);
        let mut a = registry.register();
        let mut b = registry.register();
        let mut c = registry.register();

        let outcome = registry.broadcast(a.id, text("hello"));
        assert_eq!(outcome, BroadcastOutcome { delivered: 2, evicted: 0 });
        assert_eq!(b.receiver.recv().await, Some(text("hello")));
        assert_eq!(c.receiver.recv().await, Some(text("hello")));
        assert!(a.receiver.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn binary_frames_are_forwarded_as_binary() {
        let registry = RelayRegistry::new(8);
        let a = registry.register();
        let mut b = registry.register();

        registry.broadcast(a.id, Message::Binary(vec![0, 159, 146, 150]));
        assert_eq!(
            b.receiver.recv().await,
            Some(Message::Binary(vec![0, 159, 146, 150]))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_receivers_are_evicted() {
        let registry = RelayRegistry::new(8);
        let a = registry.register();
        let b = registry.register();
        let mut c = registry.register();
        drop(b.receiver);

        let outcome = registry.broadcast(a.id, text("one"));
        assert_eq!(outcome, BroadcastOutcome { delivered: 1, evicted: 1 });
        assert!(!registry.contains(b.id));

        let outcome = registry.broadcast(a.id, text("two"));
        assert_eq!(outcome, BroadcastOutcome { delivered: 1, evicted: 0 });
        assert_eq!(c.receiver.recv().await, Some(text("one")));
        assert_eq!(c.receiver.recv().await, Some(text("two")));
    }

    #[test_timeout::tokio_timeout_test]
    async fn slow_receiver_is_evicted_when_full() {
        let registry = RelayRegistry::new(1);
        let a = registry.register();
        let slow = registry.register();

        registry.broadcast(a.id, text("first"));
        let outcome = registry.broadcast(a.id, text("second"));
        assert_eq!(outcome.evicted, 1);
        assert!(!registry.contains(slow.id));
        assert_eq!(registry.stats().evictions, 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stats_track_traffic() {
        let registry = RelayRegistry::new(8);
        let a = registry.register();
        let _b = registry.register();
        let _c = registry.register();
        registry.broadcast(a.id, text("x"));
        assert!(registry.unregister(a.id));
        assert!(!registry.unregister(a.id));

        assert_eq!(
            registry.stats(),
            RelayStats {
                active_connections: 2,
                total_connections: 3,
                frames_received: 1,
                deliveries: 2,
                evictions: 0,
            }
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn lone_sender_reaches_nobody() {
        let registry = RelayRegistry::new(8);
        assert!(registry.is_empty());
        let a = registry.register();
        assert!(!registry.is_empty());
        assert_eq!(registry.broadcast(a.id, text("anyone?")).delivered, 0);
    }

    #[test_timeout::timeout]
    fn counters_reach_the_prometheus_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            describe_relay_metrics();
            let registry = RelayRegistry::new(1);
            let a = registry.register();
            let _b = registry.register();
            let gone = registry.register();
            drop(gone.receiver);
            registry.broadcast(a.id, text("x"));
        });

        let rendered = handle.render();
        for line in [
            "duet_relay_connections_total 3",
            "duet_relay_frames_received_total 1",
            "duet_relay_deliveries_total 1",
            "duet_relay_evictions_total 1",
        ] {
            assert!(rendered.contains(line), "missing {line:?} in:\n{rendered}");
        }
        assert!(rendered.contains("duet_relay_connections_active"));
        assert!(rendered.contains("# HELP duet_relay_evictions_total"));
    }
}
