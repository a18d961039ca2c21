//! Internal metrics surface.
//!
//! The relay counts connections and event throughput per environment and
//! publishes change notifications on a broadcast channel.  Exporters (out
//! of scope here) subscribe to the channel or poll [`MetricsSink::snapshot`];
//! no exporter wire format is defined in this crate.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Connection gauge labels, one per stream dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLabel {
    ServerAll,
    ServerFlags,
    ClientPing,
    ClientEval,
}

/// One metrics change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsEvent {
    ConnectionOpened(StreamLabel),
    ConnectionClosed(StreamLabel),
    EventsReceived(u64),
    EventsDiscarded(u64),
}

/// Point-in-time counter values, as served on the status resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub server_connections: i64,
    pub client_connections: i64,
    pub events_received: u64,
    pub events_discarded: u64,
}

/// Per-environment counters plus the metrics-events channel.
pub struct MetricsSink {
    server_connections: AtomicI64,
    client_connections: AtomicI64,
    events_received: AtomicU64,
    events_discarded: AtomicU64,
    events_tx: broadcast::Sender<MetricsEvent>,
}

impl MetricsSink {
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(MetricsSink {
            server_connections: AtomicI64::new(0),
            client_connections: AtomicI64::new(0),
            events_received: AtomicU64::new(0),
            events_discarded: AtomicU64::new(0),
            events_tx,
        })
    }

    /// Subscribe to change notifications (one subscriber per exporter).
    pub fn subscribe(&self) -> broadcast::Receiver<MetricsEvent> {
        self.events_tx.subscribe()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            server_connections: self.server_connections.load(Ordering::Relaxed),
            client_connections: self.client_connections.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
        }
    }

    fn gauge(&self, label: StreamLabel) -> &AtomicI64 {
        match label {
            StreamLabel::ServerAll | StreamLabel::ServerFlags => &self.server_connections,
            StreamLabel::ClientPing | StreamLabel::ClientEval => &self.client_connections,
        }
    }

    /// Record a new subscription and return a guard that closes it out.
    /// The guard pattern means abrupt client disconnects (the stream is
    /// just dropped) still decrement the gauge.
    pub fn connection_opened(self: &Arc<Self>, label: StreamLabel) -> ConnectionGuard {
        self.gauge(label).fetch_add(1, Ordering::Relaxed);
        let _ = self.events_tx.send(MetricsEvent::ConnectionOpened(label));
        ConnectionGuard {
            sink: Arc::clone(self),
            label,
        }
    }

    pub fn events_received(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.events_received.fetch_add(count, Ordering::Relaxed);
        let _ = self.events_tx.send(MetricsEvent::EventsReceived(count));
    }

    pub fn events_discarded(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.events_discarded.fetch_add(count, Ordering::Relaxed);
        let _ = self.events_tx.send(MetricsEvent::EventsDiscarded(count));
    }
}

/// Decrements the owning gauge when dropped.
pub struct ConnectionGuard {
    sink: Arc<MetricsSink>,
    label: StreamLabel,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.sink.gauge(self.label).fetch_sub(1, Ordering::Relaxed);
        let _ = self
            .sink
            .events_tx
            .send(MetricsEvent::ConnectionClosed(self.label));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_guard_balances_the_gauge() {
        let sink = MetricsSink::new();
        let guard_a = sink.connection_opened(StreamLabel::ServerAll);
        let guard_b = sink.connection_opened(StreamLabel::ClientPing);
        assert_eq!(sink.snapshot().server_connections, 1);
        assert_eq!(sink.snapshot().client_connections, 1);

        drop(guard_a);
        drop(guard_b);
        assert_eq!(sink.snapshot().server_connections, 0);
        assert_eq!(sink.snapshot().client_connections, 0);
    }

    #[tokio::test]
    async fn counter_changes_publish_to_subscribers() {
        let sink = MetricsSink::new();
        let mut rx = sink.subscribe();

        let guard = sink.connection_opened(StreamLabel::ServerFlags);
        sink.events_received(3);
        sink.events_discarded(1);
        drop(guard);

        assert_eq!(
            rx.recv().await.unwrap(),
            MetricsEvent::ConnectionOpened(StreamLabel::ServerFlags)
        );
        assert_eq!(rx.recv().await.unwrap(), MetricsEvent::EventsReceived(3));
        assert_eq!(rx.recv().await.unwrap(), MetricsEvent::EventsDiscarded(1));
        assert_eq!(
            rx.recv().await.unwrap(),
            MetricsEvent::ConnectionClosed(StreamLabel::ServerFlags)
        );
    }

    #[tokio::test]
    async fn zero_counts_are_not_published() {
        let sink = MetricsSink::new();
        let mut rx = sink.subscribe();
        sink.events_received(0);
        sink.events_discarded(0);
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(sink.snapshot().events_received, 0);
    }
}
