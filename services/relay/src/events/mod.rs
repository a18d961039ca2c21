//! Event relay pipeline.
//!
//! Analytics payloads are routed by schema version: current-schema payloads
//! (>= 3) are queued for verbatim forwarding; schema 1/2 payloads go through
//! the summarizer.  Both paths are partitioned by (credential, tags header),
//! with one publisher or summarizing processor per partition.  Diagnostic
//! payloads pass straight through with the caller's own headers.

pub mod publisher;
pub mod summarizer;

use crate::metrics::MetricsSink;
use crate::store::DataStore;
use flagstream_protocol::events::InputEvent;
use flagstream_protocol::{CURRENT_EVENTS_SCHEMA_VERSION, SUMMARY_EVENTS_SCHEMA_VERSION};
use publisher::{EventPublisher, EventSender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use summarizer::{SummarizerError, SummarizingProcessor};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

/// The SDK family an event payload arrived from; selects the upstream
/// endpoint and the credential type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdkKind {
    Server,
    Mobile,
    Browser,
}

/// The environment's current credentials as used for event delivery.
/// Shared with every sender so rotation reaches queued partitions.
#[derive(Debug, Clone)]
pub struct EventAuth {
    pub sdk_key: String,
    pub mobile_key: Option<String>,
    pub environment_id: Option<String>,
}

/// Settings for one environment's event relay.
#[derive(Debug, Clone)]
pub struct EventRelayConfig {
    pub events_uri: String,
    pub flush_interval: Duration,
    pub capacity: usize,
    pub user_keys_capacity: usize,
    pub send_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PartitionKey {
    kind: SdkKind,
    /// The raw tags header value; empty string when absent.
    tags: String,
}

struct SummarizingPartition {
    processor: Arc<SummarizingProcessor>,
    /// Set on every submission; cleared (and checked) by the aging ticker.
    active: Arc<AtomicBool>,
}

// ---------------------------------------------------------------------------
// EventDispatcher
// ---------------------------------------------------------------------------

/// Per-environment event intake and delivery.
pub struct EventDispatcher {
    cfg: EventRelayConfig,
    store: Arc<dyn DataStore>,
    auth: Arc<RwLock<EventAuth>>,
    client: reqwest::Client,
    verbatim: Mutex<HashMap<PartitionKey, Arc<EventPublisher>>>,
    summarizing: Mutex<HashMap<PartitionKey, SummarizingPartition>>,
    metrics: Arc<MetricsSink>,
    shutdown: broadcast::Sender<()>,
}

impl EventDispatcher {
    pub fn new(
        cfg: EventRelayConfig,
        store: Arc<dyn DataStore>,
        auth: EventAuth,
        metrics: Arc<MetricsSink>,
    ) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.send_timeout)
            .build()
            .unwrap_or_default();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let dispatcher = Arc::new(EventDispatcher {
            cfg,
            store,
            auth: Arc::new(RwLock::new(auth)),
            client,
            verbatim: Mutex::new(HashMap::new()),
            summarizing: Mutex::new(HashMap::new()),
            metrics,
            shutdown,
        });
        tokio::spawn(aging_loop(Arc::downgrade(&dispatcher), shutdown_rx));
        dispatcher
    }

    /// Apply a credential change; used by the environment on rotation.
    /// Payloads already en route keep the credential they were sent with.
    pub fn update_auth(&self, apply: impl FnOnce(&mut EventAuth)) {
        let mut auth = self.auth.write().unwrap_or_else(|e| e.into_inner());
        apply(&mut auth);
    }

    /// Route one analytics payload.  Malformed JSON is discarded silently
    /// (legacy SDK compatibility: the HTTP layer has already answered 202).
    pub async fn submit_analytics(
        &self,
        kind: SdkKind,
        schema: u32,
        tags: Option<&str>,
        body: &[u8],
    ) {
        let values = match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(serde_json::Value::Array(values)) => values,
            _ => {
                debug!("discarding malformed event payload");
                self.metrics.events_discarded(1);
                return;
            }
        };
        self.metrics.events_received(values.len() as u64);
        let key = PartitionKey {
            kind,
            tags: tags.unwrap_or_default().to_owned(),
        };

        if schema >= SUMMARY_EVENTS_SCHEMA_VERSION {
            self.verbatim_partition(&key).await.enqueue(values);
        } else {
            let total = values.len();
            let events: Vec<InputEvent> = values
                .into_iter()
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect();
            self.metrics.events_discarded((total - events.len()) as u64);
            if events.is_empty() {
                return;
            }
            let partition = self.summarizing_partition(&key).await;
            partition.active.store(true, Ordering::SeqCst);
            if let Err(SummarizerError::Closed) = partition.processor.submit(events, schema).await {
                // Lost the race with the aging ticker; the next payload for
                // this tag recreates the partition.
                self.summarizing.lock().await.remove(&key);
            }
        }
    }

    /// Forward a diagnostic payload unchanged, with the caller's own
    /// Authorization and User-Agent.  Fire-and-forget: the HTTP layer has
    /// already answered 202.
    pub fn forward_diagnostic(
        &self,
        kind: SdkKind,
        body: Vec<u8>,
        authorization: Option<String>,
        user_agent: Option<String>,
    ) {
        let url = {
            let auth = self.auth.read().unwrap_or_else(|e| e.into_inner());
            match kind {
                SdkKind::Server => format!("{}/diagnostic", self.cfg.events_uri),
                SdkKind::Mobile => format!("{}/mobile/events/diagnostic", self.cfg.events_uri),
                SdkKind::Browser => format!(
                    "{}/events/diagnostic/{}",
                    self.cfg.events_uri,
                    auth.environment_id.as_deref().unwrap_or_default()
                ),
            }
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut request = client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
            if let Some(authorization) = authorization {
                request = request.header(reqwest::header::AUTHORIZATION, authorization);
            }
            if let Some(user_agent) = user_agent {
                request = request.header(reqwest::header::USER_AGENT, user_agent);
            }
            if let Err(e) = request.send().await {
                warn!(error = %e, "diagnostic forward failed");
            }
        });
    }

    /// Close every partition.  Used on environment teardown.
    pub async fn close(&self) {
        let _ = self.shutdown.send(());
        for publisher in self.verbatim.lock().await.values() {
            publisher.close();
        }
        for partition in self.summarizing.lock().await.values() {
            partition.processor.close();
        }
    }

    // -----------------------------------------------------------------------
    // Partition management
    // -----------------------------------------------------------------------

    async fn verbatim_partition(&self, key: &PartitionKey) -> Arc<EventPublisher> {
        let mut partitions = self.verbatim.lock().await;
        if let Some(existing) = partitions.get(key) {
            // A dead publisher (upstream 401) stays dead until restart.
            return Arc::clone(existing);
        }
        let sender = EventSender::new(
            self.client.clone(),
            self.cfg.events_uri.clone(),
            key.kind,
            Arc::clone(&self.auth),
            CURRENT_EVENTS_SCHEMA_VERSION,
            (!key.tags.is_empty()).then(|| key.tags.clone()),
        );
        let publisher = EventPublisher::new(sender, self.cfg.capacity, self.cfg.flush_interval);
        partitions.insert(key.clone(), Arc::clone(&publisher));
        publisher
    }

    async fn summarizing_partition(&self, key: &PartitionKey) -> SummarizingPartitionRef {
        let mut partitions = self.summarizing.lock().await;
        match partitions.get(key) {
            Some(existing) if !existing.processor.is_closed() => SummarizingPartitionRef {
                processor: Arc::clone(&existing.processor),
                active: Arc::clone(&existing.active),
            },
            _ => {
                let sender = EventSender::new(
                    self.client.clone(),
                    self.cfg.events_uri.clone(),
                    key.kind,
                    Arc::clone(&self.auth),
                    SUMMARY_EVENTS_SCHEMA_VERSION,
                    (!key.tags.is_empty()).then(|| key.tags.clone()),
                );
                let processor = SummarizingProcessor::new(
                    sender,
                    Arc::clone(&self.store),
                    self.cfg.flush_interval,
                    self.cfg.user_keys_capacity,
                );
                let active = Arc::new(AtomicBool::new(true));
                partitions.insert(
                    key.clone(),
                    SummarizingPartition {
                        processor: Arc::clone(&processor),
                        active: Arc::clone(&active),
                    },
                );
                SummarizingPartitionRef { processor, active }
            }
        }
    }

    /// The aging interval: long enough that a partition always survives at
    /// least one full flush cycle between ticks.
    fn aging_interval(&self) -> Duration {
        std::cmp::max(Duration::from_secs(3600), self.cfg.flush_interval * 2)
    }

    /// One aging sweep: partitions quiet since the previous tick are closed
    /// and removed; everyone else gets their active bit cleared.
    async fn sweep_idle_partitions(&self) {
        let mut partitions = self.summarizing.lock().await;
        partitions.retain(|key, partition| {
            if partition.active.swap(false, Ordering::SeqCst) {
                true
            } else {
                debug!(tags = %key.tags, "closing idle event partition");
                partition.processor.close();
                false
            }
        });
    }
}

struct SummarizingPartitionRef {
    processor: Arc<SummarizingProcessor>,
    active: Arc<AtomicBool>,
}

async fn aging_loop(dispatcher: Weak<EventDispatcher>, mut shutdown: broadcast::Receiver<()>) {
    let interval_duration = match dispatcher.upgrade() {
        Some(d) => d.aging_interval(),
        None => return,
    };
    let mut interval = tokio::time::interval(interval_duration);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.recv() => return,
        }
        match dispatcher.upgrade() {
            Some(d) => d.sweep_idle_partitions().await,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDataStore;

    fn dispatcher() -> Arc<EventDispatcher> {
        EventDispatcher::new(
            EventRelayConfig {
                events_uri: "http://events.invalid".to_owned(),
                flush_interval: Duration::from_secs(3600),
                capacity: 100,
                user_keys_capacity: 100,
                send_timeout: Duration::from_secs(10),
            },
            Arc::new(InMemoryDataStore::new()),
            EventAuth {
                sdk_key: "sdk-1".to_owned(),
                mobile_key: None,
                environment_id: Some("env-1".to_owned()),
            },
            MetricsSink::new(),
        )
    }

    #[tokio::test]
    async fn different_tags_get_separate_partitions() {
        let dispatcher = dispatcher();
        let body = br#"[{"kind":"identify","creationDate":1,"user":{"key":"u"}}]"#;

        dispatcher
            .submit_analytics(SdkKind::Server, 1, Some("A"), body)
            .await;
        dispatcher
            .submit_analytics(SdkKind::Server, 1, Some("B"), body)
            .await;
        dispatcher
            .submit_analytics(SdkKind::Server, 1, Some("A"), body)
            .await;

        assert_eq!(dispatcher.summarizing.lock().await.len(), 2);
        assert_eq!(dispatcher.metrics.snapshot().events_received, 3);
    }

    #[tokio::test]
    async fn schema_routes_verbatim_vs_summarizing() {
        let dispatcher = dispatcher();
        let body = br#"[{"kind":"identify","creationDate":1,"user":{"key":"u"}}]"#;

        dispatcher
            .submit_analytics(SdkKind::Server, 4, None, body)
            .await;
        dispatcher
            .submit_analytics(SdkKind::Server, 1, None, body)
            .await;

        assert_eq!(dispatcher.verbatim.lock().await.len(), 1);
        assert_eq!(dispatcher.summarizing.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn malformed_payloads_are_discarded_silently() {
        let dispatcher = dispatcher();
        dispatcher
            .submit_analytics(SdkKind::Server, 1, None, b"{not json")
            .await;
        dispatcher
            .submit_analytics(SdkKind::Server, 1, None, br#"{"kind":"not-an-array"}"#)
            .await;
        assert!(dispatcher.summarizing.lock().await.is_empty());
        assert!(dispatcher.verbatim.lock().await.is_empty());
        assert_eq!(dispatcher.metrics.snapshot().events_discarded, 2);
    }

    #[tokio::test]
    async fn idle_partitions_age_out_after_two_quiet_ticks() {
        let dispatcher = dispatcher();
        let body = br#"[{"kind":"identify","creationDate":1,"user":{"key":"u"}}]"#;
        dispatcher
            .submit_analytics(SdkKind::Server, 1, Some("A"), body)
            .await;

        // First sweep clears the active bit; second removes the partition.
        dispatcher.sweep_idle_partitions().await;
        assert_eq!(dispatcher.summarizing.lock().await.len(), 1);
        dispatcher.sweep_idle_partitions().await;
        assert!(dispatcher.summarizing.lock().await.is_empty());

        // The next event for that tag recreates the partition lazily.
        dispatcher
            .submit_analytics(SdkKind::Server, 1, Some("A"), body)
            .await;
        assert_eq!(dispatcher.summarizing.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn activity_between_ticks_keeps_the_partition() {
        let dispatcher = dispatcher();
        let body = br#"[{"kind":"identify","creationDate":1,"user":{"key":"u"}}]"#;
        dispatcher
            .submit_analytics(SdkKind::Server, 1, Some("A"), body)
            .await;

        dispatcher.sweep_idle_partitions().await;
        dispatcher
            .submit_analytics(SdkKind::Server, 1, Some("A"), body)
            .await;
        dispatcher.sweep_idle_partitions().await;
        assert_eq!(dispatcher.summarizing.lock().await.len(), 1);
    }
}
