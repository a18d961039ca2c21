//! Legacy event summarization.
//!
//! Schema 1/2 payloads are translated into the current schema and fed to a
//! summarizing processor that aggregates per-flag counters per flush
//! window, deduplicates users into `index` events through a bounded
//! recently-seen set, and periodically flushes.
//!
//! # Feature-event translation
//! 1. schema 1 without a version: passed through as-is, no flag lookup.
//! 2. schema 1 with a version, or schema 2 without inline trackEvents /
//!    debugEventsUntilDate: the flag is looked up and its trackEvents and
//!    debugEventsUntilDate are copied in; schema 1 events without an
//!    explicit variation get one inferred by equality search over the
//!    flag's variations.
//! 3. schema 2 with inline trackEvents or debugEventsUntilDate: the event
//!    values are respected, no lookup.

use super::publisher::{EventSender, SendOutcome};
use crate::store::DataStore;
use flagstream_core::model::{DataKind, StoreItem};
use flagstream_protocol::events::{
    FeatureEvent, FlagCounter, FlagSummary, IndexEvent, InputEvent, OutputEvent, SummaryEvent,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    /// Close is terminal; the dispatcher recreates the partition instead.
    #[error("summarizing processor is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Bounded recently-seen user keys
// ---------------------------------------------------------------------------

/// Insertion-ordered set with a hard capacity: the oldest key is evicted to
/// admit a new one, so long-lived partitions re-index users occasionally
/// instead of growing without bound.
struct SeenUsers {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenUsers {
    fn new(capacity: usize) -> Self {
        SeenUsers {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns true when the key was not already present.
    fn insert(&mut self, key: &str) -> bool {
        if self.set.contains(key) {
            return false;
        }
        if self.set.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.set.insert(key.to_owned());
        self.order.push_back(key.to_owned());
        true
    }
}

// ---------------------------------------------------------------------------
// Summary accumulation
// ---------------------------------------------------------------------------

#[derive(PartialEq, Eq, Hash)]
struct CounterKey {
    variation: Option<usize>,
    version: Option<u64>,
    unknown: bool,
}

struct CounterState {
    value: serde_json::Value,
    count: u64,
}

#[derive(Default)]
struct FlagSummaryState {
    default: serde_json::Value,
    counters: HashMap<CounterKey, CounterState>,
}

#[derive(Default)]
struct ProcessorState {
    buffer: Vec<OutputEvent>,
    features: HashMap<String, FlagSummaryState>,
    start_date: u64,
    end_date: u64,
}

impl ProcessorState {
    fn note_dates(&mut self, creation_date: u64) {
        if self.start_date == 0 || creation_date < self.start_date {
            self.start_date = creation_date;
        }
        if creation_date > self.end_date {
            self.end_date = creation_date;
        }
    }

    fn count_feature(&mut self, event: &FeatureEvent, unknown: bool) {
        self.note_dates(event.creation_date);
        let entry = self.features.entry(event.key.clone()).or_default();
        if entry.default.is_null() {
            entry.default = event.default.clone();
        }
        let counter = entry
            .counters
            .entry(CounterKey {
                variation: event.variation,
                version: event.version,
                unknown,
            })
            .or_insert_with(|| CounterState {
                value: event.value.clone(),
                count: 0,
            });
        counter.count += 1;
    }

    /// Drain everything accumulated since the last flush into one payload.
    fn drain(&mut self) -> Vec<serde_json::Value> {
        let mut events = std::mem::take(&mut self.buffer);
        let features = std::mem::take(&mut self.features);
        if !features.is_empty() {
            let summary = SummaryEvent {
                start_date: self.start_date,
                end_date: self.end_date,
                features: features
                    .into_iter()
                    .map(|(key, state)| {
                        (
                            key,
                            FlagSummary {
                                default: state.default,
                                counters: state
                                    .counters
                                    .into_iter()
                                    .map(|(k, v)| FlagCounter {
                                        value: v.value,
                                        variation: k.variation,
                                        version: k.version,
                                        unknown: k.unknown.then_some(true),
                                        count: v.count,
                                    })
                                    .collect(),
                            },
                        )
                    })
                    .collect(),
            };
            events.push(OutputEvent::Summary(summary));
        }
        self.start_date = 0;
        self.end_date = 0;
        events
            .into_iter()
            .filter_map(|event| serde_json::to_value(event).ok())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// SummarizingProcessor
// ---------------------------------------------------------------------------

/// One summarizing processor per (credential, tag) partition.
pub struct SummarizingProcessor {
    state: Mutex<ProcessorState>,
    seen_users: Mutex<SeenUsers>,
    store: Arc<dyn DataStore>,
    closed: Arc<AtomicBool>,
    shutdown: broadcast::Sender<()>,
}

impl SummarizingProcessor {
    pub fn new(
        sender: EventSender,
        store: Arc<dyn DataStore>,
        flush_interval: Duration,
        user_keys_capacity: usize,
    ) -> Arc<Self> {
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let processor = Arc::new(SummarizingProcessor {
            state: Mutex::new(ProcessorState::default()),
            seen_users: Mutex::new(SeenUsers::new(user_keys_capacity)),
            store,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown,
        });
        tokio::spawn(flush_loop(
            Arc::clone(&processor),
            sender,
            flush_interval,
            shutdown_rx,
        ));
        processor
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close is terminal: later submissions return [`SummarizerError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    /// Translate and record a batch of legacy events.
    pub async fn submit(&self, events: Vec<InputEvent>, schema: u32) -> Result<(), SummarizerError> {
        if self.is_closed() {
            return Err(SummarizerError::Closed);
        }
        for event in events {
            match event {
                InputEvent::Feature(feature) => self.record_feature(feature, schema).await,
                InputEvent::Identify(identify) => {
                    if let Some(user) = &identify.user {
                        // Identify itself carries the user; just mark it seen.
                        self.seen_users
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(&user.key);
                    }
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.note_dates(identify.creation_date);
                    state.buffer.push(OutputEvent::Identify(identify));
                }
                InputEvent::Custom(mut custom) => {
                    let index = custom.user.take().and_then(|user| {
                        custom.user_key = Some(user.key.clone());
                        self.index_for(custom.creation_date, user)
                    });
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.note_dates(custom.creation_date);
                    if let Some(index) = index {
                        state.buffer.push(index);
                    }
                    state.buffer.push(OutputEvent::Custom(custom));
                }
                InputEvent::Alias(alias) => {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.note_dates(alias.creation_date);
                    state.buffer.push(OutputEvent::Alias(alias));
                }
            }
        }
        Ok(())
    }

    async fn record_feature(&self, mut event: FeatureEvent, schema: u32) {
        // Oldest SDKs (schema 1, no version) get their events forwarded
        // untouched: no lookup, no user extraction, no summarization.
        if schema <= 1 && event.version.is_none() {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.note_dates(event.creation_date);
            state.buffer.push(OutputEvent::Feature(event));
            return;
        }

        let needs_lookup = schema <= 1
            || (schema == 2
                && event.track_events.is_none()
                && event.debug_events_until_date.is_none());

        let mut unknown = false;
        if needs_lookup {
            match self.store.get(DataKind::Flags, &event.key).await {
                Some(StoreItem::Flag(flag)) => {
                    event.track_events = flag.track_events;
                    event.debug_events_until_date = flag.debug_events_until_date;
                    if schema <= 1 && event.variation.is_none() {
                        event.variation =
                            flag.variations.iter().position(|v| v == &event.value);
                    }
                }
                _ => unknown = true,
            }
        }

        let index = event.user.take().and_then(|user| {
            event.user_key = Some(user.key.clone());
            self.index_for(event.creation_date, user)
        });

        let forward = event.track_events == Some(true)
            || event
                .debug_events_until_date
                .is_some_and(|until| until > now_millis());

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(index) = index {
            state.buffer.push(index);
        }
        state.count_feature(&event, unknown);
        if forward {
            state.buffer.push(OutputEvent::Feature(event));
        }
    }

    fn index_for(&self, creation_date: u64, user: flagstream_core::user::User) -> Option<OutputEvent> {
        let first_sighting = self
            .seen_users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(&user.key);
        first_sighting.then(|| {
            OutputEvent::Index(IndexEvent {
                creation_date,
                user,
            })
        })
    }

    /// Drain the pending payload.  Public to the events module so the flush
    /// loop (and tests) can drive delivery.
    pub(super) fn drain_payload(&self) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
    }
}

async fn flush_loop(
    processor: Arc<SummarizingProcessor>,
    sender: EventSender,
    flush_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        let closing = tokio::select! {
            _ = interval.tick() => false,
            _ = shutdown.recv() => true,
        };

        let payload = processor.drain_payload();
        if !payload.is_empty() {
            if sender.send(&payload).await == SendOutcome::MustShutDown {
                processor.closed.store(true, Ordering::SeqCst);
                return;
            }
        }
        if closing {
            debug!("summarizing processor closed");
            return;
        }
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventAuth, SdkKind};
    use crate::store::InMemoryDataStore;
    use flagstream_core::model::{AllData, FeatureFlag, VariationOrRollout};
    use serde_json::json;

    fn sender() -> EventSender {
        EventSender::new(
            reqwest::Client::new(),
            "http://events.invalid".to_owned(),
            SdkKind::Server,
            Arc::new(std::sync::RwLock::new(EventAuth {
                sdk_key: "sdk-1".to_owned(),
                mobile_key: None,
                environment_id: None,
            })),
            flagstream_protocol::SUMMARY_EVENTS_SCHEMA_VERSION,
            None,
        )
    }

    async fn store_with_flag(track_events: bool) -> Arc<dyn DataStore> {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let mut data = AllData::default();
        data.flags.insert(
            "f".to_owned(),
            FeatureFlag {
                key: "f".to_owned(),
                version: 11,
                on: true,
                salt: String::new(),
                prerequisites: Vec::new(),
                targets: Vec::new(),
                rules: Vec::new(),
                fallthrough: VariationOrRollout::default(),
                off_variation: None,
                variations: vec![json!("a"), json!("b")],
                track_events: Some(track_events),
                debug_events_until_date: None,
                deleted: false,
            },
        );
        store.init(data).await.unwrap();
        store
    }

    fn parse(body: &str) -> Vec<InputEvent> {
        let values: Vec<serde_json::Value> = serde_json::from_str(body).unwrap();
        values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect()
    }

    #[tokio::test]
    async fn schema1_event_gains_index_feature_and_summary() {
        let store = store_with_flag(true).await;
        let processor = SummarizingProcessor::new(
            sender(),
            store,
            Duration::from_secs(600),
            100,
        );

        let events = parse(
            r#"[{"kind":"feature","creationDate":1000,"key":"f","version":11,"user":{"key":"u"},"value":"a"}]"#,
        );
        processor.submit(events, 1).await.unwrap();

        let payload = processor.drain_payload();
        assert_eq!(payload.len(), 3);
        assert_eq!(payload[0]["kind"], "index");
        assert_eq!(payload[0]["user"]["key"], "u");
        assert_eq!(payload[1]["kind"], "feature");
        assert_eq!(payload[1]["trackEvents"], true);
        assert_eq!(payload[1]["variation"], 0);
        assert_eq!(payload[1]["userKey"], "u");
        assert!(payload[1].get("user").is_none());
        assert_eq!(payload[2]["kind"], "summary");
        assert_eq!(payload[2]["features"]["f"]["counters"][0]["count"], 1);
        assert_eq!(payload[2]["features"]["f"]["counters"][0]["version"], 11);
    }

    #[tokio::test]
    async fn schema1_without_version_passes_through_untouched() {
        let store = store_with_flag(true).await;
        let processor = SummarizingProcessor::new(
            sender(),
            store,
            Duration::from_secs(600),
            100,
        );

        let events = parse(
            r#"[{"kind":"feature","creationDate":1000,"key":"f","user":{"key":"u"},"value":"a"}]"#,
        );
        processor.submit(events, 1).await.unwrap();

        let payload = processor.drain_payload();
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0]["kind"], "feature");
        // Untouched: the user object stays embedded and nothing was copied
        // in from the store.
        assert_eq!(payload[0]["user"]["key"], "u");
        assert!(payload[0].get("trackEvents").is_none());
        assert!(payload[0].get("variation").is_none());
    }

    #[tokio::test]
    async fn untracked_flags_summarize_without_full_feature_events() {
        let store = store_with_flag(false).await;
        let processor = SummarizingProcessor::new(
            sender(),
            store,
            Duration::from_secs(600),
            100,
        );

        let events = parse(
            r#"[{"kind":"feature","creationDate":1000,"key":"f","version":11,"user":{"key":"u"},"value":"b"}]"#,
        );
        processor.submit(events, 1).await.unwrap();

        let payload = processor.drain_payload();
        // Index and summary only; the feature event itself is not forwarded.
        assert_eq!(payload.len(), 2);
        assert_eq!(payload[0]["kind"], "index");
        assert_eq!(payload[1]["kind"], "summary");
        assert_eq!(payload[1]["features"]["f"]["counters"][0]["variation"], 1);
    }

    #[tokio::test]
    async fn schema2_inline_track_events_skips_the_lookup() {
        // Flag intentionally absent from the store.
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let processor = SummarizingProcessor::new(
            sender(),
            store,
            Duration::from_secs(600),
            100,
        );

        let events = parse(
            r#"[{"kind":"feature","creationDate":1000,"key":"g","variation":1,"version":2,"user":{"key":"u"},"value":true,"trackEvents":true}]"#,
        );
        processor.submit(events, 2).await.unwrap();

        let payload = processor.drain_payload();
        let feature = payload
            .iter()
            .find(|e| e["kind"] == "feature")
            .expect("feature event forwarded");
        assert_eq!(feature["trackEvents"], true);
        let summary = payload.iter().find(|e| e["kind"] == "summary").unwrap();
        assert!(summary["features"]["g"]["counters"][0]
            .get("unknown")
            .is_none());
    }

    #[tokio::test]
    async fn unknown_flag_lookup_marks_the_counter() {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let processor = SummarizingProcessor::new(
            sender(),
            store,
            Duration::from_secs(600),
            100,
        );

        let events = parse(
            r#"[{"kind":"feature","creationDate":1000,"key":"missing","version":4,"user":{"key":"u"},"value":1}]"#,
        );
        processor.submit(events, 1).await.unwrap();

        let payload = processor.drain_payload();
        let summary = payload.iter().find(|e| e["kind"] == "summary").unwrap();
        assert_eq!(
            summary["features"]["missing"]["counters"][0]["unknown"],
            true
        );
    }

    #[tokio::test]
    async fn repeated_users_index_once_per_window() {
        let store = store_with_flag(false).await;
        let processor = SummarizingProcessor::new(
            sender(),
            store,
            Duration::from_secs(600),
            100,
        );

        let events = parse(
            r#"[
                {"kind":"feature","creationDate":1,"key":"f","version":11,"user":{"key":"u"},"value":"a"},
                {"kind":"feature","creationDate":2,"key":"f","version":11,"user":{"key":"u"},"value":"a"}
            ]"#,
        );
        processor.submit(events, 1).await.unwrap();

        let payload = processor.drain_payload();
        let index_count = payload.iter().filter(|e| e["kind"] == "index").count();
        assert_eq!(index_count, 1);
        let summary = payload.iter().find(|e| e["kind"] == "summary").unwrap();
        assert_eq!(summary["features"]["f"]["counters"][0]["count"], 2);
        assert_eq!(summary["startDate"], 1);
        assert_eq!(summary["endDate"], 2);
    }

    #[tokio::test]
    async fn seen_users_set_is_bounded() {
        let mut seen = SeenUsers::new(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c")); // evicts "a"
        assert!(seen.insert("a")); // re-admitted after eviction
        assert!(!seen.insert("c"));
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let processor = SummarizingProcessor::new(
            sender(),
            store,
            Duration::from_secs(600),
            100,
        );
        processor.close();
        let result = processor
            .submit(
                parse(r#"[{"kind":"identify","creationDate":1,"user":{"key":"u"}}]"#),
                2,
            )
            .await;
        assert!(matches!(result, Err(SummarizerError::Closed)));
    }
}
