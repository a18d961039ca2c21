//! Read-through caching adapter over a persistent backend.
//!
//! # TTL modes
//! - Finite TTL: entries expire and are re-fetched; on backend read errors
//!   the stale entry is served; write errors are surfaced and not cached.
//! - Infinite TTL (`Duration::ZERO`): the cache always hides the backend on
//!   read, and is updated even when a backend write fails, so clients keep
//!   seeing a coherent dataset through an outage.  On recovery the backend
//!   is re-initialized from the cache.
//!
//! # Single flight
//! Concurrent cache misses for the same key (or the same kind, for
//! `get_all`) coalesce into one backend call.

use super::persistent::{PersistentDataStore, StoreStatus};
use super::{DataStore, StoreError, StoreUpdate, UpsertOutcome, UPDATE_CHANNEL_CAPACITY};
use flagstream_core::model::{AllData, DataKind, StoreItem};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How often the backend's health probe runs while unavailable.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Cache state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedItem {
    /// `None` caches a confirmed absence.
    item: Option<StoreItem>,
    fetched: Instant,
}

#[derive(Debug, Clone)]
struct CachedAll {
    items: HashMap<String, StoreItem>,
    fetched: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    items: HashMap<(DataKind, String), CachedItem>,
    all: HashMap<DataKind, CachedAll>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FlightKey {
    Item(DataKind, String),
    All(DataKind),
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// A [`DataStore`] that mirrors writes to a persistent backend and serves
/// reads through a TTL cache.
pub struct PersistentStoreAdapter {
    backend: Arc<dyn PersistentDataStore>,
    /// `Duration::ZERO` means infinite.
    ttl: Duration,
    cache: RwLock<CacheState>,
    flights: Mutex<HashMap<FlightKey, Arc<Mutex<()>>>>,
    initialized: AtomicBool,
    updates: broadcast::Sender<StoreUpdate>,
    status_tx: watch::Sender<StoreStatus>,
    poller_running: AtomicBool,
}

impl PersistentStoreAdapter {
    pub fn new(backend: Arc<dyn PersistentDataStore>, ttl: Duration) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let (status_tx, _) = watch::channel(StoreStatus::Available);
        let adapter = Arc::new(PersistentStoreAdapter {
            backend,
            ttl,
            cache: RwLock::new(CacheState::default()),
            flights: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            updates,
            status_tx,
            poller_running: AtomicBool::new(false),
        });

        // A warm backend (shared with other relay instances) may already
        // hold a full dataset; pick that up without waiting for upstream.
        let startup = Arc::clone(&adapter);
        tokio::spawn(async move {
            if let Ok(true) = startup.backend.initialized().await {
                startup.initialized.store(true, Ordering::SeqCst);
            }
        });

        adapter
    }

    pub fn infinite_ttl(&self) -> bool {
        self.ttl.is_zero()
    }

    /// Current backend availability; subscribers observe transitions.
    pub fn status(&self) -> watch::Receiver<StoreStatus> {
        self.status_tx.subscribe()
    }

    fn fresh(&self, fetched: Instant) -> bool {
        self.infinite_ttl() || fetched.elapsed() < self.ttl
    }

    fn mark_available(&self) {
        self.status_tx.send_if_modified(|status| {
            let changed = *status != StoreStatus::Available;
            *status = StoreStatus::Available;
            changed
        });
    }

    fn mark_unavailable(self: &Arc<Self>) {
        let changed = self.status_tx.send_if_modified(|status| {
            let changed = *status != StoreStatus::Unavailable;
            *status = StoreStatus::Unavailable;
            changed
        });
        if changed {
            warn!("persistent store unavailable; serving from cache");
        }
        if !self.poller_running.swap(true, Ordering::SeqCst) {
            let adapter = Arc::clone(self);
            tokio::spawn(async move { adapter.poll_until_recovered().await });
        }
    }

    /// Probe the backend until it answers, then (in infinite-TTL mode)
    /// restore it from the cache before reporting recovery.
    async fn poll_until_recovered(self: Arc<Self>) {
        loop {
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
            if self.backend.ping().await.is_err() {
                continue;
            }
            if self.infinite_ttl() {
                let data = self.cache_as_all_data();
                if let Err(e) = self.backend.init(data).await {
                    error!(error = %e, "failed to re-initialize recovered store from cache");
                    continue;
                }
                info!("persistent store recovered; re-initialized from cache");
            } else {
                info!("persistent store recovered");
            }
            self.poller_running.store(false, Ordering::SeqCst);
            self.mark_available();
            return;
        }
    }

    /// Rebuild a full dataset (tombstones included) from the cache, for
    /// re-initializing a recovered backend.
    fn cache_as_all_data(&self) -> AllData {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        let mut data = AllData::default();
        for kind in [DataKind::Flags, DataKind::Segments] {
            if let Some(all) = cache.all.get(&kind) {
                for (key, item) in &all.items {
                    match item {
                        StoreItem::Flag(f) => {
                            data.flags.insert(key.clone(), f.clone());
                        }
                        StoreItem::Segment(s) => {
                            data.segments.insert(key.clone(), s.clone());
                        }
                    }
                }
            }
        }
        for ((_, key), cached) in &cache.items {
            if let Some(item) = &cached.item {
                match item {
                    StoreItem::Flag(f) => {
                        data.flags.entry(key.clone()).or_insert_with(|| f.clone());
                    }
                    StoreItem::Segment(s) => {
                        data.segments
                            .entry(key.clone())
                            .or_insert_with(|| s.clone());
                    }
                }
            }
        }
        data
    }

    async fn flight_lock(&self, key: FlightKey) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        Arc::clone(flights.entry(key).or_default())
    }

    async fn release_flight(&self, key: &FlightKey) {
        self.flights.lock().await.remove(key);
    }

    fn cache_item(&self, kind: DataKind, key: &str, item: Option<StoreItem>) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.items.insert(
            (kind, key.to_owned()),
            CachedItem {
                item: item.clone(),
                fetched: Instant::now(),
            },
        );
        // Keep the all-items cache coherent with individual writes.
        if let Some(all) = cache.all.get_mut(&kind) {
            match item {
                Some(item) => {
                    all.items.insert(key.to_owned(), item);
                }
                None => {
                    all.items.remove(key);
                }
            }
        }
    }

    fn cached_item(&self, kind: DataKind, key: &str) -> Option<CachedItem> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.items.get(&(kind, key.to_owned())).cloned()
    }

    fn cached_all(&self, kind: DataKind) -> Option<CachedAll> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.all.get(&kind).cloned()
    }

    fn cache_all(&self, kind: DataKind, items: HashMap<String, StoreItem>) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.all.insert(
            kind,
            CachedAll {
                items,
                fetched: Instant::now(),
            },
        );
    }
}

fn live_only(items: &HashMap<String, StoreItem>) -> HashMap<String, StoreItem> {
    items
        .iter()
        .filter(|(_, item)| !item.is_deleted())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// DataStore impl
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl DataStore for Arc<PersistentStoreAdapter> {
    async fn init(&self, data: AllData) -> Result<(), StoreError> {
        let backend_result = self.backend.init(data.clone()).await;

        match backend_result {
            Ok(()) => self.mark_available(),
            Err(ref e) => {
                self.mark_unavailable();
                if !self.infinite_ttl() {
                    return Err(StoreError::Backend(e.to_string()));
                }
                error!(error = %e, "persistent init failed; caching dataset anyway");
            }
        }

        let flags: HashMap<String, StoreItem> = data
            .flags
            .into_iter()
            .map(|(k, f)| (k, StoreItem::Flag(f)))
            .collect();
        let segments: HashMap<String, StoreItem> = data
            .segments
            .into_iter()
            .map(|(k, s)| (k, StoreItem::Segment(s)))
            .collect();
        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.items.clear();
            cache.all.clear();
        }
        self.cache_all(DataKind::Flags, flags);
        self.cache_all(DataKind::Segments, segments);

        self.initialized.store(true, Ordering::SeqCst);
        let _ = self.updates.send(StoreUpdate::Init);
        Ok(())
    }

    async fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        if let Some(cached) = self.cached_item(kind, key) {
            if self.fresh(cached.fetched) {
                return cached.item.filter(|item| !item.is_deleted());
            }
        }

        let flight_key = FlightKey::Item(kind, key.to_owned());
        let lock = self.flight_lock(flight_key.clone()).await;
        let _guard = lock.lock().await;

        // Another flight may have landed while we waited.
        if let Some(cached) = self.cached_item(kind, key) {
            if self.fresh(cached.fetched) {
                self.release_flight(&flight_key).await;
                return cached.item.filter(|item| !item.is_deleted());
            }
        }

        let result = self.backend.get(kind, key).await;
        self.release_flight(&flight_key).await;
        match result {
            Ok(item) => {
                self.mark_available();
                self.cache_item(kind, key, item.clone());
                item.filter(|item| !item.is_deleted())
            }
            Err(e) => {
                warn!(error = %e, kind = ?kind, key, "persistent read failed; using cache");
                self.mark_unavailable();
                // Stale beats absent under an outage, in either TTL mode.
                self.cached_item(kind, key)
                    .and_then(|c| c.item)
                    .filter(|item| !item.is_deleted())
            }
        }
    }

    async fn get_all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        if let Some(cached) = self.cached_all(kind) {
            if self.fresh(cached.fetched) {
                return live_only(&cached.items);
            }
        }

        let flight_key = FlightKey::All(kind);
        let lock = self.flight_lock(flight_key.clone()).await;
        let _guard = lock.lock().await;

        if let Some(cached) = self.cached_all(kind) {
            if self.fresh(cached.fetched) {
                self.release_flight(&flight_key).await;
                return live_only(&cached.items);
            }
        }

        let result = self.backend.get_all(kind).await;
        self.release_flight(&flight_key).await;
        match result {
            Ok(items) => {
                self.mark_available();
                self.cache_all(kind, items.clone());
                live_only(&items)
            }
            Err(e) => {
                warn!(error = %e, kind = ?kind, "persistent read failed; using cache");
                self.mark_unavailable();
                self.cached_all(kind)
                    .map(|c| live_only(&c.items))
                    .unwrap_or_default()
            }
        }
    }

    async fn upsert(&self, item: StoreItem) -> Result<UpsertOutcome, StoreError> {
        let kind = item.kind();
        let key = item.key().to_owned();

        match self.backend.upsert(item.clone()).await {
            Ok(outcome) => {
                self.mark_available();
                self.cache_item(kind, &key, Some(outcome.item.clone()));
                if outcome.applied {
                    self.publish(kind, &key, &outcome.item);
                }
                Ok(outcome)
            }
            Err(e) => {
                self.mark_unavailable();
                if self.infinite_ttl() {
                    // Continued-availability mode: accept the write locally
                    // so subscribers stay coherent; the recovery poller will
                    // push the cache back into the backend.
                    error!(error = %e, key, "persistent upsert failed; caching write anyway");
                    self.cache_item(kind, &key, Some(item.clone()));
                    self.publish(kind, &key, &item);
                    Ok(UpsertOutcome {
                        applied: true,
                        item,
                    })
                } else {
                    Err(StoreError::Backend(e.to_string()))
                }
            }
        }
    }

    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> Result<(), StoreError> {
        self.upsert(StoreItem::tombstone(kind, key, version))
            .await
            .map(|_| ())
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }
}

impl PersistentStoreAdapter {
    fn publish(&self, kind: DataKind, key: &str, item: &StoreItem) {
        let update = if item.is_deleted() {
            StoreUpdate::Delete {
                kind,
                key: key.to_owned(),
                version: item.version(),
            }
        } else {
            StoreUpdate::Upsert {
                kind,
                key: key.to_owned(),
                item: item.clone(),
            }
        };
        let _ = self.updates.send(update);
    }
}
