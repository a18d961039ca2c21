//! Replicated flag/segment storage.
//!
//! The in-memory store is the default; `cached` wraps a pluggable
//! persistent backend (`persistent`) with TTL caching.  Mutations publish
//! [`StoreUpdate`] notifications on a broadcast channel that the stream
//! fan-out subscribes to; the store never knows who is listening.

pub mod cached;
pub mod persistent;

use flagstream_core::model::{AllData, DataKind, StoreItem};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

/// A change notification published after a store mutation is applied.
#[derive(Debug, Clone)]
pub enum StoreUpdate {
    /// The full dataset was replaced.
    Init,
    /// One item was inserted or updated (never a tombstone).
    Upsert {
        kind: DataKind,
        key: String,
        item: StoreItem,
    },
    /// One item was tombstoned at the given version.
    Delete {
        kind: DataKind,
        key: String,
        version: u64,
    },
}

/// Result of an upsert: whether the write won the version check, and the
/// item now in the store (the caller's on success, the stored one on
/// rejection, so callers can keep caches coherent either way).
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub applied: bool,
    pub item: StoreItem,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("persistent store error: {0}")]
    Backend(String),
}

/// Capacity of the update broadcast channel.  A subscriber that falls this
/// far behind is closed and expected to reconnect.
pub const UPDATE_CHANNEL_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Versioned keyed storage for flags and segments.
///
/// Reads never surface tombstones.  Writes apply only when the incoming
/// version strictly exceeds the stored one; equal versions are no-ops.
#[async_trait::async_trait]
pub trait DataStore: Send + Sync {
    /// Atomically replace the full dataset.  After the first successful
    /// call, `initialized` is true forever.
    async fn init(&self, data: AllData) -> Result<(), StoreError>;

    /// Fetch one item; `None` if absent or tombstoned.
    async fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem>;

    /// Fetch every live item of a kind.
    async fn get_all(&self, kind: DataKind) -> HashMap<String, StoreItem>;

    /// Version-checked insert/update.
    async fn upsert(&self, item: StoreItem) -> Result<UpsertOutcome, StoreError>;

    /// Version-checked tombstone write.
    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> Result<(), StoreError>;

    fn initialized(&self) -> bool;

    /// Subscribe to subsequent update notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreUpdate>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Maps {
    flags: HashMap<String, StoreItem>,
    segments: HashMap<String, StoreItem>,
}

impl Maps {
    fn map(&self, kind: DataKind) -> &HashMap<String, StoreItem> {
        match kind {
            DataKind::Flags => &self.flags,
            DataKind::Segments => &self.segments,
        }
    }

    fn map_mut(&mut self, kind: DataKind) -> &mut HashMap<String, StoreItem> {
        match kind {
            DataKind::Flags => &mut self.flags,
            DataKind::Segments => &mut self.segments,
        }
    }
}

/// The default, purely in-memory replicated store.
pub struct InMemoryDataStore {
    maps: RwLock<Maps>,
    initialized: AtomicBool,
    updates: broadcast::Sender<StoreUpdate>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        InMemoryDataStore {
            maps: RwLock::new(Maps::default()),
            initialized: AtomicBool::new(false),
            updates,
        }
    }

    /// Apply a version-checked write and return the outcome.  Shared by
    /// `upsert` and `delete` (a delete is an upsert of a tombstone).
    fn apply(&self, item: StoreItem) -> UpsertOutcome {
        let kind = item.kind();
        let key = item.key().to_owned();
        let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
        let map = maps.map_mut(kind);
        match map.get(&key) {
            Some(existing) if existing.version() >= item.version() => UpsertOutcome {
                applied: false,
                item: existing.clone(),
            },
            _ => {
                map.insert(key, item.clone());
                UpsertOutcome {
                    applied: true,
                    item,
                }
            }
        }
    }
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DataStore for InMemoryDataStore {
    async fn init(&self, data: AllData) -> Result<(), StoreError> {
        {
            let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
            maps.flags = data
                .flags
                .into_iter()
                .map(|(k, f)| (k, StoreItem::Flag(f)))
                .collect();
            maps.segments = data
                .segments
                .into_iter()
                .map(|(k, s)| (k, StoreItem::Segment(s)))
                .collect();
        }
        self.initialized.store(true, Ordering::SeqCst);
        let _ = self.updates.send(StoreUpdate::Init);
        Ok(())
    }

    async fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
        maps.map(kind)
            .get(key)
            .filter(|item| !item.is_deleted())
            .cloned()
    }

    async fn get_all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
        maps.map(kind)
            .iter()
            .filter(|(_, item)| !item.is_deleted())
            .map(|(k, item)| (k.clone(), item.clone()))
            .collect()
    }

    async fn upsert(&self, item: StoreItem) -> Result<UpsertOutcome, StoreError> {
        let kind = item.kind();
        let key = item.key().to_owned();
        let outcome = self.apply(item);
        if outcome.applied {
            let _ = self.updates.send(StoreUpdate::Upsert {
                kind,
                key,
                item: outcome.item.clone(),
            });
        }
        Ok(outcome)
    }

    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> Result<(), StoreError> {
        let outcome = self.apply(StoreItem::tombstone(kind, key, version));
        if outcome.applied {
            let _ = self.updates.send(StoreUpdate::Delete {
                kind,
                key: key.to_owned(),
                version,
            });
        }
        Ok(())
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Evaluation snapshot
// ---------------------------------------------------------------------------

/// A point-in-time copy of the store used by the evaluator, which needs
/// synchronous random access to flags and segments.
pub struct SnapshotProvider {
    pub flags: HashMap<String, StoreItem>,
    pub segments: HashMap<String, StoreItem>,
}

impl SnapshotProvider {
    pub async fn from_store(store: &dyn DataStore) -> Self {
        SnapshotProvider {
            flags: store.get_all(DataKind::Flags).await,
            segments: store.get_all(DataKind::Segments).await,
        }
    }
}

impl flagstream_core::eval::DataProvider for SnapshotProvider {
    fn flag(&self, key: &str) -> Option<flagstream_core::model::FeatureFlag> {
        match self.flags.get(key) {
            Some(StoreItem::Flag(f)) => Some(f.clone()),
            _ => None,
        }
    }

    fn segment(&self, key: &str) -> Option<flagstream_core::model::Segment> {
        match self.segments.get(key) {
            Some(StoreItem::Segment(s)) => Some(s.clone()),
            _ => None,
        }
    }
}
