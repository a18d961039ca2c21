//! Persistent backend contract.
//!
//! Concrete drivers (Redis, DynamoDB, ...) live outside this crate; the
//! relay only depends on this trait.  Backends store raw items including
//! tombstones and perform their own version checks on write, so that
//! multiple relay instances sharing one backend stay consistent.

use super::{StoreError, UpsertOutcome};
use flagstream_core::model::{AllData, DataKind, StoreItem};
use std::collections::HashMap;

/// Health of the persistent backend as observed by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Available,
    Unavailable,
}

#[async_trait::async_trait]
pub trait PersistentDataStore: Send + Sync {
    /// Replace the full dataset (tombstones included).
    async fn init(&self, data: AllData) -> Result<(), StoreError>;

    /// Fetch one raw item; tombstones are returned, not filtered.
    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, StoreError>;

    /// Fetch every raw item of a kind, tombstones included.
    async fn get_all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, StoreError>;

    /// Version-checked write.  On rejection the backend returns its stored
    /// item so the adapter can cache the authoritative value.
    async fn upsert(&self, item: StoreItem) -> Result<UpsertOutcome, StoreError>;

    /// Whether the backend has ever been initialized with a full dataset.
    async fn initialized(&self) -> Result<bool, StoreError>;

    /// The cheapest possible health probe, polled while unavailable.
    async fn ping(&self) -> Result<(), StoreError>;
}
