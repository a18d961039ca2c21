//! Stream fan-out: multiplexes store updates to many SSE subscribers.
//!
//! One dispatcher per environment serves four subscription shapes:
//! - server "all" (`put`/`patch`/`delete` over flags and segments)
//! - server "flags only" (flags map `put`, keyless `patch`/`delete` paths)
//! - client ping (a bare `ping` on connect and per update)
//! - client eval (per-user evaluated state; see `eval_stream`)
//!
//! Every subscription replays one initial event consistent with the store
//! at open time, then receives updates in store-mutation order.  The store's
//! broadcast channel is the single publication point; a subscriber that
//! lags it is closed and expected to reconnect.
//!
//! Replay `put` payloads for the server dialects are memoized under a
//! checksum of the {key, version} pairs; concurrent connects for the same
//! snapshot share one serialization (the cache lock doubles as the
//! single-flight guard).

use crate::metrics::{MetricsSink, StreamLabel};
use crate::store::{DataStore, SnapshotProvider, StoreUpdate};
use flagstream_core::eval::evaluate;
use flagstream_core::model::{DataKind, StoreItem};
use flagstream_core::user::User;
use flagstream_protocol::stream::{ClientFlagState, DeleteData, EvalDeleteData, PatchData};
use futures_util::Stream;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The two server-side stream dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStreamKind {
    All,
    FlagsOnly,
}

/// One SSE event ready for framing: `event: {name}\ndata: {data}\n\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutEvent {
    pub name: &'static str,
    pub data: String,
}

impl OutEvent {
    fn put(data: String) -> Self {
        OutEvent { name: "put", data }
    }

    fn ping() -> Self {
        OutEvent {
            name: "ping",
            data: flagstream_protocol::stream::PING_DATA.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ReplayCache {
    checksum: Option<String>,
    all_put: String,
    flags_put: String,
}

/// Fan-out hub for one environment.
pub struct StreamDispatcher {
    store: Arc<dyn DataStore>,
    replay: Mutex<ReplayCache>,
    /// Closing the dispatcher ends every subscription.
    shutdown: broadcast::Sender<()>,
    /// Server-key revocations; server subscriptions carrying the revoked
    /// key close themselves.  Client-side subscriptions never listen.
    revoked: broadcast::Sender<String>,
    max_connection_time: Option<Duration>,
    metrics: Arc<MetricsSink>,
}

impl StreamDispatcher {
    pub fn new(
        store: Arc<dyn DataStore>,
        max_connection_time: Option<Duration>,
        metrics: Arc<MetricsSink>,
    ) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        let (revoked, _) = broadcast::channel(4);
        Arc::new(StreamDispatcher {
            store,
            replay: Mutex::new(ReplayCache::default()),
            shutdown,
            revoked,
            max_connection_time,
            metrics,
        })
    }

    /// End every open subscription.
    pub fn close(&self) {
        let _ = self.shutdown.send(());
    }

    /// Close server-side subscriptions authenticated with `sdk_key`.
    pub fn revoke_server_key(&self, sdk_key: &str) {
        let _ = self.revoked.send(sdk_key.to_owned());
    }

    // -----------------------------------------------------------------------
    // Replay payloads
    // -----------------------------------------------------------------------

    /// The serialized `put` payload for a server stream, memoized per store
    /// snapshot.  Holding the cache lock across the computation makes
    /// concurrent connects for the same snapshot share one serialization.
    async fn replay_payload(&self, kind: ServerStreamKind) -> String {
        let mut cache = self.replay.lock().await;

        let flags = self.store.get_all(DataKind::Flags).await;
        let segments = self.store.get_all(DataKind::Segments).await;
        let checksum = snapshot_checksum(&flags, &segments);

        if cache.checksum.as_deref() != Some(checksum.as_str()) {
            let flags_value = serde_json::Map::from_iter(
                flags
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or_default())),
            );
            let segments_value = serde_json::Map::from_iter(
                segments
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or_default())),
            );
            cache.flags_put = serde_json::Value::Object(flags_value.clone()).to_string();
            cache.all_put = serde_json::json!({
                "path": "/",
                "data": {"flags": flags_value, "segments": segments_value}
            })
            .to_string();
            cache.checksum = Some(checksum);
        }

        match kind {
            ServerStreamKind::All => cache.all_put.clone(),
            ServerStreamKind::FlagsOnly => cache.flags_put.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Server streams
    // -----------------------------------------------------------------------

    /// A server-side subscription.  `sdk_key` is the credential the client
    /// authenticated with; rotating it away closes the stream.
    pub fn server_stream(
        self: &Arc<Self>,
        kind: ServerStreamKind,
        sdk_key: String,
    ) -> impl Stream<Item = OutEvent> {
        let dispatcher = Arc::clone(self);
        let mut updates = dispatcher.store.subscribe();
        let mut shutdown = dispatcher.shutdown.subscribe();
        let mut revoked = dispatcher.revoked.subscribe();
        let max_age = dispatcher.max_connection_time;
        let connection_id = Uuid::new_v4();

        async_stream::stream! {
            debug!(connection_id = %connection_id, kind = ?kind, "server stream opened");
            let _connection = dispatcher.metrics.connection_opened(match kind {
                ServerStreamKind::All => StreamLabel::ServerAll,
                ServerStreamKind::FlagsOnly => StreamLabel::ServerFlags,
            });
            if dispatcher.store.initialized() {
                yield OutEvent::put(dispatcher.replay_payload(kind).await);
            }

            let deadline = connection_deadline(max_age);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Ok(StoreUpdate::Init) => {
                            yield OutEvent::put(dispatcher.replay_payload(kind).await);
                        }
                        Ok(StoreUpdate::Upsert { kind: data_kind, key, item }) => {
                            if kind == ServerStreamKind::FlagsOnly && data_kind != DataKind::Flags {
                                continue;
                            }
                            let data = serde_json::to_value(&item).unwrap_or_default();
                            let patch = PatchData { path: event_path(kind, data_kind, &key), data };
                            match serde_json::to_string(&patch) {
                                Ok(json) => yield OutEvent { name: "patch", data: json },
                                Err(e) => warn!(error = %e, "failed to serialize patch"),
                            }
                        }
                        Ok(StoreUpdate::Delete { kind: data_kind, key, version }) => {
                            if kind == ServerStreamKind::FlagsOnly && data_kind != DataKind::Flags {
                                continue;
                            }
                            let delete = DeleteData { path: event_path(kind, data_kind, &key), version };
                            match serde_json::to_string(&delete) {
                                Ok(json) => yield OutEvent { name: "delete", data: json },
                                Err(e) => warn!(error = %e, "failed to serialize delete"),
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "server stream subscriber lagged; closing");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    revoked_key = revoked.recv() => {
                        if matches!(revoked_key, Ok(key) if key == sdk_key) {
                            debug!("server stream credential rotated away; closing");
                            break;
                        }
                    }
                    _ = shutdown.recv() => break,
                    _ = &mut deadline => {
                        debug!(connection_id = %connection_id, "max connection time reached; closing stream");
                        break;
                    }
                }
            }
            debug!(connection_id = %connection_id, "server stream closed");
        }
    }

    // -----------------------------------------------------------------------
    // Client ping streams
    // -----------------------------------------------------------------------

    /// A client-side ping subscription: one `ping` on connect (if the store
    /// is initialized), one per update.  Pings carry no payload, so lagging
    /// collapses undelivered pings instead of closing the stream.
    pub fn ping_stream(self: &Arc<Self>) -> impl Stream<Item = OutEvent> {
        let dispatcher = Arc::clone(self);
        let mut updates = dispatcher.store.subscribe();
        let mut shutdown = dispatcher.shutdown.subscribe();
        let max_age = dispatcher.max_connection_time;

        async_stream::stream! {
            let _connection = dispatcher.metrics.connection_opened(StreamLabel::ClientPing);
            if dispatcher.store.initialized() {
                yield OutEvent::ping();
            }

            let deadline = connection_deadline(max_age);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Ok(_) => yield OutEvent::ping(),
                        // Missed updates all collapse into this one ping.
                        Err(broadcast::error::RecvError::Lagged(_)) => yield OutEvent::ping(),
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                    _ = &mut deadline => break,
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Client eval streams
    // -----------------------------------------------------------------------

    /// A client-side eval subscription: evaluated flag state for one user.
    ///
    /// The initial `put` maps every flag to its evaluated state; a flag
    /// update re-evaluates that flag and emits `patch`; a flag delete emits
    /// `delete`; segment updates re-send a full `put` since any flag may
    /// depend on the segment.
    pub fn eval_stream(self: &Arc<Self>, user: User) -> impl Stream<Item = OutEvent> {
        let dispatcher = Arc::clone(self);
        let mut updates = dispatcher.store.subscribe();
        let mut shutdown = dispatcher.shutdown.subscribe();
        let max_age = dispatcher.max_connection_time;

        async_stream::stream! {
            let _connection = dispatcher.metrics.connection_opened(StreamLabel::ClientEval);
            if dispatcher.store.initialized() {
                yield dispatcher.eval_put(&user).await;
            }

            let deadline = connection_deadline(max_age);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Ok(StoreUpdate::Init) => yield dispatcher.eval_put(&user).await,
                        Ok(StoreUpdate::Upsert { kind: DataKind::Flags, key, .. }) => {
                            let snapshot = SnapshotProvider::from_store(dispatcher.store.as_ref()).await;
                            if let Some(state) = eval_flag_state(&snapshot, &key, &user, true) {
                                match serde_json::to_string(&state) {
                                    Ok(json) => yield OutEvent { name: "patch", data: json },
                                    Err(e) => warn!(error = %e, "failed to serialize eval patch"),
                                }
                            }
                        }
                        Ok(StoreUpdate::Upsert { kind: DataKind::Segments, .. }) => {
                            yield dispatcher.eval_put(&user).await;
                        }
                        Ok(StoreUpdate::Delete { kind: DataKind::Flags, key, version }) => {
                            let delete = EvalDeleteData { key, version };
                            match serde_json::to_string(&delete) {
                                Ok(json) => yield OutEvent { name: "delete", data: json },
                                Err(e) => warn!(error = %e, "failed to serialize eval delete"),
                            }
                        }
                        Ok(StoreUpdate::Delete { kind: DataKind::Segments, .. }) => {
                            yield dispatcher.eval_put(&user).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "eval stream subscriber lagged; closing");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                    _ = &mut deadline => break,
                }
            }
        }
    }

    async fn eval_put(&self, user: &User) -> OutEvent {
        let snapshot = SnapshotProvider::from_store(self.store.as_ref()).await;
        let mut data: HashMap<String, ClientFlagState> = HashMap::new();
        for key in snapshot.flags.keys() {
            if let Some(state) = eval_flag_state(&snapshot, key, user, false) {
                data.insert(key.clone(), state);
            }
        }
        OutEvent::put(serde_json::to_string(&data).unwrap_or_else(|_| "{}".to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The patch/delete path for a server stream: the all-data dialect carries
/// the kind prefix, the flags-only dialect is keyed at the root.
fn event_path(stream: ServerStreamKind, kind: DataKind, key: &str) -> String {
    match stream {
        ServerStreamKind::All => format!("/{}/{}", kind.path_component(), key),
        ServerStreamKind::FlagsOnly => format!("/{}", key),
    }
}

/// Checksum over the sorted {kind, key, version} pairs of a snapshot.
fn snapshot_checksum(
    flags: &HashMap<String, StoreItem>,
    segments: &HashMap<String, StoreItem>,
) -> String {
    let mut pairs: Vec<String> = flags
        .iter()
        .map(|(k, v)| format!("flags/{}:{}", k, v.version()))
        .chain(
            segments
                .iter()
                .map(|(k, v)| format!("segments/{}:{}", k, v.version())),
        )
        .collect();
    pairs.sort_unstable();
    let mut hasher = Sha256::new();
    for pair in &pairs {
        hasher.update(pair.as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

/// Evaluate one flag for the eval dialect.  `with_key` embeds the flag key
/// in the payload (patch events carry it; put entries are keyed by map).
fn eval_flag_state(
    snapshot: &SnapshotProvider,
    key: &str,
    user: &User,
    with_key: bool,
) -> Option<ClientFlagState> {
    let flag = match snapshot.flags.get(key) {
        Some(StoreItem::Flag(f)) if !f.deleted => f.clone(),
        _ => return None,
    };
    let result = evaluate(&flag, user, snapshot);
    Some(ClientFlagState {
        key: with_key.then(|| key.to_owned()),
        value: result.value.unwrap_or(serde_json::Value::Null),
        variation: result.variation_index,
        version: flag.version,
        track_events: flag.track_events,
        debug_events_until_date: flag.debug_events_until_date,
    })
}

async fn connection_deadline(max_age: Option<Duration>) {
    match max_age {
        Some(age) => tokio::time::sleep(age).await,
        None => std::future::pending().await,
    }
}
