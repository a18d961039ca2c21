//! Streaming data source: one long-lived SSE connection per environment.
//!
//! # Event handling
//! - `put`: full dataset replace via store `init`
//! - `patch`: single-item upsert, path discriminates the kind
//! - `delete`: tombstone at the carried version
//! - `indirect/put`, `indirect/patch`: the body is only a reference; the
//!   referenced resource is fetched over a separate GET and then applied
//!
//! Transport failures reconnect with full-jitter exponential backoff.
//! 401/403 is terminal: the environment is marked failed and the task ends.

use super::{Backoff, ConnectionState, DataSourceConfig};
use crate::store::DataStore;
use flagstream_core::model::{AllData, DataKind, FeatureFlag, Segment, StoreItem};
use flagstream_protocol::sse::SseDecoder;
use flagstream_protocol::stream::{DeleteData, PatchData};
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct PutWrapper {
    #[allow(dead_code)]
    path: Option<String>,
    data: AllData,
}

/// Why a connection attempt ended.
enum StreamExit {
    /// Credential rejected (401/403) or unusable URL (other 4xx): stop.
    Fatal(String),
    /// Network error, 5xx, or EOF: reconnect after backoff.
    Retry(String),
}

pub(super) async fn run(
    cfg: DataSourceConfig,
    store: Arc<dyn DataStore>,
    state: watch::Sender<ConnectionState>,
    ready: oneshot::Sender<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    // No total timeout on the client: the stream is expected to stay open
    // indefinitely.  Connect establishment is still bounded.
    let client = match reqwest::Client::builder()
        .connect_timeout(cfg.request_timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build upstream HTTP client");
            let _ = state.send(ConnectionState::Failed);
            return;
        }
    };

    let mut backoff = Backoff::new();
    let mut ready = Some(ready);

    loop {
        let exit = tokio::select! {
            _ = shutdown.recv() => return,
            exit = consume_stream(&cfg, &client, &store, &state, &mut ready, &mut backoff) => exit,
        };
        match exit {
            StreamExit::Fatal(reason) => {
                error!(reason = %reason, "upstream stream failed permanently");
                let _ = state.send(ConnectionState::Failed);
                return;
            }
            StreamExit::Retry(reason) => {
                let delay = backoff.next_delay();
                warn!(reason = %reason, delay_ms = delay.as_millis() as u64,
                    "upstream stream interrupted; reconnecting");
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn consume_stream(
    cfg: &DataSourceConfig,
    client: &reqwest::Client,
    store: &Arc<dyn DataStore>,
    state: &watch::Sender<ConnectionState>,
    ready: &mut Option<oneshot::Sender<()>>,
    backoff: &mut Backoff,
) -> StreamExit {
    let url = format!("{}/all", cfg.stream_uri);
    let response = match client
        .get(&url)
        .header(reqwest::header::AUTHORIZATION, &cfg.sdk_key)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => return StreamExit::Retry(format!("connect: {}", e)),
    };

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return StreamExit::Fatal(format!("credential rejected ({})", status));
    }
    if status.is_client_error() {
        return StreamExit::Fatal(format!("unrecoverable response ({})", status));
    }
    if !status.is_success() {
        return StreamExit::Retry(format!("status {}", status));
    }

    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return StreamExit::Retry(format!("read: {}", e)),
        };
        for event in decoder.feed(&chunk) {
            match handle_event(cfg, client, store, &event.name, &event.data).await {
                Ok(applied_data) => {
                    if applied_data {
                        // A live connection delivering data resets the backoff.
                        backoff.reset();
                        let _ = state.send(ConnectionState::Connected);
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(());
                        }
                    }
                }
                Err(e) => warn!(event = %event.name, error = %e, "dropping malformed upstream event"),
            }
        }
    }
    StreamExit::Retry("stream closed by upstream".to_owned())
}

/// Apply one upstream event to the store.  Returns true when data landed.
async fn handle_event(
    cfg: &DataSourceConfig,
    client: &reqwest::Client,
    store: &Arc<dyn DataStore>,
    name: &str,
    data: &str,
) -> Result<bool, String> {
    match name {
        "put" => {
            let put: PutWrapper = serde_json::from_str(data).map_err(|e| e.to_string())?;
            store
                .init(put.data)
                .await
                .map_err(|e| e.to_string())?;
            info!("full dataset replaced from upstream put");
            Ok(true)
        }
        "patch" => {
            let patch: PatchData = serde_json::from_str(data).map_err(|e| e.to_string())?;
            apply_patch(store, &patch.path, patch.data).await
        }
        "delete" => {
            let delete: DeleteData = serde_json::from_str(data).map_err(|e| e.to_string())?;
            let (kind, key) = DataKind::parse_path(&delete.path)
                .ok_or_else(|| format!("unrecognized delete path '{}'", delete.path))?;
            store
                .delete(kind, key, delete.version)
                .await
                .map_err(|e| e.to_string())?;
            debug!(path = %delete.path, version = delete.version, "applied upstream delete");
            Ok(true)
        }
        "indirect/put" => {
            let data = fetch_all(cfg, client).await?;
            store.init(data).await.map_err(|e| e.to_string())?;
            info!("full dataset replaced from indirect put");
            Ok(true)
        }
        "indirect/patch" => {
            // The event body is just the item path; fetch the referenced item.
            let path = data.trim().trim_matches('"');
            let (kind, key) = DataKind::parse_path(path)
                .ok_or_else(|| format!("unrecognized indirect path '{}'", path))?;
            let item = fetch_item(cfg, client, kind, key).await?;
            store.upsert(item).await.map_err(|e| e.to_string())?;
            debug!(path = %path, "applied indirect patch");
            Ok(true)
        }
        other => {
            debug!(event = %other, "ignoring unknown upstream event");
            Ok(false)
        }
    }
}

async fn apply_patch(
    store: &Arc<dyn DataStore>,
    path: &str,
    data: serde_json::Value,
) -> Result<bool, String> {
    let (kind, _key) =
        DataKind::parse_path(path).ok_or_else(|| format!("unrecognized patch path '{}'", path))?;
    let item = parse_item(kind, data)?;
    store.upsert(item).await.map_err(|e| e.to_string())?;
    debug!(path = %path, "applied upstream patch");
    Ok(true)
}

fn parse_item(kind: DataKind, data: serde_json::Value) -> Result<StoreItem, String> {
    match kind {
        DataKind::Flags => serde_json::from_value::<FeatureFlag>(data)
            .map(StoreItem::Flag)
            .map_err(|e| e.to_string()),
        DataKind::Segments => serde_json::from_value::<Segment>(data)
            .map(StoreItem::Segment)
            .map_err(|e| e.to_string()),
    }
}

async fn fetch_all(cfg: &DataSourceConfig, client: &reqwest::Client) -> Result<AllData, String> {
    let url = format!("{}/sdk/latest-all", cfg.base_uri);
    let response = client
        .get(&url)
        .header(reqwest::header::AUTHORIZATION, &cfg.sdk_key)
        .timeout(cfg.request_timeout)
        .send()
        .await
        .map_err(|e| e.to_string())?
        .error_for_status()
        .map_err(|e| e.to_string())?;
    response.json().await.map_err(|e| e.to_string())
}

async fn fetch_item(
    cfg: &DataSourceConfig,
    client: &reqwest::Client,
    kind: DataKind,
    key: &str,
) -> Result<StoreItem, String> {
    let url = match kind {
        DataKind::Flags => format!("{}/sdk/latest-flags/{}", cfg.base_uri, key),
        DataKind::Segments => format!("{}/sdk/latest-segments/{}", cfg.base_uri, key),
    };
    let response = client
        .get(&url)
        .header(reqwest::header::AUTHORIZATION, &cfg.sdk_key)
        .timeout(cfg.request_timeout)
        .send()
        .await
        .map_err(|e| e.to_string())?
        .error_for_status()
        .map_err(|e| e.to_string())?;
    let value: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
    parse_item(kind, value)
}
