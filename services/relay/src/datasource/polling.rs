//! Polling data source: periodic full-dataset fetch.
//!
//! Each cycle GETs `/sdk/latest-all` and replaces the store via `init`.
//! The last ETag is cached and sent as `If-None-Match`; a 304 (or a body
//! identical to the previous one, for servers without ETags) skips the
//! replace.  The interval is clamped to at least one second by config.

use super::{ConnectionState, DataSourceConfig};
use crate::store::DataStore;
use flagstream_core::model::AllData;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

pub(super) async fn run(
    cfg: DataSourceConfig,
    store: Arc<dyn DataStore>,
    state: watch::Sender<ConnectionState>,
    ready: oneshot::Sender<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let client = match reqwest::Client::builder()
        .timeout(cfg.request_timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build upstream HTTP client");
            let _ = state.send(ConnectionState::Failed);
            return;
        }
    };

    let mut ready = Some(ready);
    let mut etag: Option<String> = None;
    let mut last_body_hash: Option<[u8; 32]> = None;
    let mut interval = tokio::time::interval(cfg.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {}
        }

        match poll_once(&cfg, &client, &store, &mut etag, &mut last_body_hash).await {
            Ok(PollOutcome::Applied) => {
                let _ = state.send(ConnectionState::Connected);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                }
            }
            Ok(PollOutcome::NotModified) => {
                debug!("poll response unchanged; skipping init");
            }
            Err(PollError::Fatal(reason)) => {
                error!(reason = %reason, "polling failed permanently");
                let _ = state.send(ConnectionState::Failed);
                return;
            }
            Err(PollError::Transient(reason)) => {
                warn!(reason = %reason, "poll cycle failed; will retry next interval");
            }
        }
    }
}

enum PollOutcome {
    Applied,
    NotModified,
}

enum PollError {
    Fatal(String),
    Transient(String),
}

async fn poll_once(
    cfg: &DataSourceConfig,
    client: &reqwest::Client,
    store: &Arc<dyn DataStore>,
    etag: &mut Option<String>,
    last_body_hash: &mut Option<[u8; 32]>,
) -> Result<PollOutcome, PollError> {
    let url = format!("{}/sdk/latest-all", cfg.base_uri);
    let mut request = client
        .get(&url)
        .header(reqwest::header::AUTHORIZATION, &cfg.sdk_key);
    if let Some(etag) = etag.as_deref() {
        request = request.header(reqwest::header::IF_NONE_MATCH, etag);
    }

    let response = request
        .send()
        .await
        .map_err(|e| PollError::Transient(format!("request: {}", e)))?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_MODIFIED {
        return Ok(PollOutcome::NotModified);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(PollError::Fatal(format!("credential rejected ({})", status)));
    }
    if status.is_client_error() {
        return Err(PollError::Fatal(format!("unrecoverable response ({})", status)));
    }
    if !status.is_success() {
        return Err(PollError::Transient(format!("status {}", status)));
    }

    let new_etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let body = response
        .bytes()
        .await
        .map_err(|e| PollError::Transient(format!("read: {}", e)))?;

    // Servers without ETag support still get change suppression.
    let body_hash: [u8; 32] = Sha256::digest(&body).into();
    if new_etag.is_none() && *last_body_hash == Some(body_hash) {
        return Ok(PollOutcome::NotModified);
    }

    let data: AllData = serde_json::from_slice(&body)
        .map_err(|e| PollError::Transient(format!("parse: {}", e)))?;
    store
        .init(data)
        .await
        .map_err(|e| PollError::Transient(format!("store init: {}", e)))?;

    *etag = new_etag;
    *last_body_hash = Some(body_hash);
    info!("dataset replaced from poll");
    Ok(PollOutcome::Applied)
}
