//! Batched, retry-capable event delivery.
//!
//! [`EventSender`] posts one JSON-array payload upstream with the retry
//! policy: transient failures (5xx, network) retry once after a fixed
//! delay, then the payload is dropped; 401/403 permanently shuts the
//! sender down.  Credentials are read at send time so rotation applies to
//! the next send without touching in-flight payloads.
//!
//! [`EventPublisher`] is the verbatim path: a capacity-bounded queue per
//! (credential, tag) partition with time- and size-based flushing.

use super::{EventAuth, SdkKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Fixed delay before the single retry of a failed send.
const RETRY_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Send outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Payload dropped after the retry (or on a non-auth 4xx).
    Dropped,
    /// Credential rejected: the publisher must stop permanently.
    MustShutDown,
}

// ---------------------------------------------------------------------------
// EventSender
// ---------------------------------------------------------------------------

/// Posts event payloads to the upstream endpoint for one SDK kind.
pub struct EventSender {
    client: reqwest::Client,
    events_uri: String,
    kind: SdkKind,
    auth: Arc<RwLock<EventAuth>>,
    schema_version: u32,
    tags: Option<String>,
}

impl EventSender {
    pub fn new(
        client: reqwest::Client,
        events_uri: String,
        kind: SdkKind,
        auth: Arc<RwLock<EventAuth>>,
        schema_version: u32,
        tags: Option<String>,
    ) -> Self {
        EventSender {
            client,
            events_uri,
            kind,
            auth,
            schema_version,
            tags,
        }
    }

    /// The bulk endpoint for this sender's SDK kind, resolved at send time
    /// so credential rotation reaches the URL-bound browser credential too.
    fn url(&self) -> String {
        let auth = self.auth.read().unwrap_or_else(|e| e.into_inner());
        match self.kind {
            SdkKind::Server => format!("{}/bulk", self.events_uri),
            SdkKind::Mobile => format!("{}/mobile", self.events_uri),
            SdkKind::Browser => format!(
                "{}/events/bulk/{}",
                self.events_uri,
                auth.environment_id.as_deref().unwrap_or_default()
            ),
        }
    }

    fn credential(&self) -> Option<String> {
        let auth = self.auth.read().unwrap_or_else(|e| e.into_inner());
        match self.kind {
            SdkKind::Server => Some(auth.sdk_key.clone()),
            SdkKind::Mobile => auth.mobile_key.clone(),
            // Browser events authenticate by the environment id in the URL.
            SdkKind::Browser => None,
        }
    }

    /// Deliver one payload, retrying once on transient failure.
    pub async fn send(&self, payload: &[serde_json::Value]) -> SendOutcome {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to serialize event payload");
                return SendOutcome::Dropped;
            }
        };

        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            match self.post(&body).await {
                PostResult::Ok => {
                    debug!(events = payload.len(), "event payload delivered");
                    return SendOutcome::Delivered;
                }
                PostResult::Unauthorized => {
                    error!("event credential rejected by upstream; shutting publisher down");
                    return SendOutcome::MustShutDown;
                }
                PostResult::Unrecoverable(status) => {
                    warn!(status, "event payload rejected; dropping");
                    return SendOutcome::Dropped;
                }
                PostResult::Transient(reason) => {
                    warn!(attempt, reason = %reason, "event delivery failed");
                }
            }
        }
        SendOutcome::Dropped
    }

    async fn post(&self, body: &[u8]) -> PostResult {
        let mut request = self
            .client
            .post(self.url())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(
                flagstream_protocol::EVENT_SCHEMA_HEADER,
                self.schema_version.to_string(),
            )
            .body(body.to_vec());
        if let Some(credential) = self.credential() {
            request = request.header(reqwest::header::AUTHORIZATION, credential);
        }
        if let Some(tags) = &self.tags {
            request = request.header(flagstream_protocol::TAGS_HEADER, tags);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    PostResult::Ok
                } else if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN
                {
                    PostResult::Unauthorized
                } else if status.is_client_error() {
                    PostResult::Unrecoverable(status.as_u16())
                } else {
                    PostResult::Transient(format!("status {}", status))
                }
            }
            Err(e) => PostResult::Transient(e.to_string()),
        }
    }
}

enum PostResult {
    Ok,
    Unauthorized,
    Unrecoverable(u16),
    Transient(String),
}

// ---------------------------------------------------------------------------
// EventPublisher (verbatim path)
// ---------------------------------------------------------------------------

/// A capacity-bounded queue of already-current-schema events, flushed on a
/// timer and when the buffer crosses the capacity mark.
pub struct EventPublisher {
    tx: mpsc::Sender<serde_json::Value>,
    shutdown: broadcast::Sender<()>,
    dead: Arc<AtomicBool>,
    capacity_warning: CapacityWarning,
}

impl EventPublisher {
    pub fn new(sender: EventSender, capacity: usize, flush_interval: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let dead = Arc::new(AtomicBool::new(false));
        tokio::spawn(flush_loop(
            sender,
            rx,
            shutdown_rx,
            Arc::clone(&dead),
            capacity,
            flush_interval,
        ));
        Arc::new(EventPublisher {
            tx,
            shutdown,
            dead,
            capacity_warning: CapacityWarning::new(flush_interval),
        })
    }

    /// Enqueue events without blocking.  A full queue drops the event with
    /// a rate-limited warning; a dead publisher (after upstream 401) drops
    /// silently.
    pub fn enqueue(&self, events: Vec<serde_json::Value>) {
        if self.dead.load(Ordering::SeqCst) {
            return;
        }
        for event in events {
            if self.tx.try_send(event).is_err() {
                self.capacity_warning.warn_if_due();
            }
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Flush once more, then stop the flush task.
    pub fn close(&self) {
        let _ = self.shutdown.send(());
    }
}

async fn flush_loop(
    sender: EventSender,
    mut rx: mpsc::Receiver<serde_json::Value>,
    mut shutdown: broadcast::Receiver<()>,
    dead: Arc<AtomicBool>,
    capacity: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<serde_json::Value> = Vec::new();
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // immediate first tick

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    buffer.push(event);
                    if buffer.len() >= capacity
                        && !flush(&sender, &mut buffer, &dead).await {
                        return;
                    }
                }
                None => {
                    let _ = flush(&sender, &mut buffer, &dead).await;
                    return;
                }
            },
            _ = interval.tick() => {
                if !flush(&sender, &mut buffer, &dead).await {
                    return;
                }
            }
            _ = shutdown.recv() => {
                let _ = flush(&sender, &mut buffer, &dead).await;
                return;
            }
        }
    }
}

/// Returns false when the publisher must stop permanently.
async fn flush(
    sender: &EventSender,
    buffer: &mut Vec<serde_json::Value>,
    dead: &AtomicBool,
) -> bool {
    if buffer.is_empty() {
        return true;
    }
    let payload = std::mem::take(buffer);
    match sender.send(&payload).await {
        SendOutcome::MustShutDown => {
            dead.store(true, Ordering::SeqCst);
            false
        }
        SendOutcome::Delivered | SendOutcome::Dropped => true,
    }
}

// ---------------------------------------------------------------------------
// Rate-limited capacity warning
// ---------------------------------------------------------------------------

/// Emits the "capacity exceeded" warning at most once per flush interval.
struct CapacityWarning {
    min_gap: Duration,
    last: Mutex<Option<Instant>>,
}

impl CapacityWarning {
    fn new(min_gap: Duration) -> Self {
        CapacityWarning {
            min_gap,
            last: Mutex::new(None),
        }
    }

    fn warn_if_due(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let due = last.map_or(true, |at| at.elapsed() >= self.min_gap);
        if due {
            warn!("event queue capacity exceeded; dropping events");
            *last = Some(Instant::now());
        }
    }
}
