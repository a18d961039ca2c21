//! Upstream data sources.
//!
//! One task per environment keeps the replicated store in sync with the
//! upstream provider, either over a long-lived SSE connection (`streaming`,
//! the default) or by periodic polling (`polling`).  Both honor the
//! environment shutdown signal and signal readiness exactly once when the
//! first full dataset lands.

pub mod polling;
pub mod streaming;

use crate::store::DataStore;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Upstream connection state for one environment, as surfaced on /status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    Connected,
    /// Terminal: upstream rejected the credential (401/403) or the URL.
    Failed,
}

// ---------------------------------------------------------------------------
// Config and handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DataSourceConfig {
    pub sdk_key: String,
    pub stream_uri: String,
    pub base_uri: String,
    pub polling: bool,
    pub poll_interval: Duration,
    /// Total timeout for non-streaming upstream requests.
    pub request_timeout: Duration,
}

/// A running data-source task.  Dropping the handle does not stop the task;
/// call [`DataSourceHandle::stop`].
pub struct DataSourceHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl DataSourceHandle {
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
        self.task.abort();
    }
}

/// Spawn the data source selected by `cfg.polling`.
///
/// `ready` fires once, at the first successful data load.  `state` receives
/// connection-state transitions.
pub fn start(
    cfg: DataSourceConfig,
    store: Arc<dyn DataStore>,
    state: watch::Sender<ConnectionState>,
    ready: oneshot::Sender<()>,
) -> DataSourceHandle {
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let task = if cfg.polling {
        tokio::spawn(polling::run(cfg, store, state, ready, shutdown_rx))
    } else {
        tokio::spawn(streaming::run(cfg, store, state, ready, shutdown_rx))
    };
    DataSourceHandle { shutdown, task }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Exponential backoff with full jitter: 1 s base, doubling per failure,
/// capped at 60 s.
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Backoff {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            attempt: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(6));
        let ceiling = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        // Full jitter: anywhere from zero to the current ceiling.
        ceiling.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ceiling_doubles_and_caps() {
        let mut backoff = Backoff::new();
        // Jittered values are random, but never exceed the ceiling.
        for expected_cap_secs in [1u64, 2, 4, 8, 16, 32, 60, 60] {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(expected_cap_secs));
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_secs(1));
    }
}
