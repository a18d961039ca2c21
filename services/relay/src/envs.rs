//! Per-environment state and credential lifecycle.
//!
//! An [`EnvironmentContext`] owns the store, data source, stream fan-out,
//! and event relay for one tenant.  Credential rotation follows the
//! zero-loss protocol: a replacement server key starts a second data
//! source, and the old one is stopped only after the new one has signalled
//! readiness.  Removing a server key closes the server-side streams opened
//! under it; client-side streams under mobile keys or environment ids are
//! untouched.

use crate::config::{EnvironmentConfig, EventsConfig, StreamConfig, UpstreamConfig};
use crate::credentials::Credential;
use crate::datasource::{self, ConnectionState, DataSourceConfig, DataSourceHandle};
use crate::events::{EventAuth, EventDispatcher, EventRelayConfig};
use crate::fanout::StreamDispatcher;
use crate::metrics::MetricsSink;
use crate::store::{DataStore, InMemoryDataStore};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Credential state
// ---------------------------------------------------------------------------

struct CredentialState {
    /// Every credential that currently authenticates, deprecated included.
    credentials: HashSet<Credential>,
    /// Deprecated credentials still authenticate but are hidden from
    /// lookups and the status resource.
    deprecated: HashSet<Credential>,
    /// The server key the data source connects with.
    primary_sdk_key: String,
}

// ---------------------------------------------------------------------------
// EnvironmentContext
// ---------------------------------------------------------------------------

/// Everything the relay holds for one environment.
pub struct EnvironmentContext {
    pub name: String,
    pub secure_mode: bool,
    pub streams: StreamConfig,
    pub store: Arc<dyn DataStore>,
    pub dispatcher: Arc<StreamDispatcher>,
    pub events: Option<Arc<EventDispatcher>>,
    pub metrics: Arc<MetricsSink>,
    credentials: RwLock<CredentialState>,
    datasource: Mutex<Option<DataSourceHandle>>,
    ds_base: DataSourceConfig,
    state_tx: watch::Sender<ConnectionState>,
}

impl EnvironmentContext {
    /// Build the context without starting the data source (tests drive the
    /// store directly; production callers follow with [`start_data_source`]).
    pub fn new(
        cfg: &EnvironmentConfig,
        upstream: &UpstreamConfig,
        streams: &StreamConfig,
        events: Option<&EventsConfig>,
        store: Arc<dyn DataStore>,
    ) -> Arc<Self> {
        let mut credentials = HashSet::new();
        credentials.insert(Credential::SdkKey(cfg.sdk_key.clone()));
        if let Some(mobile_key) = &cfg.mobile_key {
            credentials.insert(Credential::MobileKey(mobile_key.clone()));
        }
        if let Some(env_id) = &cfg.env_id {
            credentials.insert(Credential::EnvironmentId(env_id.clone()));
        }

        let metrics = MetricsSink::new();
        let events_uri = cfg
            .events_uri
            .clone()
            .unwrap_or_else(|| upstream.events_uri.clone());
        let events = events.map(|events_cfg| {
            EventDispatcher::new(
                EventRelayConfig {
                    events_uri,
                    flush_interval: events_cfg.flush_interval,
                    capacity: events_cfg.capacity,
                    user_keys_capacity: events_cfg.user_keys_capacity,
                    send_timeout: events_cfg.send_timeout,
                },
                Arc::clone(&store),
                EventAuth {
                    sdk_key: cfg.sdk_key.clone(),
                    mobile_key: cfg.mobile_key.clone(),
                    environment_id: cfg.env_id.clone(),
                },
                Arc::clone(&metrics),
            )
        });

        let (state_tx, _) = watch::channel(ConnectionState::Initializing);
        let dispatcher = StreamDispatcher::new(
            Arc::clone(&store),
            streams.max_connection_time,
            Arc::clone(&metrics),
        );

        Arc::new(EnvironmentContext {
            name: cfg.name.clone(),
            secure_mode: cfg.secure_mode,
            streams: streams.clone(),
            store,
            dispatcher,
            events,
            metrics,
            credentials: RwLock::new(CredentialState {
                credentials,
                deprecated: HashSet::new(),
                primary_sdk_key: cfg.sdk_key.clone(),
            }),
            datasource: Mutex::new(None),
            ds_base: DataSourceConfig {
                sdk_key: cfg.sdk_key.clone(),
                stream_uri: cfg
                    .stream_uri
                    .clone()
                    .unwrap_or_else(|| upstream.stream_uri.clone()),
                base_uri: cfg
                    .base_uri
                    .clone()
                    .unwrap_or_else(|| upstream.base_uri.clone()),
                polling: upstream.polling,
                poll_interval: upstream.poll_interval,
                request_timeout: upstream.init_timeout,
            },
            state_tx,
        })
    }

    /// Convenience constructor with the default in-memory store.
    pub fn with_memory_store(
        cfg: &EnvironmentConfig,
        upstream: &UpstreamConfig,
        streams: &StreamConfig,
        events: Option<&EventsConfig>,
    ) -> Arc<Self> {
        Self::new(cfg, upstream, streams, events, Arc::new(InMemoryDataStore::new()))
    }

    /// Start the upstream data source with the current primary key.
    pub async fn start_data_source(self: &Arc<Self>) {
        let sdk_key = {
            let creds = self.credentials.read().await;
            creds.primary_sdk_key.clone()
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = datasource::start(
            DataSourceConfig {
                sdk_key,
                ..self.ds_base.clone()
            },
            Arc::clone(&self.store),
            self.state_tx.clone(),
            ready_tx,
        );
        *self.datasource.lock().await = Some(handle);

        let name = self.name.clone();
        tokio::spawn(async move {
            if ready_rx.await.is_ok() {
                info!(environment = %name, "environment ready");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Credential lifecycle
    // -----------------------------------------------------------------------

    /// True when `credential` authenticates against this environment
    /// (deprecated credentials still do).
    pub async fn authenticates(&self, credential: &Credential) -> bool {
        self.credentials.read().await.credentials.contains(credential)
    }

    /// Credentials to show in lookups: the active, non-deprecated set.
    pub async fn listed_credentials(&self) -> Vec<Credential> {
        let creds = self.credentials.read().await;
        creds
            .credentials
            .iter()
            .filter(|c| !creds.deprecated.contains(c))
            .cloned()
            .collect()
    }

    /// Add a credential.  A server key that differs from the one the data
    /// source uses triggers zero-loss rotation: the old source keeps
    /// running until the replacement signals readiness.
    pub async fn add_credential(self: &Arc<Self>, credential: Credential) {
        {
            let mut creds = self.credentials.write().await;
            if !creds.credentials.insert(credential.clone()) {
                return;
            }
            if let Credential::SdkKey(new_key) = &credential {
                if *new_key != creds.primary_sdk_key {
                    creds.primary_sdk_key = new_key.clone();
                } else {
                    return;
                }
            }
        }

        match &credential {
            Credential::SdkKey(new_key) => {
                if let Some(events) = &self.events {
                    let new_key = new_key.clone();
                    events.update_auth(move |auth| auth.sdk_key = new_key);
                }
                self.rotate_data_source(credential.value().to_owned()).await;
            }
            Credential::MobileKey(new_key) => {
                if let Some(events) = &self.events {
                    let new_key = new_key.clone();
                    events.update_auth(move |auth| auth.mobile_key = Some(new_key));
                }
            }
            Credential::EnvironmentId(new_id) => {
                if let Some(events) = &self.events {
                    let new_id = new_id.clone();
                    events.update_auth(move |auth| auth.environment_id = Some(new_id));
                }
            }
        }
    }

    async fn rotate_data_source(self: &Arc<Self>, new_key: String) {
        info!(environment = %self.name, "rotating server SDK key; starting replacement data source");
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = datasource::start(
            DataSourceConfig {
                sdk_key: new_key,
                ..self.ds_base.clone()
            },
            Arc::clone(&self.store),
            self.state_tx.clone(),
            ready_tx,
        );

        let env = Arc::clone(self);
        tokio::spawn(async move {
            match ready_rx.await {
                Ok(()) => {
                    // Zero-loss handover: stop the old source only now.
                    let mut guard = env.datasource.lock().await;
                    if let Some(old) = guard.replace(handle) {
                        old.stop();
                    }
                    info!(environment = %env.name, "server SDK key rotation complete");
                }
                Err(_) => {
                    warn!(environment = %env.name, "replacement data source never became ready");
                    handle.stop();
                }
            }
        });
    }

    /// Deprecate: keeps authenticating, disappears from lookups.
    pub async fn deprecate_credential(&self, credential: &Credential) {
        let mut creds = self.credentials.write().await;
        if creds.credentials.contains(credential) {
            creds.deprecated.insert(credential.clone());
        }
    }

    /// Remove a credential.  Server keys additionally close all server-side
    /// streams authenticated with them.
    pub async fn remove_credential(&self, credential: &Credential) {
        let removed = {
            let mut creds = self.credentials.write().await;
            creds.deprecated.remove(credential);
            creds.credentials.remove(credential)
        };
        if removed && credential.is_sdk_key() {
            self.dispatcher.revoke_server_key(credential.value());
        }
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Tear down in dependency order: data source, fan-out, event relay.
    /// The store is dropped with the context.
    pub async fn close(&self) {
        if let Some(handle) = self.datasource.lock().await.take() {
            handle.stop();
        }
        self.dispatcher.close();
        if let Some(events) = &self.events {
            events.close().await;
        }
        info!(environment = %self.name, "environment closed");
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All configured environments, addressable by credential.
pub struct EnvironmentRegistry {
    envs: RwLock<Vec<Arc<EnvironmentContext>>>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        EnvironmentRegistry {
            envs: RwLock::new(Vec::new()),
        }
    }

    pub async fn insert(&self, env: Arc<EnvironmentContext>) {
        self.envs.write().await.push(env);
    }

    /// Remove and close the named environment.
    pub async fn remove(&self, name: &str) -> bool {
        let env = {
            let mut envs = self.envs.write().await;
            match envs.iter().position(|e| e.name == name) {
                Some(index) => envs.remove(index),
                None => return false,
            }
        };
        env.close().await;
        true
    }

    pub async fn find(&self, credential: &Credential) -> Option<Arc<EnvironmentContext>> {
        let envs = self.envs.read().await;
        for env in envs.iter() {
            if env.authenticates(credential).await {
                return Some(Arc::clone(env));
            }
        }
        None
    }

    pub async fn all(&self) -> Vec<Arc<EnvironmentContext>> {
        self.envs.read().await.clone()
    }
}

impl Default for EnvironmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    fn test_config() -> crate::config::RelayConfig {
        load_config_from_str(
            r#"
            schema_version = 1
            [upstream]
            stream_uri = "http://127.0.0.1:1"
            base_uri = "http://127.0.0.1:1"
            events_uri = "http://127.0.0.1:1"
            [[environments]]
            name = "test"
            sdk_key = "sdk-old"
            mobile_key = "mob-1"
            env_id = "env-1"
            "#,
        )
        .unwrap()
    }

    fn make_env(cfg: &crate::config::RelayConfig) -> Arc<EnvironmentContext> {
        EnvironmentContext::with_memory_store(
            &cfg.environments[0],
            &cfg.upstream,
            &cfg.streams,
            Some(&cfg.events),
        )
    }

    #[tokio::test]
    async fn all_three_credential_types_authenticate() {
        let cfg = test_config();
        let env = make_env(&cfg);

        assert!(env.authenticates(&Credential::SdkKey("sdk-old".into())).await);
        assert!(env.authenticates(&Credential::MobileKey("mob-1".into())).await);
        assert!(env.authenticates(&Credential::EnvironmentId("env-1".into())).await);
        assert!(!env.authenticates(&Credential::SdkKey("mob-1".into())).await);
        assert!(!env.authenticates(&Credential::SdkKey("wrong".into())).await);
    }

    #[tokio::test]
    async fn deprecated_credentials_authenticate_but_are_not_listed() {
        let cfg = test_config();
        let env = make_env(&cfg);
        let mobile = Credential::MobileKey("mob-1".into());

        env.deprecate_credential(&mobile).await;
        assert!(env.authenticates(&mobile).await);
        assert!(!env.listed_credentials().await.contains(&mobile));
    }

    #[tokio::test]
    async fn removing_a_credential_stops_authentication() {
        let cfg = test_config();
        let env = make_env(&cfg);
        let old = Credential::SdkKey("sdk-old".into());

        env.add_credential(Credential::SdkKey("sdk-new".into())).await;
        assert!(env.authenticates(&old).await);

        env.remove_credential(&old).await;
        assert!(!env.authenticates(&old).await);
        assert!(env.authenticates(&Credential::SdkKey("sdk-new".into())).await);
    }

    #[tokio::test]
    async fn registry_routes_credentials_to_environments() {
        let cfg = test_config();
        let registry = EnvironmentRegistry::new();
        registry.insert(make_env(&cfg)).await;

        assert!(registry
            .find(&Credential::SdkKey("sdk-old".into()))
            .await
            .is_some());
        assert!(registry
            .find(&Credential::SdkKey("unknown".into()))
            .await
            .is_none());

        assert!(registry.remove("test").await);
        assert!(registry
            .find(&Credential::SdkKey("sdk-old".into()))
            .await
            .is_none());
        assert!(!registry.remove("test").await);
    }

    #[tokio::test]
    async fn adding_an_existing_credential_is_a_no_op() {
        let cfg = test_config();
        let env = make_env(&cfg);
        env.add_credential(Credential::SdkKey("sdk-old".into())).await;
        assert_eq!(env.listed_credentials().await.len(), 3);
    }
}
