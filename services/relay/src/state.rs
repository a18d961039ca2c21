use crate::config::RelayConfig;
use crate::envs::{EnvironmentContext, EnvironmentRegistry};
use std::sync::Arc;

/// Shared handler state: the environment registry.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<EnvironmentRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<EnvironmentRegistry>) -> Self {
        AppState { registry }
    }

    /// Build the registry from config and start every environment's data
    /// source.  Stores are in-memory; callers wanting a persistent backend
    /// construct contexts with [`EnvironmentContext::new`] themselves.
    pub async fn from_config(config: &RelayConfig) -> Self {
        let registry = Arc::new(EnvironmentRegistry::new());
        let events = config.events.enabled.then_some(&config.events);
        for env_cfg in &config.environments {
            let env = EnvironmentContext::with_memory_store(
                env_cfg,
                &config.upstream,
                &config.streams,
                events,
            );
            env.start_data_source().await;
            registry.insert(env).await;
        }
        AppState::new(registry)
    }
}
