//! Operational status resource.
//!
//! One entry per environment with redacted credentials, upstream
//! connection state, and whether the replica has been initialized.

use crate::credentials::Credential;
use crate::datasource::ConnectionState;
use crate::state::AppState;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize)]
struct StatusBody {
    environments: BTreeMap<String, EnvironmentStatus>,
    status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    sdk_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mobile_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env_id: Option<String>,
    status: &'static str,
    initialized: bool,
    server_connections: i64,
    client_connections: i64,
}

fn state_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Initializing => "INITIALIZING",
        ConnectionState::Connected => "CONNECTED",
        ConnectionState::Failed => "FAILED",
    }
}

pub async fn status(State(state): State<AppState>) -> Response {
    let mut environments = BTreeMap::new();
    let mut healthy = true;

    for env in state.registry.all().await {
        let counters = env.metrics.snapshot();
        let mut entry = EnvironmentStatus {
            sdk_key: None,
            mobile_key: None,
            env_id: None,
            status: state_label(env.connection_state()),
            initialized: env.store.initialized(),
            server_connections: counters.server_connections,
            client_connections: counters.client_connections,
        };
        for credential in env.listed_credentials().await {
            match credential {
                Credential::SdkKey(_) => entry.sdk_key = Some(credential.masked()),
                Credential::MobileKey(_) => entry.mobile_key = Some(credential.masked()),
                // Environment ids are public; no point redacting them.
                Credential::EnvironmentId(id) => entry.env_id = Some(id),
            }
        }
        if entry.status == "FAILED" {
            healthy = false;
        }
        environments.insert(env.name.clone(), entry);
    }

    Json(StatusBody {
        environments,
        status: if healthy { "healthy" } else { "degraded" },
    })
    .into_response()
}
